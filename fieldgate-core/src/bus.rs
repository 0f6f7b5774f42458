//! Buses and the driver seam behind them.
//!
//! A [`Bus`] owns one [`BusDriver`] and tracks its lifecycle state. Devices
//! reach the hardware through [`Bus::modbus`], which refuses access until
//! the bus is active.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::Arc;

use crate::device::DeviceType;
use crate::error::DriverError;

/// Transport behind a bus.
#[async_trait]
pub trait BusDriver: Send + Sync {
    /// Short driver name for logs and errors.
    fn kind(&self) -> &'static str;

    /// Open the transport. The bus becomes active only if this succeeds.
    async fn activate(&self) -> Result<(), DriverError>;

    /// Close the transport. Called at shutdown for synchronous buses.
    async fn deactivate(&self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Register-level access, for drivers that speak Modbus.
    fn modbus(&self) -> Option<&dyn ModbusIo> {
        None
    }

    /// Add driver-specific fields to the bus snapshot.
    fn describe(&self, _fields: &mut Map<String, Value>) {}
}

/// Modbus register access addressed by unit id.
#[async_trait]
pub trait ModbusIo: Send + Sync {
    async fn read_coils(&self, unit: u8, address: u16, count: u16)
    -> Result<Vec<bool>, DriverError>;

    async fn read_discrete_inputs(
        &self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, DriverError>;

    async fn read_holding_registers(
        &self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, DriverError>;

    async fn read_input_registers(
        &self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, DriverError>;

    async fn write_coil(&self, unit: u8, address: u16, value: bool) -> Result<(), DriverError>;

    async fn write_registers(
        &self,
        unit: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), DriverError>;
}

/// Lifecycle state of a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Constructed,
    Active,
    Inactive,
}

impl BusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusState::Constructed => "constructed",
            BusState::Active => "active",
            BusState::Inactive => "inactive",
        }
    }
}

/// A configured bus.
pub struct Bus {
    name: String,
    device_type: DeviceType,
    driver: Arc<dyn BusDriver>,
    state: Mutex<BusState>,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.name)
            .field("device_type", &self.device_type)
            .field("driver", &self.driver.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl Bus {
    /// Create a new bus in the constructed state.
    pub fn new(
        name: impl Into<String>,
        device_type: DeviceType,
        driver: Arc<dyn BusDriver>,
    ) -> Self {
        Self {
            name: name.into(),
            device_type,
            driver,
            state: Mutex::new(BusState::Constructed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn driver(&self) -> &Arc<dyn BusDriver> {
        &self.driver
    }

    pub fn state(&self) -> BusState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == BusState::Active
    }

    /// Activate the driver and mark the bus active.
    pub async fn activate(&self) -> Result<(), DriverError> {
        self.driver.activate().await?;
        *self.state.lock() = BusState::Active;
        tracing::info!(bus = %self.name, driver = self.driver.kind(), "Bus activated");
        Ok(())
    }

    /// Deactivate the driver. The bus is marked inactive even if the
    /// driver reports an error.
    pub async fn deactivate(&self) -> Result<(), DriverError> {
        *self.state.lock() = BusState::Inactive;
        let result = self.driver.deactivate().await;
        tracing::info!(bus = %self.name, "Bus deactivated");
        result
    }

    /// Register access for devices on this bus.
    pub fn modbus(&self) -> Result<&dyn ModbusIo, DriverError> {
        if !self.is_active() {
            return Err(DriverError::NotActive(self.name.clone()));
        }
        self.driver
            .modbus()
            .ok_or(DriverError::Unsupported(self.driver.kind()))
    }

    pub(crate) fn write_fields(&self, fields: &mut Map<String, Value>) {
        fields.insert("driver".to_string(), json!(self.driver.kind()));
        fields.insert("state".to_string(), json!(self.state().as_str()));
        self.driver.describe(fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver;

    #[async_trait]
    impl BusDriver for NullDriver {
        fn kind(&self) -> &'static str {
            "null"
        }

        async fn activate(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    struct FailingDriver;

    #[async_trait]
    impl BusDriver for FailingDriver {
        fn kind(&self) -> &'static str {
            "failing"
        }

        async fn activate(&self) -> Result<(), DriverError> {
            Err(DriverError::Connection("refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let bus = Bus::new("B1", DeviceType::TcpBus, Arc::new(NullDriver));
        assert_eq!(bus.state(), BusState::Constructed);
        assert!(matches!(bus.modbus(), Err(DriverError::NotActive(_))));

        bus.activate().await.unwrap();
        assert!(bus.is_active());
        // Active, but the null driver has no register access
        assert!(matches!(bus.modbus(), Err(DriverError::Unsupported("null"))));

        bus.deactivate().await.unwrap();
        assert_eq!(bus.state(), BusState::Inactive);
    }

    #[tokio::test]
    async fn test_failed_activation_keeps_state() {
        let bus = Bus::new("B2", DeviceType::TcpBus, Arc::new(FailingDriver));
        assert!(bus.activate().await.is_err());
        assert_eq!(bus.state(), BusState::Constructed);
    }
}
