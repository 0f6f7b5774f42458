//! Modbus TCP and RTU bus drivers.
//!
//! One client context is shared by every slave on the bus. Requests are
//! serialized through an async mutex and addressed by switching the unit
//! id. A transport error drops the context so the next request reconnects.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::fmt::{Debug, Display};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::error::Elapsed;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

use crate::bus::{BusDriver, ModbusIo};
use crate::error::DriverError;

/// Settings of a MODBUSTCP bus.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpSettings {
    /// Host name or IP address (default: 127.0.0.1)
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// TCP port (default: 502)
    #[serde(default = "default_tcp_port")]
    pub port: u16,

    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_tcp_port() -> u16 {
    502
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Settings of a MODBUSRTU bus.
#[derive(Debug, Clone, Deserialize)]
pub struct RtuSettings {
    /// Serial port path (e.g., "/dev/ttyNS0")
    pub port: String,

    /// Baud rate (default: 19200)
    #[serde(default = "default_baud_rate")]
    pub baudrate: u32,

    /// Parity: "N", "E" or "O" (default: "N")
    #[serde(default = "default_parity")]
    pub parity: String,

    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stopbits: u8,

    /// Data bits: 5-8 (default: 8)
    #[serde(default = "default_data_bits")]
    pub databits: u8,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    19200
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_data_bits() -> u8 {
    8
}

impl RtuSettings {
    pub fn validate(&self) -> Result<(), String> {
        self.parity()?;
        if !matches!(self.stopbits, 1 | 2) {
            return Err(format!("invalid stopbits {} (use 1 or 2)", self.stopbits));
        }
        if !(5..=8).contains(&self.databits) {
            return Err(format!("invalid databits {} (use 5-8)", self.databits));
        }
        Ok(())
    }

    fn parity(&self) -> Result<tokio_serial::Parity, String> {
        match self.parity.to_ascii_uppercase().as_str() {
            "N" | "NONE" => Ok(tokio_serial::Parity::None),
            "E" | "EVEN" => Ok(tokio_serial::Parity::Even),
            "O" | "ODD" => Ok(tokio_serial::Parity::Odd),
            _ => Err(format!("invalid parity '{}' (use N, E or O)", self.parity)),
        }
    }
}

#[derive(Debug, Clone)]
enum Endpoint {
    Tcp(TcpSettings),
    Rtu(RtuSettings),
}

/// Driver for a Modbus TCP or RTU bus.
pub struct ModbusDriver {
    endpoint: Endpoint,
    timeout: Duration,
    context: Mutex<Option<Context>>,
}

impl ModbusDriver {
    /// Create a new Modbus TCP driver.
    pub fn tcp(settings: TcpSettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            endpoint: Endpoint::Tcp(settings),
            context: Mutex::new(None),
        }
    }

    /// Create a new Modbus RTU driver.
    pub fn rtu(settings: RtuSettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            endpoint: Endpoint::Rtu(settings),
            context: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Context, DriverError> {
        match &self.endpoint {
            Endpoint::Tcp(settings) => {
                let target = format!("{}:{}", settings.hostname, settings.port);
                let addr = tokio::net::lookup_host(&target)
                    .await
                    .map_err(|e| DriverError::Connection(format!("{}: {}", target, e)))?
                    .next()
                    .ok_or_else(|| {
                        DriverError::Connection(format!("{}: no address found", target))
                    })?;

                let ctx = tokio::time::timeout(self.timeout, tcp::connect(addr))
                    .await
                    .map_err(|_| DriverError::Connection("Connection timeout".to_string()))?
                    .map_err(|e| DriverError::Connection(e.to_string()))?;

                tracing::debug!(%addr, "Modbus TCP connected");
                Ok(ctx)
            }
            Endpoint::Rtu(settings) => {
                let parity = settings.parity().map_err(DriverError::Connection)?;

                let stop_bits = match settings.stopbits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };

                let data_bits = match settings.databits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };

                let builder = tokio_serial::new(&settings.port, settings.baudrate)
                    .parity(parity)
                    .stop_bits(stop_bits)
                    .data_bits(data_bits);

                let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    DriverError::Connection(format!("Serial open failed: {}", e))
                })?;

                tracing::debug!(port = %settings.port, "Modbus RTU attached");
                Ok(rtu::attach(serial))
            }
        }
    }

    /// Lock the shared context, connecting first if needed, and address
    /// the requested unit.
    async fn session(&self, unit: u8) -> Result<MutexGuard<'_, Option<Context>>, DriverError> {
        let mut guard = self.context.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        if let Some(ctx) = guard.as_mut() {
            ctx.set_slave(Slave(unit));
        }
        Ok(guard)
    }

    /// Map a request outcome, dropping the context on transport failure.
    fn settle<T, X: Debug, E: Display>(
        &self,
        slot: &mut Option<Context>,
        outcome: Result<Result<Result<T, X>, E>, Elapsed>,
        failure: fn(String) -> DriverError,
    ) -> Result<T, DriverError> {
        match outcome {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(exception))) => Err(DriverError::Exception(format!("{:?}", exception))),
            Ok(Err(e)) => {
                *slot = None;
                Err(failure(e.to_string()))
            }
            Err(_) => {
                *slot = None;
                Err(DriverError::Timeout(self.timeout.as_millis() as u64))
            }
        }
    }
}

fn not_connected() -> DriverError {
    DriverError::Connection("no client context".to_string())
}

#[async_trait]
impl BusDriver for ModbusDriver {
    fn kind(&self) -> &'static str {
        match self.endpoint {
            Endpoint::Tcp(_) => "modbus-tcp",
            Endpoint::Rtu(_) => "modbus-rtu",
        }
    }

    async fn activate(&self) -> Result<(), DriverError> {
        let ctx = self.connect().await?;
        *self.context.lock().await = Some(ctx);
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), DriverError> {
        if let Some(mut ctx) = self.context.lock().await.take() {
            if let Err(e) = ctx.disconnect().await {
                tracing::debug!(error = %e, "Modbus disconnect failed");
            }
        }
        Ok(())
    }

    fn modbus(&self) -> Option<&dyn ModbusIo> {
        Some(self)
    }

    fn describe(&self, fields: &mut Map<String, Value>) {
        match &self.endpoint {
            Endpoint::Tcp(settings) => {
                fields.insert("hostname".to_string(), json!(settings.hostname));
                fields.insert("port".to_string(), json!(settings.port));
            }
            Endpoint::Rtu(settings) => {
                fields.insert("port".to_string(), json!(settings.port));
                fields.insert("baudrate".to_string(), json!(settings.baudrate));
                fields.insert("parity".to_string(), json!(settings.parity));
            }
        }
    }
}

#[async_trait]
impl ModbusIo for ModbusDriver {
    async fn read_coils(&self, unit: u8, address: u16, count: u16) -> Result<Vec<bool>, DriverError> {
        let mut guard = self.session(unit).await?;
        let ctx = guard.as_mut().ok_or_else(not_connected)?;
        let outcome = tokio::time::timeout(self.timeout, ctx.read_coils(address, count)).await;
        self.settle(&mut guard, outcome, DriverError::Read)
    }

    async fn read_discrete_inputs(
        &self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, DriverError> {
        let mut guard = self.session(unit).await?;
        let ctx = guard.as_mut().ok_or_else(not_connected)?;
        let outcome =
            tokio::time::timeout(self.timeout, ctx.read_discrete_inputs(address, count)).await;
        self.settle(&mut guard, outcome, DriverError::Read)
    }

    async fn read_holding_registers(
        &self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, DriverError> {
        let mut guard = self.session(unit).await?;
        let ctx = guard.as_mut().ok_or_else(not_connected)?;
        let outcome =
            tokio::time::timeout(self.timeout, ctx.read_holding_registers(address, count)).await;
        self.settle(&mut guard, outcome, DriverError::Read)
    }

    async fn read_input_registers(
        &self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, DriverError> {
        let mut guard = self.session(unit).await?;
        let ctx = guard.as_mut().ok_or_else(not_connected)?;
        let outcome =
            tokio::time::timeout(self.timeout, ctx.read_input_registers(address, count)).await;
        self.settle(&mut guard, outcome, DriverError::Read)
    }

    async fn write_coil(&self, unit: u8, address: u16, value: bool) -> Result<(), DriverError> {
        let mut guard = self.session(unit).await?;
        let ctx = guard.as_mut().ok_or_else(not_connected)?;
        let outcome =
            tokio::time::timeout(self.timeout, ctx.write_single_coil(address, value)).await;
        self.settle(&mut guard, outcome, DriverError::Write)
    }

    async fn write_registers(
        &self,
        unit: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), DriverError> {
        let mut guard = self.session(unit).await?;
        let ctx = guard.as_mut().ok_or_else(not_connected)?;
        let outcome = match values {
            [value] => {
                tokio::time::timeout(self.timeout, ctx.write_single_register(address, *value))
                    .await
            }
            _ => {
                tokio::time::timeout(self.timeout, ctx.write_multiple_registers(address, values))
                    .await
            }
        };
        self.settle(&mut guard, outcome, DriverError::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_defaults() {
        let settings: TcpSettings = serde_json::from_value(json!({})).unwrap();
        assert_eq!(settings.hostname, "127.0.0.1");
        assert_eq!(settings.port, 502);
    }

    #[test]
    fn test_rtu_defaults() {
        let settings: RtuSettings =
            serde_json::from_value(json!({ "port": "/dev/ttyNS0" })).unwrap();
        assert_eq!(settings.baudrate, 19200);
        assert_eq!(settings.parity, "N");
        assert_eq!(settings.stopbits, 1);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_rtu_invalid_parity() {
        let settings: RtuSettings =
            serde_json::from_value(json!({ "port": "/dev/ttyNS0", "parity": "X" })).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rtu_requires_port() {
        let result: Result<RtuSettings, _> = serde_json::from_value(json!({ "baudrate": 9600 }));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_activate_unreachable_host() {
        let driver = ModbusDriver::tcp(TcpSettings {
            hostname: "127.0.0.1".to_string(),
            port: 1,
            timeout_ms: 200,
        });
        assert!(matches!(
            driver.activate().await,
            Err(DriverError::Connection(_))
        ));
    }
}
