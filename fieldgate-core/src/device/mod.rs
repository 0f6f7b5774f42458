//! Registered devices.
//!
//! A [`Device`] carries the identity every registry entry shares (type,
//! circuit, global id, optional alias and group) plus a [`DeviceKind`]
//! with the type-specific state. Devices report their own state changes
//! to the [`Dispatcher`] they were built with.

mod point;
mod sensor;
mod slave;
mod types;

pub use point::{AnalogPoint, CoilPoint, InputPoint, PointLink, RegisterPoint, Scaling};
pub use sensor::{OneWireSensor, SUPPORTED_FAMILIES, SensorSettings};
pub use slave::{Area, ModbusSlave, ScanBlock, SlaveSettings};
pub use types::DeviceType;

use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::bus::Bus;
use crate::command::{Operation, Params};
use crate::dispatch::Dispatcher;
use crate::error::{DriverError, GatewayError, Result};

/// Type-specific part of a device.
#[derive(Debug)]
pub enum DeviceKind {
    Relay(CoilPoint),
    Led(CoilPoint),
    Input(InputPoint),
    Register(RegisterPoint),
    AnalogInput(AnalogPoint),
    AnalogOutput(AnalogPoint),
    Sensor(OneWireSensor),
    ModbusSlave(ModbusSlave),
    Bus(Arc<Bus>),
}

/// A value observed on the bus during a scan.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Sample<'a> {
    Bit(bool),
    Words(&'a [u16]),
}

/// A registered device or bus.
pub struct Device {
    dev_id: u32,
    circuit: String,
    group: Option<String>,
    alias: RwLock<Option<String>>,
    kind: DeviceKind,
    events: Arc<Dispatcher>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("dev_id", &self.dev_id)
            .field("type", &self.device_type())
            .field("circuit", &self.circuit)
            .field("group", &self.group)
            .field("alias", &*self.alias.read())
            .finish()
    }
}

impl Device {
    /// Create a new device.
    pub fn new(
        dev_id: u32,
        circuit: impl Into<String>,
        kind: DeviceKind,
        events: Arc<Dispatcher>,
    ) -> Self {
        Self {
            dev_id,
            circuit: circuit.into(),
            group: None,
            alias: RwLock::new(None),
            kind,
            events,
        }
    }

    /// Attach the device to a group (the owning slave's circuit).
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn dev_id(&self) -> u32 {
        self.dev_id
    }

    pub fn circuit(&self) -> &str {
        &self.circuit
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn alias(&self) -> Option<String> {
        self.alias.read().clone()
    }

    /// Replace the alias, returning the previous one.
    pub(crate) fn set_alias(&self, alias: Option<String>) -> Option<String> {
        std::mem::replace(&mut *self.alias.write(), alias)
    }

    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    pub fn device_type(&self) -> DeviceType {
        match &self.kind {
            DeviceKind::Relay(_) => DeviceType::Relay,
            DeviceKind::Led(_) => DeviceType::Led,
            DeviceKind::Input(_) => DeviceType::Input,
            DeviceKind::Register(_) => DeviceType::Register,
            DeviceKind::AnalogInput(_) => DeviceType::Ai,
            DeviceKind::AnalogOutput(_) => DeviceType::Ao,
            DeviceKind::Sensor(_) => DeviceType::Sensor,
            DeviceKind::ModbusSlave(_) => DeviceType::ModbusSlave,
            DeviceKind::Bus(bus) => bus.device_type(),
        }
    }

    pub fn as_bus(&self) -> Option<&Arc<Bus>> {
        match &self.kind {
            DeviceKind::Bus(bus) => Some(bus),
            _ => None,
        }
    }

    pub fn as_slave(&self) -> Option<&ModbusSlave> {
        match &self.kind {
            DeviceKind::ModbusSlave(slave) => Some(slave),
            _ => None,
        }
    }

    pub fn as_sensor(&self) -> Option<&OneWireSensor> {
        match &self.kind {
            DeviceKind::Sensor(sensor) => Some(sensor),
            _ => None,
        }
    }

    /// Full state as a JSON object.
    pub fn snapshot(&self) -> Value {
        let mut fields = Map::new();
        fields.insert("dev".to_string(), json!(self.device_type().as_str()));
        fields.insert("circuit".to_string(), json!(self.circuit));
        fields.insert("dev_id".to_string(), json!(self.dev_id));
        if let Some(alias) = self.alias() {
            fields.insert("alias".to_string(), json!(alias));
        }
        if let Some(group) = &self.group {
            fields.insert("group".to_string(), json!(group));
        }

        match &self.kind {
            DeviceKind::Relay(p) | DeviceKind::Led(p) => p.write_fields(&mut fields),
            DeviceKind::Input(p) => p.write_fields(&mut fields),
            DeviceKind::Register(p) => p.write_fields(&mut fields),
            DeviceKind::AnalogInput(p) | DeviceKind::AnalogOutput(p) => {
                p.write_fields(&mut fields)
            }
            DeviceKind::Sensor(s) => s.write_fields(&mut fields),
            DeviceKind::ModbusSlave(s) => s.write_fields(&mut fields),
            DeviceKind::Bus(b) => b.write_fields(&mut fields),
        }

        Value::Object(fields)
    }

    /// Run a validated operation against the device.
    pub async fn apply(self: &Arc<Self>, operation: Operation, params: &Params) -> Result<Value> {
        match operation {
            Operation::Full => Ok(self.snapshot()),
            Operation::Set => self.set(params).await,
            Operation::Scan => self.scan().await,
        }
    }

    async fn set(self: &Arc<Self>, params: &Params) -> Result<Value> {
        match &self.kind {
            DeviceKind::Relay(point) | DeviceKind::Led(point) => {
                let timeout = params.float("timeout");
                match params.bool("value") {
                    Some(value) => {
                        if point.cancel_revert() {
                            tracing::debug!(circuit = %self.circuit, "Pulse revert cancelled");
                        }
                        let previous = point.write(value).await?;
                        self.notify_status();

                        if let Some(timeout) = timeout.filter(|t| *t > 0.0) {
                            // An unknown previous state reverts to the opposite value
                            let revert = previous.unwrap_or(!value);
                            point.set_revert(self.schedule_revert(revert, timeout));
                        }
                    }
                    None if timeout.is_some() => {
                        return Err(GatewayError::validation("timeout requires a value"));
                    }
                    None => {}
                }
            }
            DeviceKind::Register(point) => {
                let value = params
                    .int("value")
                    .and_then(|v| u16::try_from(v).ok())
                    .ok_or_else(|| GatewayError::validation("value must be 0-65535"))?;
                point.write(value).await?;
                self.notify_status();
            }
            DeviceKind::AnalogOutput(point) => {
                let value = params
                    .float("value")
                    .ok_or_else(|| GatewayError::validation("value is required"))?;
                point.write(value).await?;
                self.notify_status();
            }
            DeviceKind::ModbusSlave(slave) => {
                if slave.configure(params.bool("scan_enabled"), params.float("scan_frequency"))? {
                    self.notify_config();
                }
            }
            _ => return Err(self.unsupported("set")),
        }
        Ok(self.snapshot())
    }

    async fn scan(&self) -> Result<Value> {
        match &self.kind {
            DeviceKind::ModbusSlave(slave) => {
                if !slave.bus().is_active() {
                    return Err(DriverError::NotActive(slave.bus().name().to_string()).into());
                }
                slave.scan_once().await;
                if slave.scan_enabled() {
                    slave.start_scanning()?;
                }
                Ok(self.snapshot())
            }
            _ => Err(self.unsupported("scan")),
        }
    }

    /// Pulse mode: drive the coil back after `secs` seconds.
    fn schedule_revert(self: &Arc<Self>, value: bool, secs: f64) -> JoinHandle<()> {
        let device = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            let point = match &device.kind {
                DeviceKind::Relay(p) | DeviceKind::Led(p) => p,
                _ => return,
            };
            match point.write(value).await {
                Ok(_) => device.notify_status(),
                Err(e) => tracing::warn!(
                    circuit = %device.circuit,
                    error = %e,
                    "Failed to revert output after timeout"
                ),
            }
        })
    }

    fn unsupported(&self, operation: &str) -> GatewayError {
        GatewayError::UnknownOperation {
            device_type: self.device_type().to_string(),
            operation: operation.to_string(),
        }
    }

    /// Feed a scanned value into the cache, notifying on change.
    pub(crate) fn ingest(&self, sample: Sample<'_>) {
        let changed = match (&self.kind, sample) {
            (DeviceKind::Relay(p) | DeviceKind::Led(p), Sample::Bit(v)) => p.update(v),
            (DeviceKind::Input(p), Sample::Bit(v)) => p.update(v),
            (DeviceKind::Register(p), Sample::Words(w)) => {
                w.first().is_some_and(|v| p.update(*v))
            }
            (DeviceKind::AnalogInput(p) | DeviceKind::AnalogOutput(p), Sample::Words(w)) => {
                p.update_raw(w)
            }
            _ => false,
        };
        if changed {
            self.notify_status();
        }
    }

    /// Record a 1-Wire read attempt, notifying on change.
    pub(crate) fn record_reading(&self, reading: std::result::Result<f64, DriverError>) {
        if let DeviceKind::Sensor(sensor) = &self.kind {
            if sensor.record(reading) {
                self.notify_status();
            }
        }
    }

    pub(crate) fn notify_status(&self) {
        self.events.status_changed(self);
    }

    pub(crate) fn notify_config(&self) {
        self.events.config_changed(self);
    }
}
