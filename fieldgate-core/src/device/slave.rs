//! Modbus slave units and their periodic scanning.

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{Device, DeviceType, Sample};
use crate::bus::{Bus, ModbusIo};
use crate::error::{DriverError, GatewayError};

/// Device entry settings for a slave on a MODBUSTCP / MODBUSRTU bus.
#[derive(Debug, Clone, Deserialize)]
pub struct SlaveSettings {
    /// Name of an entry in `hw_definitions`
    pub model: String,

    /// Modbus unit id (default: 1)
    #[serde(rename = "slave-id", alias = "slave_id", default = "default_unit_id")]
    pub unit_id: u8,

    /// Scans per second (default: 1)
    #[serde(default = "default_scan_frequency")]
    pub scan_frequency: f64,

    #[serde(default = "default_true")]
    pub scan_enabled: bool,
}

fn default_unit_id() -> u8 {
    1
}

fn default_scan_frequency() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl SlaveSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.scan_frequency.is_finite() && self.scan_frequency > 0.0) {
            return Err(format!(
                "scan_frequency must be positive, got {}",
                self.scan_frequency
            ));
        }
        Ok(())
    }
}

/// Modbus data table a block is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl Area {
    /// Table backing a point type, `None` for non-Modbus types.
    pub fn for_point(device_type: DeviceType) -> Option<Area> {
        match device_type {
            DeviceType::Relay | DeviceType::Led => Some(Area::Coils),
            DeviceType::Input => Some(Area::DiscreteInputs),
            DeviceType::Register | DeviceType::Ao => Some(Area::HoldingRegisters),
            DeviceType::Ai => Some(Area::InputRegisters),
            _ => None,
        }
    }
}

/// Consecutive points read with a single request.
#[derive(Debug)]
pub struct ScanBlock {
    pub area: Area,
    pub start: u16,
    /// Registers per point (1 for bits and 16-bit values)
    pub stride: u16,
    pub points: Vec<Arc<Device>>,
}

impl ScanBlock {
    fn len(&self) -> u16 {
        self.stride * self.points.len() as u16
    }
}

#[derive(Debug)]
struct ScanTarget {
    circuit: String,
    bus: Arc<Bus>,
    unit: u8,
    blocks: Vec<ScanBlock>,
    last_comm: Mutex<Option<i64>>,
}

impl ScanTarget {
    /// Read every block once. Returns the number of blocks that failed.
    async fn scan_once(&self) -> usize {
        let io = match self.bus.modbus() {
            Ok(io) => io,
            Err(e) => {
                tracing::debug!(slave = %self.circuit, error = %e, "Skipping scan");
                return self.blocks.len();
            }
        };

        let mut failed = 0;
        for block in &self.blocks {
            if let Err(e) = self.scan_block(io, block).await {
                tracing::warn!(
                    slave = %self.circuit,
                    start = block.start,
                    error = %e,
                    "Failed to scan block"
                );
                failed += 1;
            }
        }

        if failed < self.blocks.len() {
            *self.last_comm.lock() = Some(chrono::Utc::now().timestamp_millis());
        }
        failed
    }

    async fn scan_block(&self, io: &dyn ModbusIo, block: &ScanBlock) -> Result<(), DriverError> {
        let count = block.len();
        match block.area {
            Area::Coils | Area::DiscreteInputs => {
                let bits = if block.area == Area::Coils {
                    io.read_coils(self.unit, block.start, count).await?
                } else {
                    io.read_discrete_inputs(self.unit, block.start, count).await?
                };
                for (point, bit) in block.points.iter().zip(bits) {
                    point.ingest(Sample::Bit(bit));
                }
            }
            Area::HoldingRegisters | Area::InputRegisters => {
                let words = if block.area == Area::HoldingRegisters {
                    io.read_holding_registers(self.unit, block.start, count)
                        .await?
                } else {
                    io.read_input_registers(self.unit, block.start, count)
                        .await?
                };
                let stride = block.stride.max(1) as usize;
                for (point, chunk) in block.points.iter().zip(words.chunks(stride)) {
                    point.ingest(Sample::Words(chunk));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct ScanSettings {
    enabled: bool,
    frequency: f64,
}

/// A Modbus unit whose points are refreshed by a scan task.
#[derive(Debug)]
pub struct ModbusSlave {
    target: Arc<ScanTarget>,
    model: String,
    scan: Mutex<ScanSettings>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl ModbusSlave {
    /// Create a new slave over already constructed point devices.
    pub fn new(
        circuit: impl Into<String>,
        bus: Arc<Bus>,
        settings: &SlaveSettings,
        blocks: Vec<ScanBlock>,
    ) -> Self {
        Self {
            target: Arc::new(ScanTarget {
                circuit: circuit.into(),
                bus,
                unit: settings.unit_id,
                blocks,
                last_comm: Mutex::new(None),
            }),
            model: settings.model.clone(),
            scan: Mutex::new(ScanSettings {
                enabled: settings.scan_enabled,
                frequency: settings.scan_frequency,
            }),
            scanner: Mutex::new(None),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn unit(&self) -> u8 {
        self.target.unit
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.target.bus
    }

    pub fn scan_enabled(&self) -> bool {
        self.scan.lock().enabled
    }

    pub fn scan_frequency(&self) -> f64 {
        self.scan.lock().frequency
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Point devices owned by this slave.
    pub fn points(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.target.blocks.iter().flat_map(|b| b.points.iter())
    }

    /// Initial read after the bus came up.
    pub async fn activate(&self) {
        let failed = self.target.scan_once().await;
        if failed > 0 {
            tracing::warn!(
                slave = %self.target.circuit,
                failed,
                "Initial scan incomplete"
            );
        }
    }

    /// Read all blocks now. Returns the number of failed blocks.
    pub async fn scan_once(&self) -> usize {
        self.target.scan_once().await
    }

    /// Start the periodic scan task. No-op when already scanning.
    pub fn start_scanning(&self) -> Result<(), DriverError> {
        if !self.target.bus.is_active() {
            return Err(DriverError::NotActive(self.target.bus.name().to_string()));
        }

        let mut scanner = self.scanner.lock();
        if scanner.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let period = Duration::from_secs_f64(1.0 / self.scan.lock().frequency);
        let target = Arc::clone(&self.target);
        tracing::debug!(slave = %target.circuit, ?period, "Starting scanner");

        *scanner = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                target.scan_once().await;
            }
        }));
        Ok(())
    }

    /// Stop the periodic scan task. Returns whether one was running.
    pub fn stop_scanning(&self) -> bool {
        match self.scanner.lock().take() {
            Some(handle) => {
                handle.abort();
                tracing::debug!(slave = %self.target.circuit, "Scanner stopped");
                true
            }
            None => false,
        }
    }

    /// Apply new scan settings. Returns whether anything changed.
    pub(crate) fn configure(
        &self,
        enabled: Option<bool>,
        frequency: Option<f64>,
    ) -> Result<bool, GatewayError> {
        let before = *self.scan.lock();
        let after = ScanSettings {
            enabled: enabled.unwrap_or(before.enabled),
            frequency: frequency.unwrap_or(before.frequency),
        };
        if after.enabled == before.enabled && after.frequency == before.frequency {
            return Ok(false);
        }
        *self.scan.lock() = after;

        let was_scanning = self.stop_scanning();
        if after.enabled && (was_scanning || enabled == Some(true)) {
            self.start_scanning()?;
        }
        Ok(true)
    }

    pub(crate) fn write_fields(&self, fields: &mut Map<String, Value>) {
        let scan = *self.scan.lock();
        fields.insert("model".to_string(), json!(self.model));
        fields.insert("slave_id".to_string(), json!(self.target.unit));
        fields.insert("bus".to_string(), json!(self.target.bus.name()));
        fields.insert("scan_enabled".to_string(), json!(scan.enabled));
        fields.insert("scan_frequency".to_string(), json!(scan.frequency));
        fields.insert("scanning".to_string(), json!(self.is_scanning()));
        fields.insert("last_comm".to_string(), json!(*self.target.last_comm.lock()));
    }
}
