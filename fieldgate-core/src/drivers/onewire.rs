//! 1-Wire bus driver backed by the kernel's w1 sysfs interface.
//!
//! Sensor files are read by a dedicated blocking worker thread. The async
//! side talks to it through a bounded request channel and gets each answer
//! back on a oneshot.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bus::BusDriver;
use crate::device::Device;
use crate::error::DriverError;

/// Settings of an OWBUS.
#[derive(Debug, Clone, Deserialize)]
pub struct OneWireSettings {
    /// Directory holding one sub-directory per sensor address
    #[serde(default = "default_sysfs_root", alias = "dev_path")]
    pub sysfs_root: PathBuf,

    /// Seconds between sensor sweeps (default: 15)
    #[serde(default = "default_interval")]
    pub interval: f64,
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys/bus/w1/devices")
}

fn default_interval() -> f64 {
    15.0
}

impl OneWireSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.interval.is_finite() && self.interval > 0.0) {
            return Err(format!("interval must be positive, got {}", self.interval));
        }
        Ok(())
    }
}

struct ReadRequest {
    address: String,
    reply: oneshot::Sender<Result<f64, DriverError>>,
}

/// Driver for a 1-Wire bus.
pub struct OneWireDriver {
    name: String,
    settings: OneWireSettings,
    sensors: RwLock<Vec<Arc<Device>>>,
    requests: Mutex<Option<mpsc::Sender<ReadRequest>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl OneWireDriver {
    /// Create a new driver. Nothing runs until activation.
    pub fn new(name: impl Into<String>, settings: OneWireSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            sensors: RwLock::new(Vec::new()),
            requests: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    /// Attach a sensor device to the periodic sweep.
    pub fn attach(&self, sensor: Arc<Device>) {
        self.sensors.write().push(sensor);
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.read().len()
    }

    /// Read one sensor now.
    pub async fn read(&self, address: &str) -> Result<f64, DriverError> {
        let tx = self
            .requests
            .lock()
            .clone()
            .ok_or_else(|| DriverError::NotActive(self.name.clone()))?;
        request(&tx, address).await
    }

    /// Read every attached sensor once, recording the results.
    pub async fn sweep(&self) -> Result<(), DriverError> {
        let tx = self
            .requests
            .lock()
            .clone()
            .ok_or_else(|| DriverError::NotActive(self.name.clone()))?;
        let sensors = self.sensors.read().clone();
        sweep(&sensors, &tx).await;
        Ok(())
    }
}

async fn request(tx: &mpsc::Sender<ReadRequest>, address: &str) -> Result<f64, DriverError> {
    let (reply, rx) = oneshot::channel();
    tx.send(ReadRequest {
        address: address.to_string(),
        reply,
    })
    .await
    .map_err(|_| DriverError::WorkerStopped)?;
    rx.await.map_err(|_| DriverError::WorkerStopped)?
}

async fn sweep(sensors: &[Arc<Device>], tx: &mpsc::Sender<ReadRequest>) {
    for device in sensors {
        let Some(sensor) = device.as_sensor() else {
            continue;
        };
        let reading = request(tx, sensor.address()).await;
        device.record_reading(reading);
    }
}

fn run_worker(root: PathBuf, mut rx: mpsc::Receiver<ReadRequest>) {
    while let Some(req) = rx.blocking_recv() {
        let result = read_temperature(&root, &req.address);
        // The requester may have gone away
        let _ = req.reply.send(result);
    }
    tracing::debug!(root = %root.display(), "1-Wire worker exiting");
}

fn read_temperature(root: &Path, address: &str) -> Result<f64, DriverError> {
    let path = root.join(address).join("w1_slave");
    let content = std::fs::read_to_string(&path)
        .map_err(|e| DriverError::Read(format!("{}: {}", path.display(), e)))?;
    parse_w1_slave(&content)
}

/// Parse a `w1_slave` file: a CRC line ending in YES, then a line
/// carrying `t=<millidegrees>`.
pub fn parse_w1_slave(content: &str) -> Result<f64, DriverError> {
    let mut lines = content.lines();
    let crc = lines
        .next()
        .ok_or_else(|| DriverError::Read("empty w1_slave".to_string()))?;
    if !crc.trim_end().ends_with("YES") {
        return Err(DriverError::Read("CRC check failed".to_string()));
    }

    let data = lines
        .next()
        .ok_or_else(|| DriverError::Read("missing temperature line".to_string()))?;
    let (_, raw) = data
        .split_once("t=")
        .ok_or_else(|| DriverError::Read("missing t= field".to_string()))?;
    let millis: i64 = raw
        .trim()
        .parse()
        .map_err(|e| DriverError::Read(format!("bad temperature '{}': {}", raw.trim(), e)))?;

    Ok(millis as f64 / 1000.0)
}

#[async_trait]
impl BusDriver for OneWireDriver {
    fn kind(&self) -> &'static str {
        "onewire"
    }

    async fn activate(&self) -> Result<(), DriverError> {
        let (tx, rx) = mpsc::channel(32);
        let root = self.settings.sysfs_root.clone();
        std::thread::Builder::new()
            .name(format!("w1-{}", self.name))
            .spawn(move || run_worker(root, rx))
            .map_err(|e| DriverError::Connection(format!("failed to start worker: {}", e)))?;

        let sensors = self.sensors.read().clone();
        let interval = Duration::from_secs_f64(self.settings.interval);
        let poll_tx = tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweep(&sensors, &poll_tx).await;
            }
        });

        *self.requests.lock() = Some(tx);
        if let Some(previous) = self.poller.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), DriverError> {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
        // Dropping the last sender ends the worker thread
        self.requests.lock().take();
        Ok(())
    }

    fn describe(&self, fields: &mut Map<String, Value>) {
        fields.insert(
            "sysfs_root".to_string(),
            json!(self.settings.sysfs_root.display().to_string()),
        );
        fields.insert("interval".to_string(), json!(self.settings.interval));
        fields.insert("sensors".to_string(), json!(self.sensor_count()));
    }
}
