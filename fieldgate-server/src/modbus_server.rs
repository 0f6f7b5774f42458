//! Read-only Modbus/TCP server over a register image of device state.
//!
//! Each device is published at its `dev_id` in the table matching its
//! type: relays and leds as coils, inputs as discrete inputs, registers and
//! analog outputs as holding registers, analog inputs and sensors as input
//! registers. Unpublished addresses read as zero.

use std::collections::HashMap;
use std::future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{Server, accept_tcp_connection};
use tracing::{debug, info, warn};

use fieldgate_core::{Device, DeviceKind, ModbusContext, Registry};

/// Maximum quantity per read request, as in the Modbus application protocol.
const MAX_BITS: u16 = 2000;
const MAX_REGISTERS: u16 = 125;

#[derive(Debug, Default)]
struct Tables {
    coils: HashMap<u16, bool>,
    discrete_inputs: HashMap<u16, bool>,
    holding_registers: HashMap<u16, u16>,
    input_registers: HashMap<u16, u16>,
}

/// Device state as Modbus tables, fed by the dispatcher.
#[derive(Debug, Default)]
pub struct RegisterImage {
    tables: RwLock<Tables>,
}

impl RegisterImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the current state of every registered device.
    pub fn seed(&self, registry: &Registry) {
        for device in registry.all() {
            self.publish(&device);
        }
    }

    fn publish(&self, device: &Device) {
        let Ok(address) = u16::try_from(device.dev_id()) else {
            debug!(dev_id = device.dev_id(), "Device id outside the Modbus address space");
            return;
        };

        let mut tables = self.tables.write();
        match device.kind() {
            DeviceKind::Relay(point) | DeviceKind::Led(point) => {
                tables.coils.insert(address, point.value().unwrap_or(false));
            }
            DeviceKind::Input(point) => {
                tables
                    .discrete_inputs
                    .insert(address, point.value().unwrap_or(false));
            }
            DeviceKind::Register(point) => {
                tables
                    .holding_registers
                    .insert(address, point.value().unwrap_or(0));
            }
            DeviceKind::AnalogOutput(point) => {
                tables
                    .holding_registers
                    .insert(address, to_register(point.value()));
            }
            DeviceKind::AnalogInput(point) => {
                tables
                    .input_registers
                    .insert(address, to_register(point.value()));
            }
            DeviceKind::Sensor(sensor) => {
                tables
                    .input_registers
                    .insert(address, to_register(sensor.value()));
            }
            DeviceKind::ModbusSlave(_) | DeviceKind::Bus(_) => {}
        }
    }

    pub fn coils(&self, address: u16, count: u16) -> Vec<bool> {
        read(&self.tables.read().coils, address, count)
    }

    pub fn discrete_inputs(&self, address: u16, count: u16) -> Vec<bool> {
        read(&self.tables.read().discrete_inputs, address, count)
    }

    pub fn holding_registers(&self, address: u16, count: u16) -> Vec<u16> {
        read(&self.tables.read().holding_registers, address, count)
    }

    pub fn input_registers(&self, address: u16, count: u16) -> Vec<u16> {
        read(&self.tables.read().input_registers, address, count)
    }
}

impl ModbusContext for RegisterImage {
    fn status_changed(&self, device: &Device) {
        self.publish(device);
    }

    fn config_changed(&self, device: &Device) {
        debug!(circuit = %device.circuit(), "Configuration change, image unchanged");
    }
}

/// Rounded and clamped to the register range; unknown reads as 0.
fn to_register(value: Option<f64>) -> u16 {
    match value {
        Some(v) if v.is_finite() => v.round().clamp(0.0, u16::MAX as f64) as u16,
        _ => 0,
    }
}

fn read<T: Copy + Default>(table: &HashMap<u16, T>, address: u16, count: u16) -> Vec<T> {
    (0..count)
        .map(|i| {
            address
                .checked_add(i)
                .and_then(|a| table.get(&a).copied())
                .unwrap_or_default()
        })
        .collect()
}

fn check_range(address: u16, count: u16, max: u16) -> Result<(), ExceptionCode> {
    if count == 0 || count > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    if address.checked_add(count - 1).is_none() {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(())
}

/// Per-connection request handler.
#[derive(Clone)]
struct ImageService {
    image: Arc<RegisterImage>,
}

impl ImageService {
    fn handle(&self, request: Request<'static>) -> Result<Response, ExceptionCode> {
        match request {
            Request::ReadCoils(address, count) => {
                check_range(address, count, MAX_BITS)?;
                Ok(Response::ReadCoils(self.image.coils(address, count)))
            }
            Request::ReadDiscreteInputs(address, count) => {
                check_range(address, count, MAX_BITS)?;
                Ok(Response::ReadDiscreteInputs(
                    self.image.discrete_inputs(address, count),
                ))
            }
            Request::ReadHoldingRegisters(address, count) => {
                check_range(address, count, MAX_REGISTERS)?;
                Ok(Response::ReadHoldingRegisters(
                    self.image.holding_registers(address, count),
                ))
            }
            Request::ReadInputRegisters(address, count) => {
                check_range(address, count, MAX_REGISTERS)?;
                Ok(Response::ReadInputRegisters(
                    self.image.input_registers(address, count),
                ))
            }
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }
}

impl tokio_modbus::server::Service for ImageService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, request: Self::Request) -> Self::Future {
        future::ready(self.handle(request))
    }
}

/// Modbus/TCP listener serving a [`RegisterImage`].
pub struct ModbusServer {
    image: Arc<RegisterImage>,
    listen_addr: SocketAddr,
}

impl ModbusServer {
    pub fn new(image: Arc<RegisterImage>, listen_addr: SocketAddr) -> Self {
        Self { image, listen_addr }
    }

    /// Serve until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;
        info!(addr = %self.listen_addr, "Modbus server listening");

        let server = Server::new(listener);
        let image = self.image;
        let on_connected = move |stream, socket_addr: SocketAddr| {
            let image = Arc::clone(&image);
            async move {
                debug!(peer = %socket_addr, "Modbus client connected");
                accept_tcp_connection(stream, socket_addr, move |_| {
                    Ok::<_, io::Error>(Some(ImageService {
                        image: Arc::clone(&image),
                    }))
                })
            }
        };
        let on_process_error = |e: io::Error| warn!(error = %e, "Modbus connection error");

        tokio::select! {
            result = server.serve(&on_connected, on_process_error) => {
                result.map_err(|e| anyhow::anyhow!("Modbus server error: {}", e))?;
            }
            _ = async {
                loop {
                    if shutdown.changed().await.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            } => {
                info!("Modbus server shutting down");
            }
        }

        info!("Modbus server stopped");
        Ok(())
    }
}
