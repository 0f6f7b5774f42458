//! Shared fixtures: an in-memory Modbus bus and a small hardware tree.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use fieldgate_core::bus::{Bus, BusDriver, ModbusIo};
use fieldgate_core::device::{
    Area, CoilPoint, Device, DeviceKind, DeviceType, InputPoint, ModbusSlave, PointLink,
    RegisterPoint, ScanBlock, SlaveSettings,
};
use fieldgate_core::{DriverError, Gateway, GatewayConfig};

/// Register image keyed by `(unit, address)`.
#[derive(Default)]
pub struct MemoryBus {
    coils: Mutex<HashMap<(u8, u16), bool>>,
    discrete: Mutex<HashMap<(u8, u16), bool>>,
    holding: Mutex<HashMap<(u8, u16), u16>>,
    input: Mutex<HashMap<(u8, u16), u16>>,
    pub fail_activation: AtomicBool,
    pub fail_writes: AtomicBool,
    pub writes: AtomicUsize,
    pub activations: AtomicUsize,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn coil(&self, unit: u8, address: u16) -> bool {
        self.coils
            .lock()
            .get(&(unit, address))
            .copied()
            .unwrap_or(false)
    }

    pub fn set_discrete(&self, unit: u8, address: u16, value: bool) {
        self.discrete.lock().insert((unit, address), value);
    }

    pub fn holding(&self, unit: u8, address: u16) -> u16 {
        self.holding
            .lock()
            .get(&(unit, address))
            .copied()
            .unwrap_or(0)
    }
}

fn read<T: Copy + Default>(
    table: &Mutex<HashMap<(u8, u16), T>>,
    unit: u8,
    address: u16,
    count: u16,
) -> Vec<T> {
    let table = table.lock();
    (address..address + count)
        .map(|a| table.get(&(unit, a)).copied().unwrap_or_default())
        .collect()
}

#[async_trait]
impl BusDriver for MemoryBus {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn activate(&self) -> Result<(), DriverError> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        if self.fail_activation.load(Ordering::SeqCst) {
            return Err(DriverError::Connection("refused".to_string()));
        }
        Ok(())
    }

    fn modbus(&self) -> Option<&dyn ModbusIo> {
        Some(self)
    }
}

#[async_trait]
impl ModbusIo for MemoryBus {
    async fn read_coils(&self, unit: u8, address: u16, count: u16) -> Result<Vec<bool>, DriverError> {
        Ok(read(&self.coils, unit, address, count))
    }

    async fn read_discrete_inputs(
        &self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, DriverError> {
        Ok(read(&self.discrete, unit, address, count))
    }

    async fn read_holding_registers(
        &self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, DriverError> {
        Ok(read(&self.holding, unit, address, count))
    }

    async fn read_input_registers(
        &self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, DriverError> {
        Ok(read(&self.input, unit, address, count))
    }

    async fn write_coil(&self, unit: u8, address: u16, value: bool) -> Result<(), DriverError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DriverError::Write("injected".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.coils.lock().insert((unit, address), value);
        Ok(())
    }

    async fn write_registers(
        &self,
        unit: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), DriverError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DriverError::Write("injected".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut holding = self.holding.lock();
        for (offset, value) in values.iter().enumerate() {
            holding.insert((unit, address + offset as u16), *value);
        }
        Ok(())
    }
}

/// A gateway with bus `M1` (tcpbus) holding slave `D1` (unit 1) with four
/// relays at coils 0-3, two inputs at discrete 0-1 and one register at
/// holding 0.
pub struct Fixture {
    pub gateway: Gateway,
    pub memory: Arc<MemoryBus>,
    pub bus: Arc<Bus>,
}

impl Fixture {
    pub fn new(config: GatewayConfig) -> Self {
        let gateway = Gateway::new(config);
        let memory = MemoryBus::new();
        let bus = Arc::new(Bus::new("M1", DeviceType::TcpBus, memory.clone()));
        let events = Arc::clone(gateway.dispatcher());
        let registry = gateway.registry();

        registry
            .register(Arc::new(Device::new(
                1,
                "M1",
                DeviceKind::Bus(Arc::clone(&bus)),
                Arc::clone(&events),
            )))
            .unwrap();

        let settings = SlaveSettings {
            model: "TEST".to_string(),
            unit_id: 1,
            scan_frequency: 20.0,
            scan_enabled: true,
        };

        let mut dev_id = 2;
        let mut point = |circuit: String, kind: DeviceKind| {
            dev_id += 1;
            Arc::new(Device::new(dev_id, circuit, kind, Arc::clone(&events)).with_group("D1"))
        };

        let relays: Vec<_> = (0..4)
            .map(|i| {
                let link = PointLink::new(Arc::clone(&bus), 1, i);
                point(format!("D1_{:02}", i + 1), DeviceKind::Relay(CoilPoint::new(link)))
            })
            .collect();
        let inputs: Vec<_> = (0..2)
            .map(|i| {
                let link = PointLink::new(Arc::clone(&bus), 1, i);
                point(format!("D1_{:02}", i + 1), DeviceKind::Input(InputPoint::new(link)))
            })
            .collect();
        let registers = vec![point(
            "D1_01".to_string(),
            DeviceKind::Register(RegisterPoint::new(PointLink::new(Arc::clone(&bus), 1, 0))),
        )];

        let blocks = vec![
            ScanBlock {
                area: Area::Coils,
                start: 0,
                stride: 1,
                points: relays.clone(),
            },
            ScanBlock {
                area: Area::DiscreteInputs,
                start: 0,
                stride: 1,
                points: inputs.clone(),
            },
            ScanBlock {
                area: Area::HoldingRegisters,
                start: 0,
                stride: 1,
                points: registers.clone(),
            },
        ];

        let slave = ModbusSlave::new("D1", Arc::clone(&bus), &settings, blocks);
        registry
            .register(Arc::new(Device::new(
                2,
                "D1",
                DeviceKind::ModbusSlave(slave),
                Arc::clone(&events),
            )))
            .unwrap();

        for device in relays.into_iter().chain(inputs).chain(registers) {
            registry.register(device).unwrap();
        }

        Self {
            gateway,
            memory,
            bus,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(GatewayConfig::default())
    }
}

/// Collect everything currently queued on a session's outbox.
pub fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> Vec<serde_json::Value> {
    let mut messages = Vec::new();
    while let Ok(text) = rx.try_recv() {
        messages.push(serde_json::from_str(&text).unwrap());
    }
    messages
}
