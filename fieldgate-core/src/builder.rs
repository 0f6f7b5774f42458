//! Hardware tree builder.
//!
//! Walks the configured buses in declaration order, constructs each bus
//! and the devices below it, and registers everything. A bad bus or device
//! is logged and skipped; it never stops the rest of the tree from being
//! built.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::bus::Bus;
use crate::config::{BlockDefinition, BusSpec, DeviceSpec, ModelDefinition};
use crate::device::{
    AnalogPoint, Area, CoilPoint, Device, DeviceKind, DeviceType, InputPoint, ModbusSlave,
    OneWireSensor, PointLink, RegisterPoint, Scaling, ScanBlock, SensorSettings, SlaveSettings,
};
use crate::dispatch::Dispatcher;
use crate::drivers::{ModbusDriver, OneWireDriver, OneWireSettings, RtuSettings, TcpSettings};
use crate::error::BuildError;
use crate::registry::Registry;

/// Largest register block a single Modbus read may cover.
const MAX_REGISTERS_PER_READ: u16 = 125;
/// Largest coil / discrete input block a single Modbus read may cover.
const MAX_BITS_PER_READ: u16 = 2000;

/// Outcome of building a hardware tree.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub buses: usize,
    pub devices: usize,
    pub failures: Vec<BuildError>,
}

enum BuiltBus {
    Modbus(Arc<Bus>),
    OneWire(Arc<OneWireDriver>),
}

/// Constructs buses and devices from the hardware tree.
pub struct Builder<'a> {
    registry: &'a Registry,
    events: Arc<Dispatcher>,
    models: &'a HashMap<String, ModelDefinition>,
    next_id: u32,
    report: BuildReport,
}

impl<'a> Builder<'a> {
    /// Create a new builder registering into `registry`.
    pub fn new(
        registry: &'a Registry,
        events: Arc<Dispatcher>,
        models: &'a HashMap<String, ModelDefinition>,
    ) -> Self {
        Self {
            registry,
            events,
            models,
            next_id: 0,
            report: BuildReport::default(),
        }
    }

    /// Global device ids start at 1 and increase with construction order.
    fn allocate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Build the whole tree.
    pub fn build(mut self, tree: &IndexMap<String, BusSpec>) -> BuildReport {
        for (bus_name, spec) in tree {
            if !spec.enabled {
                tracing::info!(bus = %bus_name, "Bus disabled, skipping");
                continue;
            }

            let bus = match self.build_bus(bus_name, spec) {
                Ok(bus) => bus,
                Err(reason) => {
                    self.fail(BuildError::bus(bus_name, reason));
                    continue;
                }
            };

            for (device_name, device_spec) in &spec.devices {
                if !device_spec.enabled {
                    tracing::debug!(bus = %bus_name, device = %device_name, "Device disabled");
                    continue;
                }
                if let Err(reason) = self.build_device(&bus, device_name, device_spec) {
                    self.fail(BuildError::device(bus_name, device_name, reason));
                }
            }
        }

        tracing::info!(
            buses = self.report.buses,
            devices = self.report.devices,
            failures = self.report.failures.len(),
            "Hardware tree built"
        );
        self.report
    }

    fn fail(&mut self, err: BuildError) {
        tracing::error!(error = %err, "Construction failed");
        self.report.failures.push(err);
    }

    fn build_bus(&mut self, name: &str, spec: &BusSpec) -> Result<BuiltBus, String> {
        let (bus, built) = match spec.bus_type.to_ascii_uppercase().as_str() {
            "MODBUSTCP" => {
                let settings: TcpSettings = parse_params(&spec.params)?;
                let bus = Arc::new(Bus::new(
                    name,
                    DeviceType::TcpBus,
                    Arc::new(ModbusDriver::tcp(settings)),
                ));
                (Arc::clone(&bus), BuiltBus::Modbus(bus))
            }
            "MODBUSRTU" => {
                let settings: RtuSettings = parse_params(&spec.params)?;
                settings.validate()?;
                let bus = Arc::new(Bus::new(
                    name,
                    DeviceType::SerialBus,
                    Arc::new(ModbusDriver::rtu(settings)),
                ));
                (Arc::clone(&bus), BuiltBus::Modbus(bus))
            }
            "OWBUS" => {
                let settings: OneWireSettings = parse_params(&spec.params)?;
                settings.validate()?;
                let driver = Arc::new(OneWireDriver::new(name, settings));
                let bus = Arc::new(Bus::new(name, DeviceType::OwBus, driver.clone()));
                (bus, BuiltBus::OneWire(driver))
            }
            "" => return Err("missing bus type".to_string()),
            other => return Err(format!("unknown bus type '{}'", other)),
        };

        let device = Device::new(
            self.allocate_id(),
            name,
            DeviceKind::Bus(bus),
            Arc::clone(&self.events),
        );
        self.registry
            .register(Arc::new(device))
            .map_err(|e| e.to_string())?;
        self.report.buses += 1;
        Ok(built)
    }

    fn build_device(&mut self, bus: &BuiltBus, name: &str, spec: &DeviceSpec) -> Result<(), String> {
        match bus {
            BuiltBus::Modbus(bus) => self.build_slave(bus, name, spec),
            BuiltBus::OneWire(driver) => self.build_sensor(driver, name, spec),
        }
    }

    fn build_sensor(
        &mut self,
        driver: &Arc<OneWireDriver>,
        name: &str,
        spec: &DeviceSpec,
    ) -> Result<(), String> {
        let settings: SensorSettings = parse_params(&spec.params)?;
        let dev_id = self.allocate_id();
        let sensor = OneWireSensor::new(settings)?;

        let device = Arc::new(Device::new(
            dev_id,
            name,
            DeviceKind::Sensor(sensor),
            Arc::clone(&self.events),
        ));
        self.registry
            .register(Arc::clone(&device))
            .map_err(|e| e.to_string())?;
        driver.attach(device);
        self.report.devices += 1;
        Ok(())
    }

    fn build_slave(&mut self, bus: &Arc<Bus>, name: &str, spec: &DeviceSpec) -> Result<(), String> {
        let settings: SlaveSettings = parse_params(&spec.params)?;
        settings.validate()?;
        let models = self.models;
        let model = models
            .get(&settings.model)
            .ok_or_else(|| format!("unknown model '{}'", settings.model))?;

        let slave_id = self.allocate_id();
        let mut counters: HashMap<DeviceType, u32> = HashMap::new();
        let mut blocks = Vec::with_capacity(model.blocks.len());
        let mut points = Vec::new();

        for block in &model.blocks {
            let scan_block = self.build_block(bus, name, &settings, block, &mut counters)?;
            points.extend(scan_block.points.iter().cloned());
            blocks.push(scan_block);
        }

        let slave = ModbusSlave::new(name, Arc::clone(bus), &settings, blocks);
        let device = Device::new(
            slave_id,
            name,
            DeviceKind::ModbusSlave(slave),
            Arc::clone(&self.events),
        );
        self.registry
            .register(Arc::new(device))
            .map_err(|e| e.to_string())?;
        self.report.devices += 1;

        for point in points {
            let circuit = point.circuit().to_string();
            match self.registry.register(point) {
                Ok(()) => self.report.devices += 1,
                Err(e) => tracing::warn!(slave = %name, circuit = %circuit, error = %e, "Point not registered"),
            }
        }
        Ok(())
    }

    fn build_block(
        &mut self,
        bus: &Arc<Bus>,
        slave: &str,
        settings: &SlaveSettings,
        block: &BlockDefinition,
        counters: &mut HashMap<DeviceType, u32>,
    ) -> Result<ScanBlock, String> {
        let point_type = block.point_type;
        let area = Area::for_point(point_type)
            .ok_or_else(|| format!("'{}' is not a Modbus point type", point_type))?;
        let stride = match point_type {
            DeviceType::Ai | DeviceType::Ao => block.data_type.width(),
            _ => 1,
        };

        let limit = match area {
            Area::Coils | Area::DiscreteInputs => MAX_BITS_PER_READ,
            _ => MAX_REGISTERS_PER_READ,
        };
        let span = block
            .count
            .checked_mul(stride)
            .filter(|span| *span > 0 && *span <= limit)
            .ok_or_else(|| format!("{} block at {} exceeds {} per read", point_type, block.start, limit))?;
        if block.start.checked_add(span - 1).is_none() {
            return Err(format!("{} block at {} overflows the address space", point_type, block.start));
        }

        let mut points = Vec::with_capacity(block.count as usize);
        for i in 0..block.count {
            let index = counters.entry(point_type).or_insert(0);
            *index += 1;
            let circuit = format!("{}_{:02}", slave, index);
            let link = PointLink::new(Arc::clone(bus), settings.unit_id, block.start + i * stride);

            let kind = match point_type {
                DeviceType::Relay => DeviceKind::Relay(CoilPoint::new(link)),
                DeviceType::Led => DeviceKind::Led(CoilPoint::new(link)),
                DeviceType::Input => DeviceKind::Input(InputPoint::new(link)),
                DeviceType::Register => DeviceKind::Register(RegisterPoint::new(link)),
                DeviceType::Ai => DeviceKind::AnalogInput(AnalogPoint::new(link, scaling(block))),
                DeviceType::Ao => DeviceKind::AnalogOutput(AnalogPoint::new(link, scaling(block))),
                other => return Err(format!("'{}' is not a Modbus point type", other)),
            };

            let device = Device::new(self.allocate_id(), circuit, kind, Arc::clone(&self.events))
                .with_group(slave);
            points.push(Arc::new(device));
        }

        Ok(ScanBlock {
            area,
            start: block.start,
            stride,
            points,
        })
    }
}

fn scaling(block: &BlockDefinition) -> Scaling {
    Scaling {
        data_type: block.data_type,
        scale: block.scale,
        offset: block.offset,
        unit: block.unit.clone(),
    }
}

fn parse_params<T: DeserializeOwned>(params: &Map<String, Value>) -> Result<T, String> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|e| e.to_string())
}
