//! Device registry.
//!
//! Indexes every constructed device and bus by type, by `(type, circuit)`
//! and by alias. Registration order within a type is preserved.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::device::{Device, DeviceType};
use crate::error::{GatewayError, Result};

#[derive(Debug, Default)]
struct Indices {
    by_type: HashMap<DeviceType, Vec<Arc<Device>>>,
    by_circuit: HashMap<(DeviceType, String), Arc<Device>>,
    aliases: HashMap<String, Arc<Device>>,
}

/// Central index of registered devices.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<Indices>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device. Fails if `(type, circuit)` is taken; the first
    /// registration stays in place.
    pub fn register(&self, device: Arc<Device>) -> Result<()> {
        let device_type = device.device_type();
        let key = (device_type, device.circuit().to_string());

        let mut inner = self.inner.write();
        if inner.by_circuit.contains_key(&key) {
            return Err(GatewayError::DuplicateDevice {
                device_type: device_type.to_string(),
                circuit: key.1,
            });
        }

        inner.by_circuit.insert(key, Arc::clone(&device));
        inner.by_type.entry(device_type).or_default().push(device);
        Ok(())
    }

    /// Exact lookup by circuit.
    pub fn lookup_by_circuit(&self, device_type: DeviceType, circuit: &str) -> Result<Arc<Device>> {
        self.inner
            .read()
            .by_circuit
            .get(&(device_type, circuit.to_string()))
            .cloned()
            .ok_or_else(|| not_found(device_type, circuit))
    }

    /// Lookup by circuit, falling back to an alias of a device of the same
    /// type.
    pub fn lookup(&self, device_type: DeviceType, name: &str) -> Result<Arc<Device>> {
        let inner = self.inner.read();
        if let Some(device) = inner.by_circuit.get(&(device_type, name.to_string())) {
            return Ok(Arc::clone(device));
        }
        inner
            .aliases
            .get(name)
            .filter(|d| d.device_type() == device_type)
            .cloned()
            .ok_or_else(|| not_found(device_type, name))
    }

    /// All devices of a type, in registration order.
    pub fn lookup_by_type(&self, device_type: DeviceType) -> Vec<Arc<Device>> {
        self.inner
            .read()
            .by_type
            .get(&device_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Every device, grouped by type in canonical order.
    pub fn all(&self) -> Vec<Arc<Device>> {
        let inner = self.inner.read();
        DeviceType::ALL
            .iter()
            .filter_map(|t| inner.by_type.get(t))
            .flat_map(|devices| devices.iter().cloned())
            .collect()
    }

    /// Every Modbus slave, in registration order.
    pub fn modbus_slaves(&self) -> Vec<Arc<Device>> {
        self.lookup_by_type(DeviceType::ModbusSlave)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_circuit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bind an alias to a device. Returns false without touching the
    /// index when the alias is already bound, to any device.
    pub fn register_alias(&self, alias: &str, device: &Arc<Device>) -> bool {
        let mut inner = self.inner.write();
        if inner.aliases.contains_key(alias) {
            return false;
        }
        inner.aliases.insert(alias.to_string(), Arc::clone(device));
        true
    }

    /// Remove an alias binding.
    pub fn remove_alias(&self, alias: &str) -> Option<Arc<Device>> {
        self.inner.write().aliases.remove(alias)
    }

    /// Device bound to `alias`, of any type.
    pub fn resolve_alias(&self, alias: &str) -> Result<Arc<Device>> {
        self.inner
            .read()
            .aliases
            .get(alias)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound {
                device_type: "alias".to_string(),
                circuit: alias.to_string(),
            })
    }
}

fn not_found(device_type: DeviceType, circuit: &str) -> GatewayError {
    GatewayError::NotFound {
        device_type: device_type.to_string(),
        circuit: circuit.to_string(),
    }
}
