//! Concrete bus drivers.
//!
//! - [`modbus`] - Modbus TCP and RTU via tokio-modbus
//! - [`onewire`] - 1-Wire temperature sensors via sysfs

pub mod modbus;
pub mod onewire;

pub use modbus::{ModbusDriver, RtuSettings, TcpSettings};
pub use onewire::{OneWireDriver, OneWireSettings};
