//! Device type catalog.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::GatewayError;

/// Every kind of device or bus the registry can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceType {
    /// Digital input (Modbus discrete input).
    Input,
    /// Relay output (Modbus coil).
    Relay,
    /// Analog input (Modbus input register, scaled).
    Ai,
    /// Analog output (Modbus holding register, scaled).
    Ao,
    /// 1-Wire sensor.
    Sensor,
    /// User LED (Modbus coil).
    Led,
    /// A Modbus slave unit owning I/O points.
    ModbusSlave,
    /// Raw Modbus holding register.
    Register,
    /// 1-Wire bus.
    OwBus,
    /// Modbus TCP bus.
    TcpBus,
    /// Modbus RTU (serial) bus.
    SerialBus,
    /// I2C bus.
    I2cBus,
    /// GPIO bus.
    GpioBus,
    /// ADC chip.
    AdChip,
}

impl DeviceType {
    /// Canonical order used by "list all" responses.
    pub const ALL: [DeviceType; 14] = [
        DeviceType::Input,
        DeviceType::Relay,
        DeviceType::Ai,
        DeviceType::Ao,
        DeviceType::Sensor,
        DeviceType::Led,
        DeviceType::ModbusSlave,
        DeviceType::Register,
        DeviceType::OwBus,
        DeviceType::TcpBus,
        DeviceType::SerialBus,
        DeviceType::I2cBus,
        DeviceType::GpioBus,
        DeviceType::AdChip,
    ];

    /// Return the wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Input => "input",
            DeviceType::Relay => "relay",
            DeviceType::Ai => "ai",
            DeviceType::Ao => "ao",
            DeviceType::Sensor => "sensor",
            DeviceType::Led => "led",
            DeviceType::ModbusSlave => "modbus_slave",
            DeviceType::Register => "register",
            DeviceType::OwBus => "owbus",
            DeviceType::TcpBus => "tcpbus",
            DeviceType::SerialBus => "serialbus",
            DeviceType::I2cBus => "i2cbus",
            DeviceType::GpioBus => "gpiobus",
            DeviceType::AdChip => "adchip",
        }
    }

    fn alt_names(&self) -> &'static [&'static str] {
        match self {
            DeviceType::Input => &["di", "digital_input"],
            DeviceType::Relay => &["do", "digital_output"],
            DeviceType::Ai => &["analoginput", "analog_input"],
            DeviceType::Ao => &["analogoutput", "analog_output"],
            DeviceType::Sensor => &["temp", "1wdevice", "owdevice"],
            DeviceType::Register => &["reg"],
            DeviceType::ModbusSlave => &["neuron"],
            _ => &[],
        }
    }

    /// Look a type up by its wire name or one of its alternative names.
    pub fn from_name(name: &str) -> Option<Self> {
        DeviceType::ALL
            .into_iter()
            .find(|t| t.as_str() == name || t.alt_names().contains(&name))
    }

    /// Whether this type is a bus rather than an I/O point.
    pub fn is_bus(&self) -> bool {
        matches!(
            self,
            DeviceType::OwBus
                | DeviceType::TcpBus
                | DeviceType::SerialBus
                | DeviceType::I2cBus
                | DeviceType::GpioBus
                | DeviceType::AdChip
        )
    }

    /// Whether this type can be declared in a Modbus slave model.
    pub fn is_modbus_point(&self) -> bool {
        matches!(
            self,
            DeviceType::Relay
                | DeviceType::Led
                | DeviceType::Input
                | DeviceType::Register
                | DeviceType::Ai
                | DeviceType::Ao
        )
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceType::from_name(s).ok_or_else(|| GatewayError::UnknownDeviceType(s.to_string()))
    }
}

impl Serialize for DeviceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DeviceType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        DeviceType::from_name(&name)
            .ok_or_else(|| de::Error::custom(format!("unknown device type '{}'", name)))
    }
}
