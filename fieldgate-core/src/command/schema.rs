//! Per-type operation tables and parameter validation.

use serde_json::{Map, Value, json};

use crate::device::DeviceType;
use crate::error::{GatewayError, Result};

/// What an operation does once validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Return the full snapshot.
    Full,
    /// Change writable state.
    Set,
    /// Read the hardware now (Modbus slaves).
    Scan,
}

/// Accepted value shape of one parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamKind {
    Bool,
    Int { min: i64, max: i64 },
    Float { min: f64, max: f64 },
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

/// One named operation of a device type.
#[derive(Debug)]
pub struct OperationSpec {
    pub name: &'static str,
    pub operation: Operation,
    pub params: &'static [ParamSpec],
}

const FULL: OperationSpec = OperationSpec {
    name: "full",
    operation: Operation::Full,
    params: &[],
};

static READ_ONLY: &[OperationSpec] = &[FULL];

static COIL: &[OperationSpec] = &[
    FULL,
    OperationSpec {
        name: "set",
        operation: Operation::Set,
        params: &[
            ParamSpec {
                name: "value",
                kind: ParamKind::Bool,
                required: false,
            },
            ParamSpec {
                name: "timeout",
                kind: ParamKind::Float {
                    min: 0.0,
                    max: 86_400.0,
                },
                required: false,
            },
        ],
    },
];

static REGISTER: &[OperationSpec] = &[
    FULL,
    OperationSpec {
        name: "set",
        operation: Operation::Set,
        params: &[ParamSpec {
            name: "value",
            kind: ParamKind::Int { min: 0, max: 65535 },
            required: true,
        }],
    },
];

static ANALOG_OUTPUT: &[OperationSpec] = &[
    FULL,
    OperationSpec {
        name: "set",
        operation: Operation::Set,
        params: &[ParamSpec {
            name: "value",
            kind: ParamKind::Float {
                min: f64::MIN,
                max: f64::MAX,
            },
            required: true,
        }],
    },
];

static MODBUS_SLAVE: &[OperationSpec] = &[
    FULL,
    OperationSpec {
        name: "set",
        operation: Operation::Set,
        params: &[
            ParamSpec {
                name: "scan_enabled",
                kind: ParamKind::Bool,
                required: false,
            },
            ParamSpec {
                name: "scan_frequency",
                kind: ParamKind::Float {
                    min: 0.01,
                    max: 1000.0,
                },
                required: false,
            },
        ],
    },
    OperationSpec {
        name: "scan",
        operation: Operation::Scan,
        params: &[],
    },
];

/// Operations supported by a device type.
pub fn operations(device_type: DeviceType) -> &'static [OperationSpec] {
    match device_type {
        DeviceType::Relay | DeviceType::Led => COIL,
        DeviceType::Register => REGISTER,
        DeviceType::Ao => ANALOG_OUTPUT,
        DeviceType::ModbusSlave => MODBUS_SLAVE,
        _ => READ_ONLY,
    }
}

/// Look up an operation by name.
pub fn find(device_type: DeviceType, name: &str) -> Result<&'static OperationSpec> {
    operations(device_type)
        .iter()
        .find(|op| op.name == name)
        .ok_or_else(|| GatewayError::UnknownOperation {
            device_type: device_type.to_string(),
            operation: name.to_string(),
        })
}

/// Arguments as they arrive from a transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Arguments {
    #[default]
    None,
    /// A single value bound to the operation's first parameter.
    Positional(Value),
    /// Keyword arguments.
    Named(Map<String, Value>),
}

/// Validated, type-coerced parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(Value::as_f64)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl OperationSpec {
    /// Validate arguments against this operation's parameters.
    pub fn bind(&self, args: Arguments) -> Result<Params> {
        let named = match args {
            Arguments::None => Map::new(),
            Arguments::Named(map) => map,
            Arguments::Positional(Value::Object(map)) => map,
            Arguments::Positional(value) => {
                let first = self.params.first().ok_or_else(|| {
                    GatewayError::validation(format!("'{}' takes no parameters", self.name))
                })?;
                let mut map = Map::new();
                map.insert(first.name.to_string(), value);
                map
            }
        };

        let mut params = Map::new();
        for (key, value) in named {
            let spec = self
                .params
                .iter()
                .find(|p| p.name == key)
                .ok_or_else(|| {
                    GatewayError::validation(format!(
                        "'{}' does not accept parameter '{}'",
                        self.name, key
                    ))
                })?;
            params.insert(key, coerce(spec, &value)?);
        }

        if let Some(missing) = self
            .params
            .iter()
            .find(|p| p.required && !params.contains_key(p.name))
        {
            return Err(GatewayError::validation(format!(
                "'{}' requires parameter '{}'",
                self.name, missing.name
            )));
        }

        Ok(Params(params))
    }
}

fn coerce(spec: &ParamSpec, value: &Value) -> Result<Value> {
    let invalid = || {
        GatewayError::validation(format!(
            "invalid value {} for parameter '{}'",
            value, spec.name
        ))
    };

    match spec.kind {
        ParamKind::Bool => {
            let flag = match value {
                Value::Bool(b) => Some(*b),
                Value::Number(n) => match n.as_f64() {
                    Some(v) if v == 0.0 => Some(false),
                    Some(v) if v == 1.0 => Some(true),
                    _ => None,
                },
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "on" => Some(true),
                    "0" | "false" | "off" => Some(false),
                    _ => None,
                },
                _ => None,
            };
            flag.map(Value::Bool).ok_or_else(invalid)
        }
        ParamKind::Int { min, max } => {
            let number = match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            }
            .ok_or_else(invalid)?;

            if number < min || number > max {
                return Err(GatewayError::validation(format!(
                    "parameter '{}' must be between {} and {}",
                    spec.name, min, max
                )));
            }
            Ok(json!(number))
        }
        ParamKind::Float { min, max } => {
            let number = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .filter(|f| f.is_finite())
            .ok_or_else(invalid)?;

            if number < min || number > max {
                return Err(GatewayError::validation(format!(
                    "parameter '{}' must be between {} and {}",
                    spec.name, min, max
                )));
            }
            Ok(json!(number))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_operation() {
        assert_eq!(
            find(DeviceType::Relay, "set").unwrap().operation,
            Operation::Set
        );
        assert_eq!(
            find(DeviceType::ModbusSlave, "scan").unwrap().operation,
            Operation::Scan
        );

        let err = find(DeviceType::Input, "set").unwrap_err();
        assert_eq!(err.name(), "UnknownOperationError");
    }

    #[test]
    fn test_positional_binds_first_param() {
        let spec = find(DeviceType::Relay, "set").unwrap();
        let params = spec.bind(Arguments::Positional(json!("1"))).unwrap();
        assert_eq!(params.bool("value"), Some(true));
        assert_eq!(params.float("timeout"), None);
    }

    #[test]
    fn test_positional_object_is_named() {
        let spec = find(DeviceType::Relay, "set").unwrap();
        let params = spec
            .bind(Arguments::Positional(json!({ "value": 0, "timeout": "2.5" })))
            .unwrap();
        assert_eq!(params.bool("value"), Some(false));
        assert_eq!(params.float("timeout"), Some(2.5));
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let spec = find(DeviceType::Relay, "set").unwrap();
        let mut map = Map::new();
        map.insert("colour".to_string(), json!("red"));

        let err = spec.bind(Arguments::Named(map)).unwrap_err();
        assert_eq!(err.name(), "ValidationError");
    }

    #[test]
    fn test_required_parameter() {
        let spec = find(DeviceType::Register, "set").unwrap();
        assert!(spec.bind(Arguments::None).is_err());
        assert_eq!(
            spec.bind(Arguments::Positional(json!(42)))
                .unwrap()
                .int("value"),
            Some(42)
        );
    }

    #[test]
    fn test_range_checks() {
        let spec = find(DeviceType::Register, "set").unwrap();
        assert!(spec.bind(Arguments::Positional(json!(70000))).is_err());
        assert!(spec.bind(Arguments::Positional(json!(-1))).is_err());
        assert!(spec.bind(Arguments::Positional(json!(1.5))).is_err());

        let spec = find(DeviceType::ModbusSlave, "set").unwrap();
        let mut map = Map::new();
        map.insert("scan_frequency".to_string(), json!(0));
        assert!(spec.bind(Arguments::Named(map)).is_err());
    }

    #[test]
    fn test_bad_bool() {
        let spec = find(DeviceType::Led, "set").unwrap();
        assert!(spec.bind(Arguments::Positional(json!("maybe"))).is_err());
        assert!(spec.bind(Arguments::Positional(json!(2))).is_err());
    }

    #[test]
    fn test_full_takes_no_positional() {
        let spec = find(DeviceType::Ai, "full").unwrap();
        assert!(spec.bind(Arguments::None).unwrap().is_empty());
        assert!(spec.bind(Arguments::Positional(json!(1))).is_err());
    }
}
