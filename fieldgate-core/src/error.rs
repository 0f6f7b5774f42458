//! Error types for the gateway core.

use serde_json::{Value, json};
use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Hardware or transport failure reported by a bus driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The bus has not been activated (or was deactivated).
    #[error("Bus '{0}' is not active")]
    NotActive(String),

    /// Connecting to the bus failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The device did not answer in time.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// A read request failed.
    #[error("Read failed: {0}")]
    Read(String),

    /// A write request failed.
    #[error("Write failed: {0}")]
    Write(String),

    /// The remote device answered with a protocol exception.
    #[error("Device exception: {0}")]
    Exception(String),

    /// The bus driver does not offer the requested capability.
    #[error("Operation not supported by {0} driver")]
    Unsupported(&'static str),

    /// The blocking worker behind the driver has stopped.
    #[error("Driver worker stopped")]
    WorkerStopped,
}

/// A bus or device that could not be constructed from configuration.
#[derive(Debug, Error)]
#[error("{}: {reason}", location(.bus, .device))]
pub struct BuildError {
    /// Bus name from the hardware tree.
    pub bus: String,
    /// Device name, when the failure is below the bus level.
    pub device: Option<String>,
    /// Human-readable cause.
    pub reason: String,
}

fn location(bus: &str, device: &Option<String>) -> String {
    match device {
        Some(device) => format!("bus '{}' device '{}'", bus, device),
        None => format!("bus '{}'", bus),
    }
}

impl BuildError {
    /// Failure constructing the bus itself.
    pub fn bus(bus: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            bus: bus.into(),
            device: None,
            reason: reason.into(),
        }
    }

    /// Failure constructing a device below a bus.
    pub fn device(
        bus: impl Into<String>,
        device: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            bus: bus.into(),
            device: Some(device.into()),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the registry, command gateway and lifecycle.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or missing configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A bus or device failed construction.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Registry lookup failed.
    #[error("No {device_type} named '{circuit}'")]
    NotFound {
        device_type: String,
        circuit: String,
    },

    /// A command targeted a device that does not exist.
    #[error("Unknown device {device_type}/{circuit}")]
    UnknownDevice {
        device_type: String,
        circuit: String,
    },

    /// `(type, circuit)` is already registered.
    #[error("Device {device_type}/{circuit} is already registered")]
    DuplicateDevice {
        device_type: String,
        circuit: String,
    },

    /// The device type name is not known at all.
    #[error("Unknown device type '{0}'")]
    UnknownDeviceType(String),

    /// The operation is not part of the device type's operation table.
    #[error("Operation '{operation}' is not supported by {device_type}")]
    UnknownOperation {
        device_type: String,
        operation: String,
    },

    /// Parameters do not match the operation's schema.
    #[error("{0}")]
    Validation(String),

    /// Hardware or transport failure.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl GatewayError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable error name used as the key of `{errors: {...}}` bodies.
    pub fn name(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "ConfigError",
            GatewayError::Build(_) => "BuildError",
            GatewayError::NotFound { .. } => "NotFoundError",
            GatewayError::UnknownDevice { .. } => "UnknownDeviceError",
            GatewayError::DuplicateDevice { .. } => "DuplicateDeviceError",
            GatewayError::UnknownDeviceType(_) => "UnknownDeviceTypeError",
            GatewayError::UnknownOperation { .. } => "UnknownOperationError",
            GatewayError::Validation(_) => "ValidationError",
            GatewayError::Driver(_) => "DriverError",
        }
    }

    /// Structured failure body: `{success: false, errors: {Name: message}}`.
    pub fn to_response(&self) -> Value {
        json!({
            "success": false,
            "errors": { self.name(): self.to_string() },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_shape() {
        let err = GatewayError::UnknownOperation {
            device_type: "input".to_string(),
            operation: "set".to_string(),
        };
        let body = err.to_response();

        assert_eq!(body["success"], false);
        assert_eq!(
            body["errors"]["UnknownOperationError"],
            "Operation 'set' is not supported by input"
        );
    }

    #[test]
    fn test_build_error_display() {
        let err = BuildError::device("M1", "D1", "unknown model 'X'");
        assert_eq!(err.to_string(), "bus 'M1' device 'D1': unknown model 'X'");

        let err = BuildError::bus("M1", "missing port");
        assert_eq!(err.to_string(), "bus 'M1': missing port");
    }

    #[test]
    fn test_driver_error_converts() {
        let err: GatewayError = DriverError::Timeout(1000).into();
        assert_eq!(err.name(), "DriverError");
    }
}
