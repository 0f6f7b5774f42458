//! Command gateway shared by the REST, bulk and WebSocket surfaces.
//!
//! Every path resolves `(type, circuit)` through the registry, validates
//! the arguments against the type's operation table and only then calls
//! the device.

mod bulk;
mod schema;

pub use bulk::{
    BulkRequest, BulkResponse, GroupAssignment, GroupQuery, IndividualAssignment, Outcome,
    Selection,
};
pub use schema::{Arguments, Operation, OperationSpec, ParamKind, ParamSpec, Params, find, operations};

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::device::{Device, DeviceType};
use crate::dispatch::{Filter, WsSubscription};
use crate::error::{GatewayError, Result};
use crate::registry::Registry;

/// A request to run one operation on one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub dev: String,
    pub circuit: String,
    pub cmd: String,
    pub args: Arguments,
}

impl Command {
    /// Create a new command.
    pub fn new(
        dev: impl Into<String>,
        circuit: impl Into<String>,
        cmd: impl Into<String>,
        args: Arguments,
    ) -> Self {
        Self {
            dev: dev.into(),
            circuit: circuit.into(),
            cmd: cmd.into(),
            args,
        }
    }

    /// Build a command from a WebSocket message object.
    ///
    /// `value` binds positionally (or by name when it is an object). Without
    /// `value`, every key other than `dev`, `circuit` and `cmd` is a keyword
    /// argument.
    pub fn from_message(message: &Map<String, Value>) -> Result<Self> {
        let field = |name: &str| -> Result<String> {
            match message.get(name) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(Value::Number(n)) => Ok(n.to_string()),
                _ => Err(GatewayError::validation(format!("missing '{}'", name))),
            }
        };

        let args = match message.get("value") {
            Some(Value::Null) | None => {
                let extra: Map<String, Value> = message
                    .iter()
                    .filter(|(k, _)| !matches!(k.as_str(), "dev" | "circuit" | "cmd" | "value"))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if extra.is_empty() {
                    Arguments::None
                } else {
                    Arguments::Named(extra)
                }
            }
            Some(Value::Object(map)) => Arguments::Named(map.clone()),
            Some(value) => Arguments::Positional(value.clone()),
        };

        Ok(Self {
            dev: field("dev")?,
            circuit: field("circuit")?,
            cmd: field("cmd")?,
            args,
        })
    }
}

/// Routes commands from every transport to devices.
#[derive(Debug, Clone)]
pub struct CommandGateway {
    registry: Arc<Registry>,
    all_filtered: bool,
}

impl CommandGateway {
    /// Create a new gateway. With `all_filtered`, a session's "all"
    /// request honours its filter.
    pub fn new(registry: Arc<Registry>, all_filtered: bool) -> Self {
        Self {
            registry,
            all_filtered,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Resolve a device by type name and circuit (or alias).
    pub fn resolve(&self, dev: &str, circuit: &str) -> Result<Arc<Device>> {
        let device_type: DeviceType = dev.parse()?;
        self.registry
            .lookup(device_type, circuit)
            .map_err(|_| GatewayError::UnknownDevice {
                device_type: device_type.to_string(),
                circuit: circuit.to_string(),
            })
    }

    /// Validate and run a command.
    pub async fn execute(&self, command: &Command) -> Result<Value> {
        let device = self.resolve(&command.dev, &command.circuit)?;
        let spec = schema::find(device.device_type(), &command.cmd)?;
        let params = spec.bind(command.args.clone())?;
        tracing::debug!(
            dev = %command.dev,
            circuit = %command.circuit,
            cmd = %command.cmd,
            "Executing command"
        );
        device.apply(spec.operation, &params).await
    }

    /// REST read: the snapshot, or one property of it.
    pub fn get(&self, dev: &str, circuit: &str, property: Option<&str>) -> Result<Value> {
        if let Some(property) = property {
            if property.starts_with('_') {
                return Err(GatewayError::validation(format!(
                    "Invalid property name '{}'",
                    property
                )));
            }
        }

        let snapshot = self.resolve(dev, circuit)?.snapshot();
        match property {
            None => Ok(snapshot),
            Some(property) => snapshot.get(property).cloned().ok_or_else(|| {
                GatewayError::validation(format!("Unknown property '{}'", property))
            }),
        }
    }

    /// REST write: the type's `set` operation with keyword arguments.
    pub async fn set(&self, dev: &str, circuit: &str, values: Map<String, Value>) -> Result<Value> {
        let args = if values.is_empty() {
            Arguments::None
        } else {
            Arguments::Named(values)
        };
        self.execute(&Command::new(dev, circuit, "set", args)).await
    }

    /// Snapshots of every registered device, in canonical type order.
    pub fn all(&self) -> Vec<Value> {
        self.registry.all().iter().map(|d| d.snapshot()).collect()
    }

    /// Process a bulk request. Elements are handled in order and
    /// independently.
    pub async fn bulk(&self, request: &BulkRequest) -> BulkResponse {
        let mut response = BulkResponse::default();

        if let Some(queries) = &request.group_queries {
            response.group_queries = Some(
                queries
                    .iter()
                    .map(|q| bulk::group_query(&self.registry, q))
                    .collect(),
            );
        }

        if let Some(assignments) = &request.group_assignments {
            let mut outcomes = Vec::with_capacity(assignments.len());
            for assignment in assignments {
                outcomes.push(bulk::group_assignment(&self.registry, assignment).await);
            }
            response.group_assignments = Some(outcomes);
        }

        if let Some(assignments) = &request.individual_assignments {
            let mut outcomes = Vec::with_capacity(assignments.len());
            for assignment in assignments {
                outcomes.push(bulk::individual_assignment(&self.registry, assignment).await);
            }
            response.individual_assignments = Some(outcomes);
        }

        response
    }

    /// Handle one WebSocket text frame. Returns the reply to send, if any.
    ///
    /// Malformed messages and failed commands are logged and dropped.
    pub async fn handle_ws_message(&self, session: &WsSubscription, text: &str) -> Option<Value> {
        let message = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(message)) => message,
            Ok(_) => {
                tracing::debug!(subscriber = session.id(), "Ignoring non-object message");
                return None;
            }
            Err(e) => {
                tracing::debug!(subscriber = session.id(), error = %e, "Ignoring malformed message");
                return None;
            }
        };

        let Some(cmd) = message.get("cmd").and_then(Value::as_str) else {
            tracing::debug!(subscriber = session.id(), "Ignoring message without cmd");
            return None;
        };

        match cmd {
            "all" => Some(Value::Array(self.all_for(session))),
            "filter" => {
                let devices = message.get("devices").unwrap_or(&Value::Null);
                match Filter::from_names(devices) {
                    Some(filter) => {
                        tracing::debug!(subscriber = session.id(), ?filter, "Filter updated");
                        session.set_filter(filter);
                    }
                    None => tracing::warn!(
                        subscriber = session.id(),
                        devices = %devices,
                        "Rejected filter, keeping the current one"
                    ),
                }
                None
            }
            _ => {
                let command = match Command::from_message(&message) {
                    Ok(command) => command,
                    Err(e) => {
                        tracing::debug!(subscriber = session.id(), error = %e, "Ignoring command");
                        return None;
                    }
                };
                match self.execute(&command).await {
                    Ok(result) if command.cmd == "full" => Some(result),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!(
                            subscriber = session.id(),
                            dev = %command.dev,
                            circuit = %command.circuit,
                            cmd = %command.cmd,
                            error = %e,
                            "WebSocket command failed"
                        );
                        None
                    }
                }
            }
        }
    }

    fn all_for(&self, session: &WsSubscription) -> Vec<Value> {
        let filter = session.filter();
        if !self.all_filtered || filter.is_default() {
            return self.all();
        }
        self.registry
            .all()
            .iter()
            .filter(|d| filter.admits(d.device_type()))
            .map(|d| d.snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_from_message_positional() {
        let cmd = Command::from_message(&message(
            json!({ "dev": "relay", "circuit": "1_01", "cmd": "set", "value": 1 }),
        ))
        .unwrap();

        assert_eq!(cmd.dev, "relay");
        assert_eq!(cmd.args, Arguments::Positional(json!(1)));
    }

    #[test]
    fn test_from_message_extra_keys_are_named() {
        let cmd = Command::from_message(&message(
            json!({ "dev": "relay", "circuit": 3, "cmd": "set", "timeout": 2 }),
        ))
        .unwrap();

        assert_eq!(cmd.circuit, "3");
        let mut expected = Map::new();
        expected.insert("timeout".to_string(), json!(2));
        assert_eq!(cmd.args, Arguments::Named(expected));
    }

    #[test]
    fn test_from_message_missing_field() {
        let result = Command::from_message(&message(json!({ "dev": "relay", "cmd": "full" })));
        assert!(result.is_err());
    }

    #[test]
    fn test_get_rejects_private_property() {
        let gateway = CommandGateway::new(Arc::new(Registry::new()), false);
        let err = gateway.get("relay", "1_01", Some("_bus")).unwrap_err();
        assert_eq!(err.name(), "ValidationError");
    }

    #[test]
    fn test_resolve_unknown() {
        let gateway = CommandGateway::new(Arc::new(Registry::new()), false);
        assert_eq!(
            gateway.resolve("flux", "1").unwrap_err().name(),
            "UnknownDeviceTypeError"
        );
        assert_eq!(
            gateway.resolve("relay", "1").unwrap_err().name(),
            "UnknownDeviceError"
        );
    }
}
