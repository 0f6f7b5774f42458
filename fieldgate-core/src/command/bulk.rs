//! Bulk requests: group queries plus group and individual assignments.
//!
//! Each element succeeds or fails on its own. A failing element never
//! prevents the remaining elements from being processed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use super::schema::{self, Arguments};
use crate::device::{Device, DeviceType};
use crate::error::GatewayError;
use crate::registry::Registry;

/// Body of a bulk request. Absent sections are absent in the response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkRequest {
    #[serde(default)]
    pub group_queries: Option<Vec<GroupQuery>>,
    #[serde(default)]
    pub group_assignments: Option<Vec<GroupAssignment>>,
    #[serde(default)]
    pub individual_assignments: Option<Vec<IndividualAssignment>>,
}

/// Optional narrowing applied on top of a device type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Selection {
    /// Owning slave circuit
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub device_circuits: Option<Vec<String>>,
    #[serde(default)]
    pub global_device_id: Option<u32>,
}

impl Selection {
    fn matches(&self, device: &Device) -> bool {
        if let Some(group) = &self.group {
            if device.group() != Some(group.as_str()) {
                return false;
            }
        }
        if let Some(circuits) = &self.device_circuits {
            if !circuits.iter().any(|c| c == device.circuit()) {
                return false;
            }
        }
        if let Some(dev_id) = self.global_device_id {
            if device.dev_id() != dev_id {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupQuery {
    pub device_types: Vec<String>,
    #[serde(flatten)]
    pub selection: Selection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupAssignment {
    pub device_type: String,
    #[serde(flatten)]
    pub selection: Selection,
    #[serde(default)]
    pub assigned_values: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndividualAssignment {
    pub device_type: String,
    pub device_circuit: String,
    #[serde(default)]
    pub assigned_values: Map<String, Value>,
}

/// Result of one bulk element.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Map<String, Value>>,
}

impl Outcome {
    fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            errors: None,
        }
    }

    fn failed(err: &GatewayError) -> Self {
        let mut errors = Map::new();
        errors.insert(err.name().to_string(), Value::String(err.to_string()));
        Self {
            success: false,
            result: None,
            errors: Some(errors),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_queries: Option<Vec<Outcome>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_assignments: Option<Vec<Outcome>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub individual_assignments: Option<Vec<Outcome>>,
}

fn select(
    registry: &Registry,
    device_type: &str,
    selection: &Selection,
) -> Result<(DeviceType, Vec<Arc<Device>>), GatewayError> {
    let device_type: DeviceType = device_type.parse()?;
    let devices = registry
        .lookup_by_type(device_type)
        .into_iter()
        .filter(|d| selection.matches(d))
        .collect();
    Ok((device_type, devices))
}

pub(crate) fn group_query(registry: &Registry, query: &GroupQuery) -> Outcome {
    let mut snapshots = Vec::new();
    for name in &query.device_types {
        match select(registry, name, &query.selection) {
            Ok((_, devices)) => snapshots.extend(devices.iter().map(|d| d.snapshot())),
            Err(e) => return Outcome::failed(&e),
        }
    }
    Outcome::ok(Value::Array(snapshots))
}

pub(crate) async fn group_assignment(registry: &Registry, assignment: &GroupAssignment) -> Outcome {
    let (device_type, devices) =
        match select(registry, &assignment.device_type, &assignment.selection) {
            Ok(selected) => selected,
            Err(e) => return Outcome::failed(&e),
        };

    // Validate once, before touching any device
    let params = match schema::find(device_type, "set")
        .and_then(|spec| spec.bind(Arguments::Named(assignment.assigned_values.clone())))
    {
        Ok(params) => params,
        Err(e) => return Outcome::failed(&e),
    };

    let mut results = Vec::with_capacity(devices.len());
    let mut errors = Map::new();
    for device in &devices {
        match device.apply(schema::Operation::Set, &params).await {
            Ok(snapshot) => results.push(snapshot),
            Err(e) => {
                let mut entry = Map::new();
                entry.insert(e.name().to_string(), Value::String(e.to_string()));
                errors.insert(device.circuit().to_string(), Value::Object(entry));
            }
        }
    }

    Outcome {
        success: errors.is_empty(),
        result: Some(Value::Array(results)),
        errors: (!errors.is_empty()).then_some(errors),
    }
}

pub(crate) async fn individual_assignment(
    registry: &Registry,
    assignment: &IndividualAssignment,
) -> Outcome {
    let run = async {
        let device_type: DeviceType = assignment.device_type.parse()?;
        let device = registry
            .lookup(device_type, &assignment.device_circuit)
            .map_err(|_| GatewayError::UnknownDevice {
                device_type: device_type.to_string(),
                circuit: assignment.device_circuit.clone(),
            })?;
        let spec = schema::find(device_type, "set")?;
        let params = spec.bind(Arguments::Named(assignment.assigned_values.clone()))?;
        Ok::<_, GatewayError>(device.apply(spec.operation, &params).await?)
    };

    match run.await {
        Ok(result) => Outcome::ok(result),
        Err(e) => Outcome::failed(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request() {
        let request: BulkRequest = serde_json::from_value(json!({
            "group_queries": [
                { "device_types": ["relay", "input"], "group": "D1" }
            ],
            "individual_assignments": [
                { "device_type": "relay", "device_circuit": "D1_01", "assigned_values": { "value": 1 } }
            ]
        }))
        .unwrap();

        let queries = request.group_queries.unwrap();
        assert_eq!(queries[0].device_types, vec!["relay", "input"]);
        assert_eq!(queries[0].selection.group.as_deref(), Some("D1"));
        assert!(request.group_assignments.is_none());
        assert_eq!(request.individual_assignments.unwrap().len(), 1);
    }

    #[test]
    fn test_response_omits_absent_sections() {
        let response = BulkResponse {
            group_queries: Some(vec![Outcome::ok(json!([]))]),
            ..Default::default()
        };
        let body = serde_json::to_value(&response).unwrap();

        assert!(body.get("group_assignments").is_none());
        assert_eq!(body["group_queries"][0]["success"], true);
        assert!(body["group_queries"][0].get("errors").is_none());
    }

    #[test]
    fn test_failed_outcome_shape() {
        let outcome = Outcome::failed(&GatewayError::UnknownDeviceType("flux".to_string()));
        let body = serde_json::to_value(&outcome).unwrap();

        assert_eq!(body["success"], false);
        assert!(body["errors"]["UnknownDeviceTypeError"].is_string());
    }
}
