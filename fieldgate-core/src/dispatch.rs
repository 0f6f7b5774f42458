//! Event fan-out to WebSocket sessions, webhooks and the Modbus server.
//!
//! Subscribers are held in registration order. A failure delivering to one
//! subscriber is logged and never prevents delivery to the others.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::device::{Device, DeviceType};

/// Subscriber handle.
pub type SubscriberId = u64;

/// Delivery failure for a single subscriber.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("subscriber channel closed")]
    Closed,
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Which status events a WebSocket session receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// The push-everything mode: each event is a single snapshot object.
    Default,
    /// Only these types, each event wrapped in a one-element list.
    Types(BTreeSet<DeviceType>),
}

impl Filter {
    /// Parse a filter command's `devices` list.
    ///
    /// Returns `None` when the current filter must be kept: the value is
    /// not a list, or it names no known type at all. An empty list is a
    /// valid filter that admits nothing. A first element of "default"
    /// restores the default mode.
    pub fn from_names(value: &Value) -> Option<Filter> {
        let names = value.as_array()?;
        if names.is_empty() {
            return Some(Filter::Types(BTreeSet::new()));
        }
        if names[0].as_str() == Some("default") {
            return Some(Filter::Default);
        }

        let mut types = BTreeSet::new();
        for name in names {
            match name.as_str().and_then(DeviceType::from_name) {
                Some(device_type) => {
                    types.insert(device_type);
                }
                None => tracing::warn!(device = %name, "Ignoring unknown device type in filter"),
            }
        }

        if types.is_empty() {
            None
        } else {
            Some(Filter::Types(types))
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Filter::Default)
    }

    /// Whether a snapshot of `device_type` passes this filter.
    pub fn admits(&self, device_type: DeviceType) -> bool {
        match self {
            Filter::Default => true,
            Filter::Types(types) => types.contains(&device_type),
        }
    }
}

/// A WebSocket session's subscription.
#[derive(Debug)]
pub struct WsSubscription {
    id: SubscriberId,
    filter: RwLock<Filter>,
    outbox: mpsc::UnboundedSender<String>,
}

impl WsSubscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn filter(&self) -> Filter {
        self.filter.read().clone()
    }

    pub fn set_filter(&self, filter: Filter) {
        *self.filter.write() = filter;
    }

    fn deliver(&self, device_type: DeviceType, snapshot: &Value) -> Result<(), DeliveryError> {
        let message = match &*self.filter.read() {
            Filter::Default => serde_json::to_string(snapshot)?,
            Filter::Types(types) if types.contains(&device_type) => {
                serde_json::to_string(&[snapshot])?
            }
            Filter::Types(_) => return Ok(()),
        };
        self.outbox.send(message).map_err(|_| DeliveryError::Closed)
    }
}

/// A request the webhook worker should issue.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookRequest {
    /// Bodyless GET: "something changed".
    Get,
    /// POST with a JSON body.
    Post(Value),
}

impl WebhookRequest {
    pub fn body(&self) -> Option<&Value> {
        match self {
            WebhookRequest::Get => None,
            WebhookRequest::Post(body) => Some(body),
        }
    }
}

#[derive(Debug)]
struct WebhookSink {
    id: SubscriberId,
    allowed: HashSet<DeviceType>,
    complex: bool,
    outbox: mpsc::UnboundedSender<WebhookRequest>,
}

impl WebhookSink {
    fn deliver(&self, device_type: DeviceType, snapshot: &Value) -> Result<(), DeliveryError> {
        if !self.allowed.contains(&device_type) {
            return Ok(());
        }
        let request = if self.complex {
            WebhookRequest::Post(Value::Array(vec![snapshot.clone()]))
        } else {
            WebhookRequest::Get
        };
        self.outbox.send(request).map_err(|_| DeliveryError::Closed)
    }
}

/// Receiver of device events on behalf of the Modbus server.
pub trait ModbusContext: Send + Sync {
    fn status_changed(&self, device: &Device);
    fn config_changed(&self, device: &Device);
}

#[derive(Debug)]
enum Subscriber {
    WebSocket(Arc<WsSubscription>),
    Webhook(WebhookSink),
}

impl Subscriber {
    fn id(&self) -> SubscriberId {
        match self {
            Subscriber::WebSocket(ws) => ws.id,
            Subscriber::Webhook(hook) => hook.id,
        }
    }
}

/// Routes device status and configuration events to subscribers.
pub struct Dispatcher {
    subscribers: RwLock<Vec<Subscriber>>,
    modbus: RwLock<Option<Arc<dyn ModbusContext>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscribers", &self.subscribers.read().len())
            .field("modbus", &self.modbus.read().is_some())
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create a new dispatcher with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            modbus: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> SubscriberId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a WebSocket session with the default filter.
    pub fn subscribe_websocket(&self) -> (Arc<WsSubscription>, mpsc::UnboundedReceiver<String>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let subscription = Arc::new(WsSubscription {
            id: self.allocate_id(),
            filter: RwLock::new(Filter::Default),
            outbox,
        });
        self.subscribers
            .write()
            .push(Subscriber::WebSocket(Arc::clone(&subscription)));
        tracing::debug!(subscriber = subscription.id, "WebSocket subscriber added");
        (subscription, rx)
    }

    /// Register a webhook sink for the given device types.
    pub fn add_webhook(
        &self,
        allowed: impl IntoIterator<Item = DeviceType>,
        complex: bool,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<WebhookRequest>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let id = self.allocate_id();
        self.subscribers.write().push(Subscriber::Webhook(WebhookSink {
            id,
            allowed: allowed.into_iter().collect(),
            complex,
            outbox,
        }));
        tracing::debug!(subscriber = id, complex, "Webhook subscriber added");
        (id, rx)
    }

    /// Remove a subscriber. Returns how many subscribers remain.
    pub fn unsubscribe(&self, id: SubscriberId) -> usize {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|s| s.id() != id);
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Install the Modbus server's context. It receives every event.
    pub fn set_modbus_context(&self, context: Arc<dyn ModbusContext>) {
        *self.modbus.write() = Some(context);
    }

    /// Fan a device's status change out to all subscribers.
    pub fn status_changed(&self, device: &Device) {
        let device_type = device.device_type();
        let snapshot = device.snapshot();

        for subscriber in self.subscribers.read().iter() {
            let result = match subscriber {
                Subscriber::WebSocket(ws) => ws.deliver(device_type, &snapshot),
                Subscriber::Webhook(hook) => hook.deliver(device_type, &snapshot),
            };
            if let Err(e) = result {
                tracing::warn!(
                    subscriber = subscriber.id(),
                    circuit = %device.circuit(),
                    error = %e,
                    "Failed to deliver status event"
                );
            }
        }

        let modbus = self.modbus.read().clone();
        if let Some(context) = modbus {
            context.status_changed(device);
        }
    }

    /// Configuration changes only reach the Modbus server context.
    pub fn config_changed(&self, device: &Device) {
        let modbus = self.modbus.read().clone();
        if let Some(context) = modbus {
            context.config_changed(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_parse_rules() {
        assert_eq!(Filter::from_names(&json!("relay")), None);
        assert_eq!(
            Filter::from_names(&json!([])),
            Some(Filter::Types(BTreeSet::new()))
        );
        assert_eq!(
            Filter::from_names(&json!(["default", "relay"])),
            Some(Filter::Default)
        );
        assert_eq!(Filter::from_names(&json!(["flux"])), None);

        let filter = Filter::from_names(&json!(["relay", "flux", "ai"])).unwrap();
        assert!(filter.admits(DeviceType::Relay));
        assert!(filter.admits(DeviceType::Ai));
        assert!(!filter.admits(DeviceType::Input));
    }

    #[test]
    fn test_filter_alt_names() {
        let filter = Filter::from_names(&json!(["temp"])).unwrap();
        assert!(filter.admits(DeviceType::Sensor));
    }

    #[test]
    fn test_unsubscribe_counts_all_subscribers() {
        let dispatcher = Dispatcher::new();
        let (ws, _ws_rx) = dispatcher.subscribe_websocket();
        let (_hook, _hook_rx) = dispatcher.add_webhook([DeviceType::Input], false);

        assert_eq!(dispatcher.subscriber_count(), 2);
        assert_eq!(dispatcher.unsubscribe(ws.id()), 1);
        // Unknown ids are ignored
        assert_eq!(dispatcher.unsubscribe(9999), 1);
    }

    #[test]
    fn test_ws_delivery_shapes() {
        let dispatcher = Dispatcher::new();
        let (ws, mut rx) = dispatcher.subscribe_websocket();
        let snapshot = json!({ "dev": "relay", "circuit": "1_01" });

        ws.deliver(DeviceType::Relay, &snapshot).unwrap();
        let message: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(message, snapshot);

        ws.set_filter(Filter::Types([DeviceType::Relay].into_iter().collect()));
        ws.deliver(DeviceType::Relay, &snapshot).unwrap();
        let message: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(message, json!([snapshot]));

        ws.deliver(DeviceType::Input, &snapshot).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_session_reports_error() {
        let dispatcher = Dispatcher::new();
        let (ws, rx) = dispatcher.subscribe_websocket();
        drop(rx);

        let result = ws.deliver(DeviceType::Relay, &json!({}));
        assert!(matches!(result, Err(DeliveryError::Closed)));
    }
}
