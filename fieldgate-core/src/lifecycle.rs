//! Gateway lifecycle: startup ordering, subscriber-driven scanning and
//! shutdown.

use futures_util::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::builder::{BuildReport, Builder};
use crate::command::CommandGateway;
use crate::config::{AliasDocument, GatewayConfig};
use crate::device::DeviceType;
use crate::dispatch::{Dispatcher, ModbusContext, SubscriberId, WsSubscription};
use crate::error::Result;
use crate::registry::Registry;
use crate::webhook;

/// Bus activation order. Buses within a group start concurrently; a group
/// starts only after the previous one has finished.
pub const ACTIVATION_GROUPS: [&[DeviceType]; 2] = [
    &[DeviceType::I2cBus, DeviceType::GpioBus, DeviceType::OwBus],
    &[DeviceType::AdChip, DeviceType::TcpBus, DeviceType::SerialBus],
];

/// Buses switched back to synchronous mode first at shutdown, in order.
pub const SYNC_BUSES: [DeviceType; 2] = [DeviceType::I2cBus, DeviceType::GpioBus];

/// The running gateway: configuration, registry, dispatcher and command
/// gateway, shared by every transport.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    commands: CommandGateway,
    webhook: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Create a new gateway with an empty registry.
    pub fn new(config: GatewayConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let commands = CommandGateway::new(Arc::clone(&registry), config.websocket_all_filtered);
        Self {
            config,
            registry,
            dispatcher: Arc::new(Dispatcher::new()),
            commands,
            webhook: Mutex::new(None),
        }
    }

    /// Build, alias and activate everything described by `config`.
    pub async fn start(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let gateway = Self::new(config);

        gateway.start_webhook()?;
        let report = gateway.build();
        if !report.failures.is_empty() {
            tracing::warn!(
                failures = report.failures.len(),
                "Some buses or devices could not be constructed"
            );
        }
        gateway.load_alias_files();
        gateway.activate_buses().await;
        gateway.activate_slaves().await;

        tracing::info!(devices = gateway.registry.len(), "Gateway started");
        Ok(gateway)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn commands(&self) -> &CommandGateway {
        &self.commands
    }

    /// Construct the hardware tree into the registry.
    pub fn build(&self) -> BuildReport {
        if self.config.hw_tree.is_empty() {
            tracing::warn!("No hw_tree configured, starting without hardware");
        }
        Builder::new(
            &self.registry,
            Arc::clone(&self.dispatcher),
            &self.config.hw_definitions,
        )
        .build(&self.config.hw_tree)
    }

    /// Register the configured webhook sink and start its worker.
    pub fn start_webhook(&self) -> Result<()> {
        let settings = &self.config.webhook;
        if !settings.enabled {
            return Ok(());
        }

        let allowed = settings.allowed_types()?;
        let (_, requests) = self
            .dispatcher
            .add_webhook(allowed, settings.complex_events);
        let handle = webhook::spawn_worker(settings.address.clone(), requests);
        if let Some(previous) = self.webhook.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Load every configured alias file. Returns the number of aliases
    /// bound.
    pub fn load_alias_files(&self) -> usize {
        let mut bound = 0;
        for path in &self.config.alias_files {
            match AliasDocument::load_from_file(path) {
                Ok(document) => bound += self.apply_aliases(&document),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping alias file"
                ),
            }
        }
        bound
    }

    /// Bind the aliases of one document. Entries naming unknown devices or
    /// aliases taken by another device are logged and skipped.
    pub fn apply_aliases(&self, document: &AliasDocument) -> usize {
        let mut bound = 0;
        for entry in &document.aliases {
            match self.bind_alias(&entry.dev_type, &entry.circuit, &entry.name) {
                Ok(true) => bound += 1,
                Ok(false) => tracing::warn!(
                    alias = %entry.name,
                    "Alias already names another device"
                ),
                Err(e) => tracing::warn!(
                    alias = %entry.name,
                    dev_type = %entry.dev_type,
                    circuit = %entry.circuit,
                    error = %e,
                    "Skipping alias"
                ),
            }
        }
        bound
    }

    /// Bind `alias` to a device. A device's previous alias is released.
    /// Re-binding a device to the alias it already carries succeeds.
    pub fn bind_alias(&self, dev_type: &str, circuit: &str, alias: &str) -> Result<bool> {
        let device_type: DeviceType = dev_type.parse()?;
        let device = self.registry.lookup_by_circuit(device_type, circuit)?;
        if device.alias().as_deref() == Some(alias) {
            return Ok(true);
        }
        if !self.registry.register_alias(alias, &device) {
            return Ok(false);
        }
        if let Some(previous) = device.set_alias(Some(alias.to_string())) {
            self.registry.remove_alias(&previous);
        }
        Ok(true)
    }

    /// Activate buses group by group. Failures are logged; the bus stays
    /// inactive and its devices report errors on access.
    pub async fn activate_buses(&self) {
        for group in ACTIVATION_GROUPS {
            let buses: Vec<_> = group
                .iter()
                .flat_map(|t| self.registry.lookup_by_type(*t))
                .collect();

            let results = join_all(buses.iter().filter_map(|device| {
                let bus = device.as_bus()?;
                Some(async move { (bus.name(), bus.activate().await) })
            }))
            .await;

            for (name, result) in results {
                if let Err(e) = result {
                    tracing::error!(bus = %name, error = %e, "Bus activation failed");
                }
            }
        }
    }

    /// Initial scan of every slave, then start scanning where enabled.
    pub async fn activate_slaves(&self) {
        for device in self.registry.modbus_slaves() {
            let Some(slave) = device.as_slave() else {
                continue;
            };
            slave.activate().await;
            if slave.scan_enabled() {
                if let Err(e) = slave.start_scanning() {
                    tracing::warn!(slave = %device.circuit(), error = %e, "Scanning not started");
                }
            }
        }
    }

    /// Restart scanning of enabled slaves that were stopped while idle.
    pub fn resume_scanning(&self) {
        for device in self.registry.modbus_slaves() {
            let Some(slave) = device.as_slave() else {
                continue;
            };
            if slave.scan_enabled() && !slave.is_scanning() && slave.bus().is_active() {
                if let Err(e) = slave.start_scanning() {
                    tracing::warn!(slave = %device.circuit(), error = %e, "Scanning not resumed");
                }
            }
        }
    }

    /// Stop every slave's scan task.
    pub fn stop_scanning(&self) {
        for device in self.registry.modbus_slaves() {
            if let Some(slave) = device.as_slave() {
                slave.stop_scanning();
            }
        }
    }

    /// Open a WebSocket subscription, resuming scanning if it was idle.
    pub fn subscribe_websocket(&self) -> (Arc<WsSubscription>, mpsc::UnboundedReceiver<String>) {
        let subscription = self.dispatcher.subscribe_websocket();
        self.resume_scanning();
        subscription
    }

    /// Drop a subscriber. When none remain, scanning stops.
    pub fn unsubscribe(&self, id: SubscriberId) -> usize {
        let remaining = self.dispatcher.unsubscribe(id);
        if remaining == 0 {
            tracing::info!("No subscribers left, stopping slave scanning");
            self.stop_scanning();
        }
        remaining
    }

    /// Route events to the Modbus server's register image.
    pub fn set_modbus_context(&self, context: Arc<dyn ModbusContext>) {
        self.dispatcher.set_modbus_context(context);
    }

    /// Stop scanning, switch synchronous buses back (I2C, then GPIO), then
    /// release the remaining buses and the webhook worker.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down gateway");
        self.stop_scanning();

        for device_type in SYNC_BUSES {
            self.deactivate_type(device_type).await;
        }
        for device_type in DeviceType::ALL
            .into_iter()
            .filter(|t| t.is_bus() && !SYNC_BUSES.contains(t))
        {
            self.deactivate_type(device_type).await;
        }

        if let Some(handle) = self.webhook.lock().take() {
            handle.abort();
        }
    }

    async fn deactivate_type(&self, device_type: DeviceType) {
        for device in self.registry.lookup_by_type(device_type) {
            let Some(bus) = device.as_bus() else {
                continue;
            };
            if let Err(e) = bus.deactivate().await {
                tracing::warn!(bus = %bus.name(), error = %e, "Bus deactivation failed");
            }
        }
    }
}
