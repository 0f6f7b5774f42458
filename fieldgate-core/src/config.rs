//! Gateway configuration: transports, event fan-out and the hardware tree.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use fieldgate_common::LoggingConfig;

use crate::device::DeviceType;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or parsed
    #[error(transparent)]
    Load(#[from] fieldgate_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// REST / WebSocket listener
    #[serde(default)]
    pub http: HttpConfig,

    /// Modbus TCP server exposing the register image
    #[serde(default)]
    pub modbus_server: ModbusServerConfig,

    /// Outbound webhook notifications
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Apply a session's filter to "all" requests as well
    #[serde(default)]
    pub websocket_all_filtered: bool,

    /// Alias documents loaded at startup
    #[serde(default)]
    pub alias_files: Vec<PathBuf>,

    /// Modbus slave models referenced by `model` in the hardware tree
    #[serde(default)]
    pub hw_definitions: HashMap<String, ModelDefinition>,

    /// Buses and the devices attached to them, in declaration order
    #[serde(default)]
    pub hw_tree: IndexMap<String, BusSpec>,
}

/// HTTP transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address
    #[serde(default = "default_bind")]
    pub address: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Allowed CORS origins, "*" for any
    #[serde(default = "default_cors")]
    pub cors_domains: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: default_bind(),
            port: default_http_port(),
            cors_domains: default_cors(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_cors() -> String {
    "*".to_string()
}

/// Modbus TCP server settings. Port 0 disables the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusServerConfig {
    #[serde(default = "default_bind")]
    pub address: String,

    #[serde(default)]
    pub port: u16,
}

impl Default for ModbusServerConfig {
    fn default() -> Self {
        Self {
            address: default_bind(),
            port: 0,
        }
    }
}

impl ModbusServerConfig {
    pub fn enabled(&self) -> bool {
        self.port != 0
    }
}

/// Webhook settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Target URL
    #[serde(default = "default_webhook_address")]
    pub address: String,

    /// Device types whose status changes are delivered
    #[serde(default = "default_device_mask")]
    pub device_mask: Vec<String>,

    /// POST the device snapshot instead of a bodyless GET
    #[serde(default)]
    pub complex_events: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_webhook_address(),
            device_mask: default_device_mask(),
            complex_events: false,
        }
    }
}

fn default_webhook_address() -> String {
    "http://127.0.0.1:80/index.html".to_string()
}

fn default_device_mask() -> Vec<String> {
    vec!["input".to_string(), "sensor".to_string()]
}

impl WebhookConfig {
    /// Resolve the device mask to types. Unknown names are an error.
    pub fn allowed_types(&self) -> Result<Vec<DeviceType>, ConfigError> {
        self.device_mask
            .iter()
            .map(|name| {
                DeviceType::from_name(name).ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "webhook.device_mask: unknown device type '{}'",
                        name
                    ))
                })
            })
            .collect()
    }
}

/// One bus entry of the hardware tree.
///
/// Type-specific settings (hostname, port, baudrate, ...) are kept in
/// `params` and interpreted by the builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSpec {
    /// Bus type tag: "MODBUSTCP", "MODBUSRTU" or "OWBUS"
    #[serde(rename = "type", default)]
    pub bus_type: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Devices on this bus, in declaration order
    #[serde(default)]
    pub devices: IndexMap<String, DeviceSpec>,

    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// One device entry below a bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub params: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

/// Register layout of a Modbus slave model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub blocks: Vec<BlockDefinition>,
}

/// A run of consecutive points of one type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDefinition {
    /// Point type (relay, led, input, register, ai, ao)
    #[serde(rename = "type")]
    pub point_type: DeviceType,

    /// First coil / register address (0-based)
    pub start: u16,

    /// Number of points (default: 1)
    #[serde(default = "default_count")]
    pub count: u16,

    /// Data type for ai/ao points
    #[serde(default)]
    pub data_type: DataType,

    /// Scaling factor (value * scale)
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Offset (value * scale + offset)
    #[serde(default)]
    pub offset: f64,

    /// Unit of measurement
    pub unit: Option<String>,
}

fn default_count() -> u16 {
    1
}

fn default_scale() -> f64 {
    1.0
}

/// Data type interpretation for 16-bit registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unsigned 16-bit integer (default)
    #[default]
    U16,
    /// Signed 16-bit integer
    I16,
    /// Unsigned 32-bit integer (2 registers, big-endian)
    U32,
    /// Signed 32-bit integer (2 registers, big-endian)
    I32,
    /// 32-bit float (2 registers, big-endian)
    F32,
    /// Unsigned 32-bit integer (2 registers, little-endian word order)
    U32Le,
    /// Signed 32-bit integer (2 registers, little-endian word order)
    I32Le,
    /// 32-bit float (2 registers, little-endian word order)
    F32Le,
}

impl DataType {
    /// Number of 16-bit registers one value occupies.
    pub fn width(&self) -> u16 {
        match self {
            DataType::U16 | DataType::I16 => 1,
            _ => 2,
        }
    }
}

/// Alias document: `{version: 1.0, aliases: [{dev_type, circuit, name}]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasDocument {
    pub version: f64,

    #[serde(default)]
    pub aliases: Vec<AliasEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasEntry {
    pub dev_type: String,
    pub circuit: String,
    pub name: String,
}

impl AliasDocument {
    /// Supported document version.
    pub const VERSION: f64 = 1.0;

    /// Load an alias document from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let document: AliasDocument = fieldgate_common::load_config(path)?;
        if document.version != Self::VERSION {
            return Err(ConfigError::Validation(format!(
                "unsupported alias document version {}",
                document.version
            )));
        }
        Ok(document)
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: GatewayConfig = fieldgate_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Only problems that make the whole configuration unusable are
    /// reported here. Individual bad buses or devices are isolated by the
    /// builder instead.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.port == 0 {
            return Err(ConfigError::Validation(
                "http.port cannot be 0".to_string(),
            ));
        }

        if self.modbus_server.enabled() && self.modbus_server.port == self.http.port {
            return Err(ConfigError::Validation(format!(
                "modbus_server.port {} collides with http.port",
                self.modbus_server.port
            )));
        }

        self.webhook.allowed_types()?;
        if self.webhook.enabled && self.webhook.address.is_empty() {
            return Err(ConfigError::Validation(
                "webhook.address cannot be empty when webhooks are enabled".to_string(),
            ));
        }

        for (name, model) in &self.hw_definitions {
            if model.blocks.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Model '{}': must declare at least one block",
                    name
                )));
            }

            for block in &model.blocks {
                if !block.point_type.is_modbus_point() {
                    return Err(ConfigError::Validation(format!(
                        "Model '{}': '{}' cannot be mapped to Modbus registers",
                        name, block.point_type
                    )));
                }

                if block.count == 0 {
                    return Err(ConfigError::Validation(format!(
                        "Model '{}': block at {} has count 0",
                        name, block.start
                    )));
                }

                if block.point_type == DeviceType::Ao && block.scale == 0.0 {
                    return Err(ConfigError::Validation(format!(
                        "Model '{}': ao block at {} has scale 0",
                        name, block.start
                    )));
                }
            }
        }

        Ok(())
    }
}
