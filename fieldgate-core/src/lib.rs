//! fieldgate core
//!
//! Everything between the hardware and the transports:
//!
//! - [`config`] - Gateway configuration and the hardware tree
//! - [`device`] - Device types and per-type state
//! - [`bus`] - Buses and the driver seam
//! - [`drivers`] - Modbus TCP/RTU and 1-Wire drivers
//! - [`registry`] - Device registry with circuit and alias lookup
//! - [`builder`] - Hardware tree construction
//! - [`dispatch`] - Event fan-out to subscribers
//! - [`command`] - Command routing for REST, bulk and WebSocket requests
//! - [`lifecycle`] - Startup, scanning and shutdown orchestration

pub mod builder;
pub mod bus;
pub mod command;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod drivers;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod webhook;

// Re-export commonly used types at the crate root
pub use builder::{BuildReport, Builder};
pub use bus::{Bus, BusDriver, BusState, ModbusIo};
pub use command::{Arguments, BulkRequest, BulkResponse, Command, CommandGateway, Operation};
pub use config::{AliasDocument, ConfigError, GatewayConfig};
pub use device::{Device, DeviceKind, DeviceType};
pub use dispatch::{Dispatcher, Filter, ModbusContext, SubscriberId, WebhookRequest, WsSubscription};
pub use error::{BuildError, DriverError, GatewayError, Result};
pub use lifecycle::Gateway;
pub use registry::Registry;
