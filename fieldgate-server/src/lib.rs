//! Network front-end for the fieldgate I/O gateway.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │  REST / WS   │────>│     Gateway     │<────│  Modbus/TCP      │
//! │  (axum)      │<────│ (fieldgate-core)│────>│  register image  │
//! └──────────────┘     └─────────────────┘     └──────────────────┘
//! ```
//!
//! - [`http`] - REST, bulk and WebSocket routes over the command gateway
//! - [`modbus_server`] - Read-only Modbus/TCP view of device state

pub mod http;
pub mod modbus_server;

pub use http::HttpServer;
pub use modbus_server::{ModbusServer, RegisterImage};
