//! WebSocket to SSH shell bridge.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Wire messages exchanged with the terminal client and core value types
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy for the connection lifecycle
//! - `auth`: Authentication policy used when acting as an SSH server
//! - `session`: russh client handler
//! - `negotiator`: russh server handler for inbound SSH clients
//! - `shell`: Shell session facade over both SSH roles
//! - `demo`: Standalone demo SSH server
//! - `pump`: Bidirectional data pump between shell channel and message channel
//! - `lifecycle`: Per-connection state machine
//! - `registry`: Bookkeeping of live connections
//! - `transport`: WebSocket message channel and HTTP endpoint

pub mod auth;
pub mod config;
pub mod demo;
pub mod error;
pub mod lifecycle;
pub mod negotiator;
pub mod pump;
pub mod registry;
pub mod session;
pub mod shell;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::BridgeConfig;
pub use lifecycle::Connection;
pub use registry::ConnectionRegistry;
pub use transport::{BridgeState, build_app};
