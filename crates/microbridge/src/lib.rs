//! MicroBridge relay library
//!
//! Bridges a host application to a single peripheral reachable through a
//! port-forwarded TCP socket. The peripheral connects to a local port; raw byte
//! chunks are relayed in both directions and lifecycle/data events are handed to
//! one registered listener.
//!
//! # Architecture
//!
//! - [`net`]: Single-peer TCP relay server and its connection type
//! - `dispatch`: Ordered event delivery from server threads to the listener
//! - [`bridge`]: Public façade that mirrors connection state
//! - [`listener`]: Listener trait implemented by embedders
//! - [`config`]: Configuration and defaults
//! - [`error`]: Error types

pub mod bridge;
pub mod config;
pub(crate) mod dispatch;
pub mod error;
pub mod listener;
pub mod net;

/// Library version, taken from the package manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use bridge::{ConnectionState, MicroBridge};
pub use config::{BridgeConfig, DEFAULT_PORT, DispatchMode, MIN_PAYLOAD_LEN};
pub use error::BridgeError;
pub use listener::{AdbListener, NoopListener};
pub use net::{ConnId, RelaySender, RelayServer, ServerEvent, ServerLifecycle};
