pub mod connection;
pub mod event;
pub mod server;

pub use connection::Connection;
pub use event::{ConnId, ServerEvent};
pub use server::{EventTx, RelaySender, RelayServer, ServerLifecycle};
