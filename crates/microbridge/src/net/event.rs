use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

/// Unique connection identifier assigned by the relay server.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Events produced by the relay server threads.
///
/// Current behavior:
/// - `ServerStarted` is emitted once after a successful bind.
/// - `ClientConnected` is emitted once per adopted connection.
/// - `ClientReceived` is emitted for every non-empty read, unframed.
/// - `ClientDisconnected` is emitted after the read loop has released the connection.
/// - `ServerStopped` is emitted last, after any pending `ClientDisconnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ServerStarted {
        local_addr: SocketAddr,
    },

    ServerStopped,

    ClientConnected {
        conn_id: ConnId,
        peer: SocketAddr,
    },

    ClientDisconnected {
        conn_id: ConnId,
        /// Best-effort human-readable reason (logging/debug).
        reason: String,
    },

    ClientReceived {
        conn_id: ConnId,
        payload: Bytes,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServerStarted { .. } => "server_started",
            Self::ServerStopped => "server_stopped",
            Self::ClientConnected { .. } => "client_connected",
            Self::ClientDisconnected { .. } => "client_disconnected",
            Self::ClientReceived { .. } => "client_received",
        }
    }
}
