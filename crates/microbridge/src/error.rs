//! Relay error types.

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("no peer connected")]
    NotConnected,

    #[error("relay server is not running")]
    NotStarted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// True for errors that only mean "nobody is listening on the other end".
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected | Self::NotStarted)
    }
}
