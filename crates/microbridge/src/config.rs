use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Port the peripheral side forwards to unless told otherwise.
pub const DEFAULT_PORT: u16 = 4567;

/// Payloads shorter than this are treated as line noise and never reach the listener.
pub const MIN_PAYLOAD_LEN: usize = 2;

pub(crate) const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Where listener callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// A dedicated dispatcher thread drains the event queue.
    #[default]
    Thread,
    /// The embedding application pumps events itself via
    /// [`MicroBridge::dispatch_pending`](crate::MicroBridge::dispatch_pending).
    Manual,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    pub min_payload_len: usize,
    pub read_buffer_size: usize,
    pub dispatch: DispatchMode,
    /// Log lifecycle events at `info` instead of `trace`.
    pub debug: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            min_payload_len: MIN_PAYLOAD_LEN,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            dispatch: DispatchMode::default(),
            debug: false,
        }
    }
}

impl BridgeConfig {
    #[inline]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Loopback-only config, handy when the port forward terminates on the same host.
    pub fn loopback() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::default()
        }
    }
}
