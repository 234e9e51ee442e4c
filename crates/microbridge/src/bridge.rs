//! Public façade: owns the relay server, mirrors connection state, and forwards
//! events to the registered [`AdbListener`].
//!
//! Every failure is logged and swallowed here. Embedders get "connect, and keep
//! trying to be useful" behavior; the `try_*` variants expose the underlying
//! `Result` for callers that want it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, trace, warn};

use crate::VERSION;
use crate::config::BridgeConfig;
use crate::dispatch::{EventBridge, EventHandler, is_deliverable};
use crate::error::BridgeError;
use crate::listener::AdbListener;
use crate::net::{RelayServer, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// State touched from the dispatch context.
struct BridgeShared {
    connected: AtomicBool,
    debug: AtomicBool,
    min_payload_len: usize,
    listener: Mutex<Box<dyn AdbListener>>,
}

impl BridgeShared {
    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::Acquire) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    fn lifecycle_log(&self, message: &str) {
        if self.debug.load(Ordering::Relaxed) {
            info!("{message}");
        } else {
            trace!("{message}");
        }
    }
}

impl EventHandler for BridgeShared {
    fn handle(&self, event: ServerEvent) {
        match event {
            ServerEvent::ServerStarted { local_addr } => {
                self.lifecycle_log("Adb server started");
                self.listener.lock().server_started(local_addr);
            }
            ServerEvent::ServerStopped => {
                self.lifecycle_log("Adb server stopped");
                self.set_connected(false);
                self.listener.lock().server_stopped();
            }
            ServerEvent::ClientConnected { .. } => {
                self.lifecycle_log("Adb client connected");
                self.set_connected(true);
                self.listener.lock().adb_connected();
            }
            ServerEvent::ClientDisconnected { .. } => {
                self.lifecycle_log("Adb client disconnected");
                self.set_connected(false);
                self.listener.lock().adb_disconnected();
            }
            ServerEvent::ClientReceived { conn_id, payload } => {
                self.lifecycle_log("Adb client received data");
                if !is_deliverable(&payload, self.min_payload_len) {
                    trace!(conn_id, len = payload.len(), "Dropping short payload");
                    return;
                }
                self.listener.lock().adb_event(&payload);
            }
        }
    }
}

/// Bridge between a host application and one port-forwarded peripheral.
///
/// ```no_run
/// use microbridge::{AdbListener, MicroBridge};
///
/// struct Printer;
///
/// impl AdbListener for Printer {
///     fn adb_connected(&mut self) {}
///     fn adb_disconnected(&mut self) {}
///     fn adb_event(&mut self, data: &[u8]) {
///         println!("{data:?}");
///     }
/// }
///
/// let bridge = MicroBridge::new(Printer).unwrap();
/// bridge.connect();
/// bridge.write("hello");
/// ```
pub struct MicroBridge {
    shared: Arc<BridgeShared>,
    config: BridgeConfig,
    server: Mutex<Option<RelayServer>>,
    events: EventBridge,
}

impl MicroBridge {
    pub fn new(listener: impl AdbListener) -> Result<Self, BridgeError> {
        Self::with_config(listener, BridgeConfig::default())
    }

    pub fn with_config(
        listener: impl AdbListener,
        config: BridgeConfig,
    ) -> Result<Self, BridgeError> {
        let listener: Box<dyn AdbListener> = Box::new(listener);
        let shared = Arc::new(BridgeShared {
            connected: AtomicBool::new(false),
            debug: AtomicBool::new(config.debug),
            min_payload_len: config.min_payload_len,
            listener: Mutex::new(listener),
        });
        let events = EventBridge::new(config.dispatch, shared.clone())?;

        Ok(Self {
            shared,
            config,
            server: Mutex::new(None),
            events,
        })
    }

    /// Start relaying on the configured port (4567 unless overridden).
    pub fn connect(&self) {
        self.connect_on(self.config.port);
    }

    /// Start relaying on `port`. A bind failure leaves the bridge disconnected
    /// and is only logged.
    pub fn connect_on(&self, port: u16) {
        if let Err(e) = self.try_connect_on(port) {
            error!(port, error = %e, "Failed to start relay server");
        }
    }

    /// Like [`MicroBridge::connect_on`], but hands the error back.
    ///
    /// Any previously running server is stopped first.
    pub fn try_connect_on(&self, port: u16) -> Result<SocketAddr, BridgeError> {
        let mut slot = self.server.lock();
        if let Some(mut previous) = slot.take() {
            previous.stop();
        }

        let mut server = RelayServer::new(self.events.sender(), &self.config);
        let addr = SocketAddr::new(self.config.bind_ip, port);
        match server.start(addr) {
            Ok(local_addr) => {
                *slot = Some(server);
                Ok(local_addr)
            }
            Err(e) => {
                self.shared.set_connected(false);
                Err(e)
            }
        }
    }

    /// Send raw bytes or a string to the peer. Failures are logged, never returned.
    pub fn write(&self, message: impl AsRef<[u8]>) {
        let bytes = message.as_ref();
        if let Err(e) = self.try_write(bytes) {
            if e.is_not_connected() {
                warn!(len = bytes.len(), error = %e, "Dropping write");
            } else {
                error!(len = bytes.len(), error = %e, "Write to client failed");
            }
        }
    }

    /// Send one character, UTF-8 encoded.
    ///
    /// ASCII characters go out as a single byte. Anything else takes two to
    /// four bytes on the wire, so peers expecting one byte per char should be
    /// fed through [`MicroBridge::write_byte`] instead.
    pub fn write_char(&self, c: char) {
        let mut buf = [0u8; 4];
        self.write(c.encode_utf8(&mut buf).as_bytes());
    }

    pub fn write_byte(&self, byte: u8) {
        self.write([byte]);
    }

    /// Like [`MicroBridge::write`], but hands the error back.
    ///
    /// The server lock is released before the write starts, so `stop()` can
    /// always interrupt a write to a peer that stopped reading.
    pub fn try_write(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        let sender = self.server.lock().as_ref().map(RelayServer::sender);
        match sender {
            Some(sender) => sender.send(bytes),
            None => Err(BridgeError::NotStarted),
        }
    }

    /// Tear down the relay server. No-op when nothing is running.
    pub fn stop(&self) {
        if let Some(server) = self.server.lock().as_mut() {
            server.stop();
        }
    }

    /// Connection state as last reported through the event bridge.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Bound address of the relay server while it is listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().and_then(RelayServer::local_addr)
    }

    /// Toggle verbose lifecycle logging. Has no other effect.
    pub fn set_debug(&self, enabled: bool) {
        self.shared.debug.store(enabled, Ordering::Relaxed);
    }

    pub fn is_debug(&self) -> bool {
        self.shared.debug.load(Ordering::Relaxed)
    }

    /// Deliver queued events on the calling thread ([`DispatchMode::Manual`](crate::DispatchMode::Manual) only).
    pub fn dispatch_pending(&self) -> usize {
        self.events.dispatch_pending()
    }

    /// Wait up to `timeout` for one event and deliver it on the calling thread
    /// ([`DispatchMode::Manual`](crate::DispatchMode::Manual) only).
    pub fn dispatch_timeout(&self, timeout: Duration) -> bool {
        self.events.dispatch_timeout(timeout)
    }

    pub fn version() -> &'static str {
        VERSION
    }
}

impl Drop for MicroBridge {
    fn drop(&mut self) {
        // Stop the server first so its final events are queued before the
        // dispatcher drains and exits.
        drop(self.server.lock().take());
        self.events.shutdown();
    }
}
