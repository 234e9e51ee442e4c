//! Single-peer TCP relay server.
//!
//! The server owns one listening socket and at most one [`Connection`]. Two kinds of
//! threads produce [`ServerEvent`]s:
//! - the accept loop, which adopts a peer when none is active and rejects the rest;
//! - one read loop per adopted peer, which forwards every chunk it reads.
//!
//! Synchronous failures (bind, write) are returned to the caller. Peer-driven
//! disconnects and accept failures after start are reported as events.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;

use super::connection::Connection;
use super::event::ServerEvent;

/// Sender half of the event queue the server publishes into.
pub type EventTx = Sender<ServerEvent>;

const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const WAKE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLifecycle {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

struct ServerShared {
    lifecycle: Mutex<ServerLifecycle>,
    /// The only slot touched by the accept loop, the read loop and the send path.
    active: Mutex<Option<Arc<Connection>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    /// Both flags below are only touched while `lifecycle` is locked.
    accept_exited: AtomicBool,
    /// `stop()` could not wake the accept loop and left the rest of the teardown to it.
    stop_deferred: AtomicBool,
    events: EventTx,
    read_buffer_size: usize,
}

impl ServerShared {
    fn emit(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            trace!("event receiver dropped; discarding server event");
        }
    }

    #[inline]
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn lifecycle(&self) -> ServerLifecycle {
        *self.lifecycle.lock()
    }

    /// Adopt `stream` as the active peer, or reject it if one is already active.
    fn adopt(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let conn = {
            let mut active = self.active.lock();
            if self.is_stopping() {
                return;
            }
            if let Some(current) = active.as_ref() {
                warn!(
                    conn_id = current.id(),
                    %peer,
                    "Rejecting peer: a connection is already active"
                );
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }

            let conn = Arc::new(Connection::new(stream, peer));
            *active = Some(Arc::clone(&conn));
            // Emitted under the slot lock so it cannot overtake the previous
            // connection's `ClientDisconnected`.
            self.emit(ServerEvent::ClientConnected {
                conn_id: conn.id(),
                peer,
            });
            conn
        };
        info!(conn_id = conn.id(), %peer, "Client connected");

        let mut reader = self.reader.lock();
        if let Some(prev) = reader.take() {
            // The previous read loop released the slot, so it is already exiting.
            let _ = prev.join();
        }

        let shared = Arc::clone(self);
        let loop_conn = Arc::clone(&conn);
        let spawned = thread::Builder::new()
            .name(format!("microbridge-read-{}", conn.id()))
            .spawn(move || read_loop(shared, loop_conn));

        match spawned {
            Ok(handle) => *reader = Some(handle),
            Err(e) => {
                error!(conn_id = conn.id(), error = %e, "Failed to spawn read loop");
                conn.close();
                self.release(&conn, format!("read loop spawn failed: {e}"));
            }
        }
    }

    /// Clear the active slot if it still holds `conn` and announce the disconnect.
    fn release(&self, conn: &Arc<Connection>, reason: String) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|c| c.id() == conn.id()) {
            *active = None;
        }
        self.emit(ServerEvent::ClientDisconnected {
            conn_id: conn.id(),
            reason: reason.clone(),
        });
        drop(active);
        info!(conn_id = conn.id(), peer = %conn.peer_addr(), %reason, "Client disconnected");
    }

    fn close_active(&self) {
        if let Some(conn) = self.active.lock().take() {
            debug!(conn_id = conn.id(), "Closing active connection");
            conn.close();
        }
    }

    fn join_reader(&self) {
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Tear down after the accept loop hit an unrecoverable error.
    fn fail_from_accept(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != ServerLifecycle::Listening {
                return;
            }
            *lifecycle = ServerLifecycle::Stopping;
        }
        self.stopping.store(true, Ordering::Release);
        self.close_active();
        self.join_reader();
        self.emit(ServerEvent::ServerStopped);
        *self.lifecycle.lock() = ServerLifecycle::Stopped;
    }

    /// Hand the end of `stop()` to the accept loop. Returns false if the loop
    /// has already exited, in which case the caller finishes the stop itself.
    fn defer_stop(&self) -> bool {
        let _lifecycle = self.lifecycle.lock();
        if self.accept_exited.load(Ordering::Acquire) {
            return false;
        }
        self.stop_deferred.store(true, Ordering::Release);
        true
    }

    /// Called by the accept loop once its listening socket is closed.
    fn accept_loop_exited(&self) {
        let mut lifecycle = self.lifecycle.lock();
        self.accept_exited.store(true, Ordering::Release);
        if self.stop_deferred.swap(false, Ordering::AcqRel) {
            self.join_reader();
            self.emit(ServerEvent::ServerStopped);
            *lifecycle = ServerLifecycle::Stopped;
            info!("Relay server stopped after deferred shutdown");
        }
    }
}

/// Cloneable write side of a [`RelayServer`].
///
/// Holding one never blocks `stop()`: a write stuck on a peer that stopped
/// reading is failed by the shutdown of the connection.
#[derive(Clone)]
pub struct RelaySender {
    shared: Arc<ServerShared>,
}

impl RelaySender {
    /// Write `bytes` to the active peer.
    ///
    /// Returns [`BridgeError::NotStarted`] when the server is not listening
    /// (never started, stopping or stopped) and [`BridgeError::NotConnected`]
    /// when it is listening with no peer. Both satisfy
    /// [`BridgeError::is_not_connected`].
    pub fn send(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        if self.shared.lifecycle() != ServerLifecycle::Listening {
            return Err(BridgeError::NotStarted);
        }
        // Clone out of the slot so a blocking write never holds the lock the
        // read loop needs to release the connection.
        let conn = self
            .shared
            .active
            .lock()
            .clone()
            .ok_or(BridgeError::NotConnected)?;
        trace!(conn_id = conn.id(), len = bytes.len(), "Sending to client");
        conn.write(bytes)?;
        Ok(())
    }
}

/// TCP server that relays opaque byte chunks to and from a single peer.
pub struct RelayServer {
    shared: Arc<ServerShared>,
    local_addr: Option<SocketAddr>,
    accept_join: Option<JoinHandle<()>>,
}

impl RelayServer {
    pub fn new(events: EventTx, config: &BridgeConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                lifecycle: Mutex::new(ServerLifecycle::Stopped),
                active: Mutex::new(None),
                reader: Mutex::new(None),
                stopping: AtomicBool::new(false),
                accept_exited: AtomicBool::new(false),
                stop_deferred: AtomicBool::new(false),
                events,
                read_buffer_size: config.read_buffer_size.max(1),
            }),
            local_addr: None,
            accept_join: None,
        }
    }

    /// Bind `addr` and start accepting a peer.
    ///
    /// Returns the bound address (useful when `addr` has port 0). Starting a
    /// server that is already listening returns its current address.
    pub fn start(&mut self, addr: SocketAddr) -> Result<SocketAddr, BridgeError> {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            match *lifecycle {
                ServerLifecycle::Stopped => *lifecycle = ServerLifecycle::Starting,
                ServerLifecycle::Stopping => {
                    return Err(BridgeError::Io(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        "previous listener is still shutting down",
                    )));
                }
                other => {
                    debug!(?other, "Relay server already running");
                    return self.local_addr.ok_or(BridgeError::NotStarted);
                }
            }
        }

        // Leftovers from a run that ended on an accept failure.
        if let Some(handle) = self.accept_join.take() {
            let _ = handle.join();
        }
        self.shared.join_reader();

        match self.bind_and_spawn(addr) {
            Ok(local_addr) => Ok(local_addr),
            Err(e) => {
                *self.shared.lifecycle.lock() = ServerLifecycle::Stopped;
                Err(e)
            }
        }
    }

    fn bind_and_spawn(&mut self, addr: SocketAddr) -> Result<SocketAddr, BridgeError> {
        let listener =
            TcpListener::bind(addr).map_err(|source| BridgeError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        self.shared.stopping.store(false, Ordering::Release);
        self.shared.accept_exited.store(false, Ordering::Release);
        self.shared.stop_deferred.store(false, Ordering::Release);
        *self.shared.lifecycle.lock() = ServerLifecycle::Listening;
        self.local_addr = Some(local_addr);
        // Queued before the accept loop exists, so it always precedes `ClientConnected`.
        self.shared.emit(ServerEvent::ServerStarted { local_addr });

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("microbridge-accept".to_string())
            .spawn(move || accept_loop(listener, shared));

        match spawned {
            Ok(handle) => {
                self.accept_join = Some(handle);
                info!(%local_addr, "Relay server listening");
                Ok(local_addr)
            }
            Err(e) => {
                self.shared.emit(ServerEvent::ServerStopped);
                self.local_addr = None;
                Err(BridgeError::Io(e))
            }
        }
    }

    /// Write `bytes` to the active peer. See [`RelaySender::send`] for the errors.
    pub fn send(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        self.sender().send(bytes)
    }

    /// Write handle that can be used without borrowing the server.
    pub fn sender(&self) -> RelaySender {
        RelaySender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Close the peer and the listening socket. Calling this on a stopped server is a no-op.
    ///
    /// `ServerStopped` is only emitted once the listening socket is closed. If
    /// the accept loop cannot be woken, the server stays in
    /// [`ServerLifecycle::Stopping`] and the accept loop finishes the teardown
    /// when the next inbound connection unblocks it.
    pub fn stop(&mut self) {
        if !self.begin_stop() {
            // Either never started or the accept loop already tore things down.
            if let Some(handle) = self.accept_join.take() {
                let _ = handle.join();
            }
            return;
        }

        if let Some(handle) = self.accept_join.take() {
            if self.wake_accept_loop() || !self.shared.defer_stop() {
                let _ = handle.join();
            } else {
                warn!("Accept loop did not wake; port stays bound until it exits");
                self.local_addr = None;
                return;
            }
        }

        self.finish_stop();
    }

    /// Move from `Listening` to `Stopping` and close the active peer.
    fn begin_stop(&mut self) -> bool {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            if *lifecycle != ServerLifecycle::Listening {
                return false;
            }
            *lifecycle = ServerLifecycle::Stopping;
        }
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.close_active();
        true
    }

    /// Connect to our own listener so a blocked `accept` returns.
    fn wake_accept_loop(&self) -> bool {
        let Some(local) = self.local_addr else {
            return false;
        };
        let mut targets = vec![wake_addr(local)];
        if targets[0] != local {
            targets.push(local);
        }

        for attempt in 1..=WAKE_ATTEMPTS {
            for addr in &targets {
                match TcpStream::connect_timeout(addr, WAKE_CONNECT_TIMEOUT) {
                    Ok(_) => return true,
                    Err(e) => warn!(%addr, attempt, error = %e, "Failed to wake accept loop"),
                }
            }
        }
        false
    }

    fn finish_stop(&mut self) {
        // The accept loop may have spawned a read loop just before it exited.
        self.shared.join_reader();

        self.shared.emit(ServerEvent::ServerStopped);
        *self.shared.lifecycle.lock() = ServerLifecycle::Stopped;
        self.local_addr = None;
        info!("Relay server stopped");
    }

    pub fn lifecycle(&self) -> ServerLifecycle {
        self.shared.lifecycle()
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.lifecycle() {
            ServerLifecycle::Listening => self.local_addr,
            _ => None,
        }
    }

    pub fn is_client_connected(&self) -> bool {
        self.shared.active.lock().is_some()
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Loopback address that reaches a listener bound to `local`.
fn wake_addr(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(_) if shared.is_stopping() => break,
            Err(e) if is_transient_accept_error(&e) => {
                debug!(error = %e, "Transient accept error");
                continue;
            }
            Err(e) => {
                error!(error = %e, "Accept failed; stopping relay server");
                drop(listener);
                shared.fail_from_accept();
                shared.accept_loop_exited();
                return;
            }
        };

        if shared.is_stopping() {
            trace!(%peer, "Accept loop woken for shutdown");
            break;
        }

        shared.adopt(stream, peer);
    }
    drop(listener);
    shared.accept_loop_exited();
    debug!("Accept loop exited");
}

fn read_loop(shared: Arc<ServerShared>, conn: Arc<Connection>) {
    let conn_id = conn.id();
    let mut buf = vec![0u8; shared.read_buffer_size];

    let reason = loop {
        match conn.read(&mut buf) {
            Ok(0) if conn.is_closed() => break "closed by server".to_string(),
            Ok(0) => break "eof".to_string(),
            Ok(n) => {
                trace!(conn_id, len = n, "Received from client");
                shared.emit(ServerEvent::ClientReceived {
                    conn_id,
                    payload: Bytes::copy_from_slice(&buf[..n]),
                });
            }
            Err(_) if conn.is_closed() => break "closed by server".to_string(),
            Err(e) => break format!("read error: {e}"),
        }
    };

    conn.close();
    shared.release(&conn, reason);
}
