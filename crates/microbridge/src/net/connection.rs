use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use super::event::{ConnId, next_conn_id};

/// One accepted peer socket.
///
/// Reads go through `&TcpStream` without locking, so the read loop can sit in a
/// blocking read while the send path writes. Writes are serialized by
/// `write_lock` so two senders never interleave their bytes.
pub struct Connection {
    id: ConnId,
    peer: SocketAddr,
    stream: TcpStream,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            id: next_conn_id(),
            peer,
            stream,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Blocks until at least one byte is available, the peer closes (`Ok(0)`),
    /// or the socket fails.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match (&self.stream).read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                res => return res,
            }
        }
    }

    /// Writes the whole buffer and flushes it.
    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        }
        let _guard = self.write_lock.lock();
        let mut stream = &self.stream;
        stream.write_all(bytes)?;
        stream.flush()
    }

    /// Shuts the socket down in both directions, which also wakes a thread
    /// blocked in [`Connection::read`]. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            // Already torn down by the peer; nothing left to release.
            trace!(conn_id = self.id, error = %e, "shutdown after peer close");
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
