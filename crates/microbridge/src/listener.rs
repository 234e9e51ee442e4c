use std::net::SocketAddr;

/// Consumer of bridge events.
///
/// Callbacks run on the dispatch context chosen through
/// [`DispatchMode`](crate::DispatchMode) and are never invoked concurrently.
pub trait AdbListener: Send + 'static {
    /// A peer connected to the relay port.
    ///
    /// This fires when the peripheral connects, not when the server starts
    /// listening, so it always pairs with [`AdbListener::adb_disconnected`].
    /// Use [`AdbListener::server_started`] to observe the listening socket.
    fn adb_connected(&mut self);

    /// The peer went away, or the server closed it.
    fn adb_disconnected(&mut self);

    /// One chunk of peer bytes, exactly as read from the socket.
    fn adb_event(&mut self, data: &[u8]);

    fn server_started(&mut self, _local_addr: SocketAddr) {}

    fn server_stopped(&mut self) {}
}

/// Listener that ignores everything; for write-only embeddings.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl AdbListener for NoopListener {
    fn adb_connected(&mut self) {}

    fn adb_disconnected(&mut self) {}

    fn adb_event(&mut self, _data: &[u8]) {}
}
