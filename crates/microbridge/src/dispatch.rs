//! Ordered delivery of server events to the single consumer.
//!
//! Producers are the relay server's accept and read threads. They push into an
//! unbounded FIFO and never block. The consumer side runs either on a dedicated
//! dispatcher thread or on whatever thread the embedding application uses to
//! pump [`EventBridge::dispatch_pending`].

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select, unbounded};
use tracing::{debug, trace};

use crate::config::DispatchMode;
use crate::net::{EventTx, ServerEvent};

/// Consumer side of the bridge. Only ever called from one context at a time.
pub(crate) trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: ServerEvent);
}

/// Payload filter applied before data reaches the listener.
#[inline]
pub(crate) fn is_deliverable(payload: &[u8], min_payload_len: usize) -> bool {
    payload.len() >= min_payload_len
}

enum Consumer {
    Thread {
        stop_tx: Option<Sender<()>>,
        join: Option<JoinHandle<()>>,
    },
    Manual {
        rx: Receiver<ServerEvent>,
        handler: Arc<dyn EventHandler>,
    },
}

pub(crate) struct EventBridge {
    tx: EventTx,
    consumer: Consumer,
}

impl EventBridge {
    pub(crate) fn new(mode: DispatchMode, handler: Arc<dyn EventHandler>) -> io::Result<Self> {
        let (tx, rx) = unbounded::<ServerEvent>();

        let consumer = match mode {
            DispatchMode::Manual => Consumer::Manual { rx, handler },
            DispatchMode::Thread => {
                let (stop_tx, stop_rx) = unbounded::<()>();
                let join = thread::Builder::new()
                    .name("microbridge-dispatch".to_string())
                    .spawn(move || dispatch_loop(rx, stop_rx, handler))?;
                Consumer::Thread {
                    stop_tx: Some(stop_tx),
                    join: Some(join),
                }
            }
        };

        Ok(Self { tx, consumer })
    }

    /// Producer handle for a relay server.
    pub(crate) fn sender(&self) -> EventTx {
        self.tx.clone()
    }

    /// Deliver every queued event on the calling thread. Returns how many were delivered.
    ///
    /// Always 0 in [`DispatchMode::Thread`], where the dispatcher thread owns delivery.
    pub(crate) fn dispatch_pending(&self) -> usize {
        match &self.consumer {
            Consumer::Manual { rx, handler } => {
                let mut delivered = 0;
                for event in rx.try_iter() {
                    handler.handle(event);
                    delivered += 1;
                }
                delivered
            }
            Consumer::Thread { .. } => 0,
        }
    }

    /// Wait up to `timeout` for one event and deliver it on the calling thread.
    pub(crate) fn dispatch_timeout(&self, timeout: Duration) -> bool {
        match &self.consumer {
            Consumer::Manual { rx, handler } => match rx.recv_timeout(timeout) {
                Ok(event) => {
                    handler.handle(event);
                    true
                }
                Err(_) => false,
            },
            Consumer::Thread { .. } => false,
        }
    }

    /// Flush what is queued and stop the dispatcher thread.
    ///
    /// In [`DispatchMode::Manual`] nothing is delivered here; events nobody pumped are dropped.
    pub(crate) fn shutdown(&mut self) {
        match &mut self.consumer {
            Consumer::Thread { stop_tx, join } => {
                drop(stop_tx.take());
                if let Some(join) = join.take() {
                    if join.thread().id() == thread::current().id() {
                        // Dropped from inside a listener callback; the loop exits on its own.
                        debug!("Event bridge shut down from dispatcher thread");
                        return;
                    }
                    let _ = join.join();
                }
            }
            Consumer::Manual { rx, .. } => {
                let dropped = rx.try_iter().count();
                trace!(dropped, "Manual event bridge shut down");
            }
        }
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(rx: Receiver<ServerEvent>, stop_rx: Receiver<()>, handler: Arc<dyn EventHandler>) {
    loop {
        select! {
            recv(rx) -> event => match event {
                Ok(event) => handler.handle(event),
                Err(_) => break,
            },
            recv(stop_rx) -> _ => {
                // Whatever the server queued before it stopped still gets delivered.
                for event in rx.try_iter() {
                    handler.handle(event);
                }
                break;
            }
        }
    }
    debug!("Dispatch loop exited");
}
