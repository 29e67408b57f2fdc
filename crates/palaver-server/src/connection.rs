//! Connection handles.
//!
//! A [`ConnectionHandle`] is the write side of one client connection as seen
//! by the rest of the server: a bounded outbound queue plus a close signal.
//! The socket itself lives in `net`; the registry, router, and dispatcher
//! only ever touch the handle, which keeps them testable without sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use palaver_shared::Envelope;

/// Cheap-to-clone handle for enqueueing envelopes to one client.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    outbound: mpsc::Sender<Envelope>,
    closed: Arc<AtomicBool>,
    close_tx: Arc<watch::Sender<bool>>,
}

/// The consuming side, owned by the connection's writer task.
#[derive(Debug)]
pub struct ConnectionBackend {
    pub outbound_rx: mpsc::Receiver<Envelope>,
    pub close_rx: watch::Receiver<bool>,
}

impl ConnectionHandle {
    /// Create a handle with a bounded outbound queue of `capacity` envelopes.
    pub fn new(capacity: usize) -> (Self, ConnectionBackend) {
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = watch::channel(false);

        let handle = Self {
            id: Uuid::new_v4(),
            outbound,
            closed: Arc::new(AtomicBool::new(false)),
            close_tx: Arc::new(close_tx),
        };
        (handle, ConnectionBackend { outbound_rx, close_rx })
    }

    /// Non-blocking enqueue onto this connection's outbound path.
    ///
    /// Returns `false` if the envelope was dropped: the connection is closed,
    /// or the queue is full (a slow reader loses pushes instead of stalling
    /// the sender's task).
    pub fn enqueue(&self, envelope: Envelope) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.outbound.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(conn = %self.id, "outbound queue full, dropping envelope");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Signal the connection to shut down. Envelopes already queued are
    /// still flushed by the writer task before the socket closes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.close_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
