use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::protocol::error::Result;
use crate::protocol::Message;

/// Process-unique identity of a connection.
pub type ConnectionId = u64;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh [`ConnectionId`].
pub fn next_connection_id() -> ConnectionId {
    CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A bidirectional message channel to one peer.
///
/// Implementations must make [`send`](Connection::send) non-blocking: it
/// queues an encoded frame and returns. Managers hold connections as
/// [`ConnectionRef`] and key their indices by [`id`](Connection::id).
pub trait Connection: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnectionId;

    /// Encodes and queues `message` for delivery.
    ///
    /// # Errors
    ///
    /// Fails if the message cannot be encoded or the connection is closed.
    fn send(&self, message: &Message) -> Result<()>;

    /// Closes the connection. Idempotent.
    fn shutdown(&self);

    fn connected(&self) -> bool;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

pub type ConnectionRef = Arc<dyn Connection>;

/// Callbacks a transport invokes over a connection's lifetime.
///
/// All three run on the connection's reader task, so calls for a single
/// connection never overlap.
pub trait ConnectionEvents: Send + Sync + 'static {
    fn on_connected(&self, conn: &ConnectionRef) {
        debug!(conn = conn.id(), peer = ?conn.peer_addr(), "connection established");
    }

    fn on_message(&self, conn: &ConnectionRef, message: Message);

    fn on_closed(&self, conn: &ConnectionRef) {
        debug!(conn = conn.id(), "connection closed");
    }
}
