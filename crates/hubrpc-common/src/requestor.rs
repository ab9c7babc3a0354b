//! Request/response correlation.
//!
//! A [`Requestor`] owns the table of requests that are waiting for a
//! response. Each entry is a pending outcome keyed by correlation id that
//! can be observed three ways:
//!
//! - awaited in place ([`Requestor::send`])
//! - held as a future ([`Requestor::send_future`])
//! - handed to a continuation ([`Requestor::send_with_callback`])
//!
//! Responses are matched by id only, so outstanding requests on one
//! connection may complete in any order. Each entry is removed from the
//! table before it is resolved, which makes delivery at-most-once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::error::{Result, RpcError};
use crate::protocol::{CorrelationId, Message};
use crate::sync::lock;
use crate::transport::{ConnectionId, ConnectionRef};

/// Continuation invoked with the response, on the connection's reader task.
pub type ResponseCallback = Box<dyn FnOnce(Result<Message>) + Send + 'static>;

enum Reply {
    Waiter(oneshot::Sender<Result<Message>>),
    Callback(ResponseCallback),
}

impl Reply {
    fn resolve(self, outcome: Result<Message>) {
        match self {
            Reply::Waiter(tx) => {
                // The receiver may have been dropped by a caller that gave up.
                let _ = tx.send(outcome);
            }
            Reply::Callback(callback) => callback(outcome),
        }
    }
}

struct PendingRequest {
    conn: ConnectionId,
    reply: Reply,
}

/// Future resolving to the response of a request sent with
/// [`Requestor::send_future`].
///
/// Resolves to [`RpcError::ConnectionClosed`] if the connection closes
/// first.
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<Message>>,
}

impl Future for PendingResponse {
    type Output = Result<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Correlation table for outbound requests.
#[derive(Default)]
pub struct Requestor {
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
}

impl Requestor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `request` and waits for its response.
    ///
    /// The correlation id must already be set on `request`.
    ///
    /// # Errors
    ///
    /// Fails if the id is already pending, the send fails, or the
    /// connection closes before the response arrives.
    pub async fn send(&self, conn: &ConnectionRef, request: Message) -> Result<Message> {
        self.send_future(conn, request)?.await
    }

    /// Sends `request` and returns a future for its response without
    /// waiting.
    pub fn send_future(&self, conn: &ConnectionRef, request: Message) -> Result<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(conn, request, Reply::Waiter(tx))?;
        Ok(PendingResponse { rx })
    }

    /// Sends `request`; `callback` runs with the response when it arrives.
    ///
    /// If the send itself fails the error is returned and `callback` is
    /// dropped without running.
    pub fn send_with_callback<F>(&self, conn: &ConnectionRef, request: Message, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        self.dispatch(conn, request, Reply::Callback(Box::new(callback)))
    }

    fn dispatch(&self, conn: &ConnectionRef, request: Message, reply: Reply) -> Result<()> {
        let id = request.id().to_string();
        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(&id) {
                return Err(RpcError::DuplicateRequestId(id));
            }
            pending.insert(
                id.clone(),
                PendingRequest {
                    conn: conn.id(),
                    reply,
                },
            );
        }

        if let Err(e) = conn.send(&request) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }
        debug!(conn = conn.id(), id = %id, message_type = ?request.message_type(), "request sent");
        Ok(())
    }

    /// Resolves the pending entry matching `response`.
    ///
    /// Responses with unknown ids are logged and dropped.
    pub fn on_response(&self, conn: &ConnectionRef, response: Message) {
        let entry = lock(&self.pending).remove(response.id());
        match entry {
            Some(entry) => entry.reply.resolve(Ok(response)),
            None => {
                warn!(conn = conn.id(), id = response.id(), "response for unknown request id");
            }
        }
    }

    /// Fails every request still pending on `conn` with
    /// [`RpcError::ConnectionClosed`]. Returns how many were failed.
    pub fn fail_connection(&self, conn: ConnectionId) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, entry)| entry.conn == conn)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = failed.len();
        if count > 0 {
            debug!(conn, count, "failing pending requests on closed connection");
        }
        for entry in failed {
            entry.reply.resolve(Err(RpcError::ConnectionClosed));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}
