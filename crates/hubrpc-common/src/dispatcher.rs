use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, error, warn};

use crate::protocol::{Message, MessageType, RespCode};
use crate::sync::{read, write};
use crate::transport::{ConnectionEvents, ConnectionRef};

/// Handler for one message type.
pub type MessageHandler = Arc<dyn Fn(&ConnectionRef, Message) + Send + Sync>;

/// Hook run when a connection closes.
pub type CloseHook = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;

/// Routes inbound messages to per-type handlers.
///
/// Each client or server role owns one dispatcher and hands it to its
/// transport as the [`ConnectionEvents`] sink. Messages are validated
/// before routing:
/// - an invalid request is answered with [`RespCode::InvalidMsg`]
/// - an invalid response, or a message type with no handler, shuts the
///   connection down
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use hubrpc_common::dispatcher::Dispatcher;
/// use hubrpc_common::protocol::{Message, MessageType, RpcRequest};
/// use hubrpc_common::transport::{Connection, ConnectionRef, MemoryConnection};
/// use serde_json::json;
///
/// let dispatcher = Dispatcher::new();
/// dispatcher.register_handler(MessageType::ReqRpc, |_conn, message| {
///     assert_eq!(message.message_type(), MessageType::ReqRpc);
/// });
///
/// let conn: ConnectionRef = Arc::new(MemoryConnection::new());
/// dispatcher.dispatch(&conn, RpcRequest::new("m", json!({})).into());
/// assert!(conn.connected());
/// ```
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<MessageType, MessageHandler>>,
    close_hooks: RwLock<Vec<CloseHook>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `message_type`, replacing any previous one.
    pub fn register_handler<F>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(&ConnectionRef, Message) + Send + Sync + 'static,
    {
        if write(&self.handlers)
            .insert(message_type, Arc::new(handler))
            .is_some()
        {
            debug!(?message_type, "replaced message handler");
        }
    }

    /// Adds a hook run after any connection served by this dispatcher closes.
    pub fn on_close<F>(&self, hook: F)
    where
        F: Fn(&ConnectionRef) + Send + Sync + 'static,
    {
        write(&self.close_hooks).push(Arc::new(hook));
    }

    pub fn has_handler(&self, message_type: MessageType) -> bool {
        read(&self.handlers).contains_key(&message_type)
    }

    /// Validates `message` and hands it to its handler.
    pub fn dispatch(&self, conn: &ConnectionRef, message: Message) {
        let message_type = message.message_type();

        if let Err(e) = message.validate() {
            warn!(conn = conn.id(), id = message.id(), ?message_type, error = %e, "invalid message");
            match message.error_response(RespCode::InvalidMsg) {
                Some(response) => {
                    if let Err(e) = conn.send(&response) {
                        warn!(conn = conn.id(), error = %e, "failed to reject invalid message");
                    }
                }
                None => conn.shutdown(),
            }
            return;
        }

        let handler = read(&self.handlers).get(&message_type).cloned();
        match handler {
            Some(handler) => handler(conn, message),
            None => {
                error!(conn = conn.id(), ?message_type, "no handler for message type");
                conn.shutdown();
            }
        }
    }
}

impl ConnectionEvents for Dispatcher {
    fn on_message(&self, conn: &ConnectionRef, message: Message) {
        self.dispatch(conn, message);
    }

    fn on_closed(&self, conn: &ConnectionRef) {
        debug!(conn = conn.id(), "connection closed");
        let hooks: Vec<CloseHook> = read(&self.close_hooks).clone();
        for hook in hooks {
            hook(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RpcRequest, RpcResponse, ServiceOpType, ServiceRequest, ServiceResponse};
    use crate::transport::{Connection, MemoryConnection};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn memory_conn() -> (Arc<MemoryConnection>, ConnectionRef) {
        let conn = Arc::new(MemoryConnection::new());
        let conn_ref: ConnectionRef = conn.clone();
        (conn, conn_ref)
    }

    #[test]
    fn test_routes_by_type() {
        let dispatcher = Dispatcher::new();
        let rpc_hits = Arc::new(AtomicUsize::new(0));
        let service_hits = Arc::new(AtomicUsize::new(0));

        let hits = rpc_hits.clone();
        dispatcher.register_handler(MessageType::ReqRpc, move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        let hits = service_hits.clone();
        dispatcher.register_handler(MessageType::RspService, move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        let (_, conn) = memory_conn();
        dispatcher.dispatch(&conn, RpcRequest::new("m", json!({})).into());
        dispatcher.dispatch(&conn, RpcRequest::new("m", json!({})).into());
        dispatcher.dispatch(
            &conn,
            ServiceResponse::new("x", RespCode::Success, ServiceOpType::Register).into(),
        );

        assert_eq!(rpc_hits.load(Ordering::SeqCst), 2);
        assert_eq!(service_hits.load(Ordering::SeqCst), 1);
        assert!(conn.connected());
    }

    #[test]
    fn test_later_registration_overwrites() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.register_handler(MessageType::RspRpc, |_, _| panic!("replaced handler ran"));
        let counter = hits.clone();
        dispatcher.register_handler(MessageType::RspRpc, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (_, conn) = memory_conn();
        dispatcher.dispatch(&conn, RpcResponse::success("x", json!(1)).into());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_handler_shuts_down() {
        let dispatcher = Dispatcher::new();
        let (_, conn) = memory_conn();
        dispatcher.dispatch(&conn, RpcResponse::success("x", json!(1)).into());
        assert!(!conn.connected());
    }

    #[test]
    fn test_invalid_request_rejected_with_same_id() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_handler(MessageType::ReqService, |_, _| panic!("invalid message routed"));

        let (memory, conn) = memory_conn();
        let request = ServiceRequest::new("add", ServiceOpType::Register, None);
        let id = request.id.clone();
        dispatcher.dispatch(&conn, request.into());

        let sent = memory.take_sent();
        assert_eq!(sent.len(), 1);
        let response = ServiceResponse::try_from(sent[0].clone()).unwrap();
        assert_eq!(response.id, id);
        assert_eq!(response.rcode, RespCode::InvalidMsg);
        assert_eq!(response.optype, ServiceOpType::Unknown);
        assert!(conn.connected());
    }

    #[test]
    fn test_invalid_response_shuts_down() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_handler(MessageType::RspService, |_, _| panic!("invalid message routed"));

        let (memory, conn) = memory_conn();
        let response = ServiceResponse::new("x", RespCode::Success, ServiceOpType::Discover);
        dispatcher.dispatch(&conn, response.into());

        assert!(!conn.connected());
        assert_eq!(memory.sent_count(), 0);
    }

    #[test]
    fn test_close_hooks_run_in_order() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            dispatcher.on_close(move |_| order.lock().unwrap().push(i));
        }

        let (_, conn) = memory_conn();
        dispatcher.on_closed(&conn);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
