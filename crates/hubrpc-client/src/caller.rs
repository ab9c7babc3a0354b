use std::future::Future;
use std::sync::Arc;

use hubrpc_common::protocol::error::Result;
use hubrpc_common::transport::ConnectionRef;
use hubrpc_common::{Message, Requestor, RpcError, RpcRequest, RpcResponse};
use serde_json::Value;
use tracing::warn;

/// RPC call layer over a [`Requestor`].
///
/// Builds an [`RpcRequest`] for each call and unwraps the [`RpcResponse`]:
/// a response of the wrong variant, or with a non-success code, becomes an
/// error. The three call shapes mirror the requestor's three send shapes.
#[derive(Clone)]
pub struct RpcCaller {
    requestor: Arc<Requestor>,
}

impl RpcCaller {
    pub fn new(requestor: Arc<Requestor>) -> Self {
        Self { requestor }
    }

    /// Calls `method` and waits for its result.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Remote`] if the provider answered with a failure code
    /// - [`RpcError::UnexpectedMessage`] if the reply was not an RPC response
    /// - transport errors from sending, or [`RpcError::ConnectionClosed`]
    pub async fn call(&self, conn: &ConnectionRef, method: &str, params: Value) -> Result<Value> {
        let request = RpcRequest::new(method, params);
        let response = self.requestor.send(conn, request.into()).await?;
        unwrap_rpc_response(method, response)
    }

    /// Sends the call now and returns a future for its result.
    pub fn call_future(
        &self,
        conn: &ConnectionRef,
        method: &str,
        params: Value,
    ) -> Result<impl Future<Output = Result<Value>> + Send + 'static> {
        let request = RpcRequest::new(method, params);
        let pending = self.requestor.send_future(conn, request.into())?;
        let method = method.to_string();
        Ok(async move { unwrap_rpc_response(&method, pending.await?) })
    }

    /// Sends the call; `callback` receives the unwrapped result.
    pub fn call_with_callback<F>(
        &self,
        conn: &ConnectionRef,
        method: &str,
        params: Value,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let request = RpcRequest::new(method, params);
        let method = method.to_string();
        self.requestor
            .send_with_callback(conn, request.into(), move |outcome| {
                callback(outcome.and_then(|response| unwrap_rpc_response(&method, response)));
            })
    }
}

fn unwrap_rpc_response(method: &str, message: Message) -> Result<Value> {
    let response = RpcResponse::try_from(message)?;
    if !response.rcode.is_success() {
        warn!(method, reason = response.rcode.reason(), "rpc call failed");
        return Err(RpcError::Remote(response.rcode));
    }
    Ok(response.result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubrpc_common::transport::MemoryConnection;
    use hubrpc_common::{RespCode, TopicResponse};
    use serde_json::json;
    use std::sync::Mutex;

    fn setup() -> (RpcCaller, Arc<Requestor>, Arc<MemoryConnection>, ConnectionRef) {
        let requestor = Arc::new(Requestor::new());
        let memory = Arc::new(MemoryConnection::new());
        let conn: ConnectionRef = memory.clone();
        (RpcCaller::new(requestor.clone()), requestor, memory, conn)
    }

    fn sent_request(memory: &MemoryConnection) -> RpcRequest {
        let mut sent = memory.take_sent();
        assert_eq!(sent.len(), 1);
        RpcRequest::try_from(sent.remove(0)).unwrap()
    }

    #[tokio::test]
    async fn test_call_future_success() {
        let (caller, requestor, memory, conn) = setup();

        let future = caller.call_future(&conn, "add", json!({"num1": 2, "num2": 3})).unwrap();
        let request = sent_request(&memory);
        assert_eq!(request.method, "add");

        requestor.on_response(&conn, RpcResponse::success(request.id, json!(5)).into());
        assert_eq!(future.await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_call_reports_remote_code() {
        let (caller, requestor, memory, conn) = setup();

        let future = caller.call_future(&conn, "missing", json!({})).unwrap();
        let request = sent_request(&memory);
        requestor.on_response(&conn, RpcResponse::error(request.id, RespCode::ServiceNotFound).into());

        let err = future.await.unwrap_err();
        assert_eq!(err.resp_code(), Some(RespCode::ServiceNotFound));
    }

    #[tokio::test]
    async fn test_call_rejects_wrong_variant() {
        let (caller, requestor, memory, conn) = setup();

        let future = caller.call_future(&conn, "m", json!({})).unwrap();
        let request = sent_request(&memory);
        requestor.on_response(&conn, TopicResponse::new(request.id, RespCode::Success).into());

        assert!(matches!(
            future.await,
            Err(RpcError::UnexpectedMessage { .. })
        ));
    }

    #[test]
    fn test_call_with_callback() {
        let (caller, requestor, memory, conn) = setup();
        let result = Arc::new(Mutex::new(None));

        let slot = result.clone();
        caller
            .call_with_callback(&conn, "add", json!({"num1": 1, "num2": 1}), move |outcome| {
                *slot.lock().unwrap() = Some(outcome.unwrap());
            })
            .unwrap();

        let request = sent_request(&memory);
        requestor.on_response(&conn, RpcResponse::success(request.id, json!(2)).into());
        assert_eq!(*result.lock().unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_call_waits_for_response() {
        let (caller, requestor, memory, conn) = setup();

        let responder = {
            let requestor = requestor.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                loop {
                    let sent = memory.take_sent();
                    if let Some(message) = sent.into_iter().next() {
                        let request = RpcRequest::try_from(message).unwrap();
                        requestor.on_response(&conn, RpcResponse::success(request.id, json!("pong")).into());
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        assert_eq!(caller.call(&conn, "ping", json!({})).await.unwrap(), json!("pong"));
        responder.await.unwrap();
    }
}
