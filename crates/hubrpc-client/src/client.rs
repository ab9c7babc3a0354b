//! Composition roots: each client owns a [`Dispatcher`], a [`Requestor`]
//! and the connection(s) they serve.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use hubrpc_common::protocol::error::Result;
use hubrpc_common::sync::lock;
use hubrpc_common::transport::{ConnectionRef, TcpTransport};
use hubrpc_common::{
    Dispatcher, HostDetail, HostInfo, MessageType, Requestor, RpcError, ServiceRequest,
    TopicRequest,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::caller::RpcCaller;
use crate::health_checker::{DiscoveryConfig, HealthChecker};
use crate::load_balancer::LoadBalanceStrategy;
use crate::registry::{Discover, OfflineCallback, Provider};
use crate::topic::{PublishOptions, SubscribeOptions, TopicManager};

/// Dispatcher feeding `response_type` into `requestor`, failing pending
/// requests when a connection closes.
fn response_dispatcher(requestor: &Arc<Requestor>, response_type: MessageType) -> Arc<Dispatcher> {
    let dispatcher = Arc::new(Dispatcher::new());

    let handler_requestor = requestor.clone();
    dispatcher.register_handler(response_type, move |conn, message| {
        handler_requestor.on_response(conn, message);
    });

    let close_requestor = requestor.clone();
    dispatcher.on_close(move |conn| {
        close_requestor.fail_connection(conn.id());
    });

    dispatcher
}

// ============================================================================
// Registry (provider side)
// ============================================================================

/// Connection to a registry from a process that provides methods.
pub struct RegistryClient {
    conn: ConnectionRef,
    provider: Provider,
}

impl RegistryClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let requestor = Arc::new(Requestor::new());
        let dispatcher = response_dispatcher(&requestor, MessageType::RspService);
        // Online/offline pushes are meant for discoverers.
        dispatcher.register_handler(MessageType::ReqService, |conn, message| {
            debug!(conn = conn.id(), id = message.id(), "ignoring service push on provider connection");
        });

        let conn = TcpTransport::connect(addr, dispatcher).await?;
        info!(registry = addr, "connected to registry");
        Ok(Self {
            conn,
            provider: Provider::new(requestor),
        })
    }

    pub async fn register_method(&self, method: &str, host: &HostInfo, load: u32) -> Result<()> {
        self.provider.register_method(&self.conn, method, host, load).await
    }

    pub async fn report_load(&self, method: &str, host: &HostInfo, load: u32) -> Result<()> {
        self.provider.report_load(&self.conn, method, host, load).await
    }

    pub async fn heartbeat(&self, method: &str, host: &HostInfo) -> Result<()> {
        self.provider.heartbeat(&self.conn, method, host).await
    }

    pub fn connection(&self) -> &ConnectionRef {
        &self.conn
    }

    pub fn shutdown(&self) {
        self.conn.shutdown();
    }
}

impl Drop for RegistryClient {
    fn drop(&mut self) {
        self.conn.shutdown();
    }
}

// ============================================================================
// Registry (discovery side)
// ============================================================================

/// Connection to a registry from a process that looks methods up.
///
/// Keeps a per-method host cache current through registry pushes and a
/// periodic [`HealthChecker`] refresh.
pub struct DiscoveryClient {
    conn: ConnectionRef,
    discover: Arc<Discover>,
    checker: JoinHandle<()>,
}

impl DiscoveryClient {
    pub async fn connect(
        addr: &str,
        config: DiscoveryConfig,
        on_offline: Option<OfflineCallback>,
    ) -> Result<Self> {
        let requestor = Arc::new(Requestor::new());
        let discover = Arc::new(Discover::new(requestor.clone(), on_offline));

        let dispatcher = response_dispatcher(&requestor, MessageType::RspService);
        let push_target = discover.clone();
        dispatcher.register_handler(MessageType::ReqService, move |_conn, message| {
            match ServiceRequest::try_from(message) {
                Ok(request) => push_target.on_service_notification(request),
                Err(e) => warn!(error = %e, "malformed service push"),
            }
        });

        let conn = TcpTransport::connect(addr, dispatcher).await?;
        info!(registry = addr, "discovery connected to registry");

        let checker = HealthChecker::new(discover.clone(), conn.clone(), config).spawn();
        Ok(Self {
            conn,
            discover,
            checker,
        })
    }

    pub async fn discover(
        &self,
        method: &str,
        strategy: LoadBalanceStrategy,
        key: &str,
        force_remote: bool,
    ) -> Result<HostDetail> {
        self.discover
            .discover(&self.conn, method, strategy, key, force_remote)
            .await
    }

    pub fn cache(&self) -> &Arc<Discover> {
        &self.discover
    }

    pub fn connection(&self) -> &ConnectionRef {
        &self.conn
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        self.checker.abort();
        self.conn.shutdown();
    }
}

// ============================================================================
// RPC
// ============================================================================

/// RPC client configuration for discovery mode.
#[derive(Debug, Clone, Default)]
pub struct RpcClientConfig {
    pub strategy: LoadBalanceStrategy,
    /// Key for [`LoadBalanceStrategy::SourceHash`].
    pub hash_key: String,
    pub discovery: DiscoveryConfig,
}

type ConnectionPool = Arc<Mutex<HashMap<HostInfo, ConnectionRef>>>;

enum Target {
    Direct(ConnectionRef),
    Discovery(DiscoveryClient),
}

/// RPC client.
///
/// Direct mode calls one server over one connection. Discovery mode picks a
/// provider per call through the registry and keeps one lazily created
/// connection per provider host. A pooled connection is dropped when it
/// closes or when the registry reports its host offline.
///
/// # Example
///
/// ```no_run
/// use hubrpc_client::RpcClient;
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = RpcClient::connect("127.0.0.1:9001").await?;
/// let sum = client.call("add", json!({"num1": 2, "num2": 3})).await?;
/// assert_eq!(sum, json!(5));
/// # Ok(())
/// # }
/// ```
pub struct RpcClient {
    caller: RpcCaller,
    dispatcher: Arc<Dispatcher>,
    target: Target,
    strategy: Mutex<LoadBalanceStrategy>,
    hash_key: String,
    pool: ConnectionPool,
}

impl RpcClient {
    /// Connects straight to an RPC server.
    pub async fn connect(addr: &str) -> Result<Self> {
        let requestor = Arc::new(Requestor::new());
        let dispatcher = response_dispatcher(&requestor, MessageType::RspRpc);
        let conn = TcpTransport::connect(addr, dispatcher.clone()).await?;
        info!(server = addr, "rpc client connected");

        Ok(Self {
            caller: RpcCaller::new(requestor),
            dispatcher,
            target: Target::Direct(conn),
            strategy: Mutex::new(LoadBalanceStrategy::default()),
            hash_key: String::new(),
            pool: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Resolves providers through the registry at `registry_addr`.
    pub async fn with_discovery(registry_addr: &str, config: RpcClientConfig) -> Result<Self> {
        let requestor = Arc::new(Requestor::new());
        let dispatcher = response_dispatcher(&requestor, MessageType::RspRpc);
        let pool: ConnectionPool = Arc::new(Mutex::new(HashMap::new()));

        let close_pool = pool.clone();
        dispatcher.on_close(move |conn| {
            lock(&close_pool).retain(|_, pooled| pooled.id() != conn.id());
        });

        let offline_pool = pool.clone();
        let on_offline: OfflineCallback = Arc::new(move |method, host| {
            if let Some(conn) = lock(&offline_pool).remove(host) {
                info!(method, %host, "evicting connection to offline provider");
                conn.shutdown();
            }
        });

        let discovery =
            DiscoveryClient::connect(registry_addr, config.discovery, Some(on_offline)).await?;

        Ok(Self {
            caller: RpcCaller::new(requestor),
            dispatcher,
            target: Target::Discovery(discovery),
            strategy: Mutex::new(config.strategy),
            hash_key: config.hash_key,
            pool,
        })
    }

    pub fn set_load_balance_strategy(&self, strategy: LoadBalanceStrategy) {
        *lock(&self.strategy) = strategy;
    }

    pub fn load_balance_strategy(&self) -> LoadBalanceStrategy {
        *lock(&self.strategy)
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let conn = self.connection_for(method).await?;
        self.caller.call(&conn, method, params).await
    }

    /// Sends the call and returns a future for its result.
    pub async fn call_future(
        &self,
        method: &str,
        params: Value,
    ) -> Result<impl Future<Output = Result<Value>> + Send + 'static> {
        let conn = self.connection_for(method).await?;
        self.caller.call_future(&conn, method, params)
    }

    /// Sends the call; `callback` runs on the connection's reader task.
    pub async fn call_with_callback<F>(&self, method: &str, params: Value, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let conn = self.connection_for(method).await?;
        self.caller.call_with_callback(&conn, method, params, callback)
    }

    /// Number of pooled provider connections.
    pub fn pooled_connections(&self) -> usize {
        lock(&self.pool).len()
    }

    async fn connection_for(&self, method: &str) -> Result<ConnectionRef> {
        let discovery = match &self.target {
            Target::Direct(conn) => return Ok(conn.clone()),
            Target::Discovery(discovery) => discovery,
        };

        let strategy = self.load_balance_strategy();
        let selected = discovery
            .discover(method, strategy, &self.hash_key, false)
            .await?;
        self.pooled_connection(&selected.host).await
    }

    async fn pooled_connection(&self, host: &HostInfo) -> Result<ConnectionRef> {
        if let Some(conn) = lock(&self.pool).get(host) {
            if conn.connected() {
                return Ok(conn.clone());
            }
        }

        let conn = TcpTransport::connect(&host.to_addr_string(), self.dispatcher.clone()).await?;
        if !conn.connected() {
            return Err(RpcError::ConnectionClosed);
        }

        let mut pool = lock(&self.pool);
        if let Some(existing) = pool.get(host) {
            if existing.connected() {
                // Lost a connect race; keep the pooled one.
                let existing = existing.clone();
                drop(pool);
                conn.shutdown();
                return Ok(existing);
            }
        }
        debug!(%host, conn = conn.id(), "pooled provider connection");
        pool.insert(host.clone(), conn.clone());
        Ok(conn)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Target::Direct(conn) = &self.target {
            conn.shutdown();
        }
        for (_, conn) in lock(&self.pool).drain() {
            conn.shutdown();
        }
    }
}

// ============================================================================
// Topics
// ============================================================================

/// Connection to a topic server.
pub struct TopicClient {
    conn: ConnectionRef,
    manager: Arc<TopicManager>,
}

impl TopicClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let requestor = Arc::new(Requestor::new());
        let manager = Arc::new(TopicManager::new(requestor.clone()));

        let dispatcher = response_dispatcher(&requestor, MessageType::RspTopic);
        let push_target = manager.clone();
        dispatcher.register_handler(MessageType::ReqTopic, move |_conn, message| {
            match TopicRequest::try_from(message) {
                Ok(request) => push_target.on_publish(request),
                Err(e) => warn!(error = %e, "malformed topic push"),
            }
        });

        let conn = TcpTransport::connect(addr, dispatcher).await?;
        info!(server = addr, "topic client connected");
        Ok(Self { conn, manager })
    }

    pub async fn create(&self, topic: &str) -> Result<()> {
        self.manager.create(&self.conn, topic).await
    }

    pub async fn remove(&self, topic: &str) -> Result<()> {
        self.manager.remove(&self.conn, topic).await
    }

    pub async fn subscribe<F>(&self, topic: &str, options: SubscribeOptions, callback: F) -> Result<()>
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.manager.subscribe(&self.conn, topic, options, callback).await
    }

    pub async fn cancel(&self, topic: &str) -> Result<()> {
        self.manager.cancel(&self.conn, topic).await
    }

    pub async fn publish(&self, topic: &str, message: &str, options: PublishOptions) -> Result<()> {
        self.manager.publish(&self.conn, topic, message, options).await
    }

    pub fn connection(&self) -> &ConnectionRef {
        &self.conn
    }

    pub fn shutdown(&self) {
        self.conn.shutdown();
    }
}

impl Drop for TopicClient {
    fn drop(&mut self) {
        self.conn.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubrpc_common::transport::TcpServer;
    use hubrpc_common::{RespCode, RpcRequest, RpcResponse};
    use serde_json::json;
    use std::time::Duration;

    /// Serves `add` over TCP; returns its address.
    async fn spawn_add_server() -> String {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register_handler(MessageType::ReqRpc, |conn, message| {
            let request = RpcRequest::try_from(message).unwrap();
            let response = if request.method == "add" {
                let sum = request.params["num1"].as_i64().unwrap() + request.params["num2"].as_i64().unwrap();
                RpcResponse::success(request.id, json!(sum))
            } else {
                RpcResponse::error(request.id, RespCode::ServiceNotFound)
            };
            conn.send(&response.into()).unwrap();
        });

        tokio::spawn(async move {
            let _ = server.run(dispatcher).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_direct_call() {
        let addr = spawn_add_server().await;
        let client = RpcClient::connect(&addr).await.unwrap();

        let sum = client.call("add", json!({"num1": 2, "num2": 3})).await.unwrap();
        assert_eq!(sum, json!(5));

        let err = client.call("mul", json!({})).await.unwrap_err();
        assert_eq!(err.resp_code(), Some(RespCode::ServiceNotFound));
    }

    #[tokio::test]
    async fn test_direct_call_shapes() {
        let addr = spawn_add_server().await;
        let client = RpcClient::connect(&addr).await.unwrap();

        let future = client.call_future("add", json!({"num1": 1, "num2": 1})).await.unwrap();
        assert_eq!(future.await.unwrap(), json!(2));

        let (tx, rx) = tokio::sync::oneshot::channel();
        client
            .call_with_callback("add", json!({"num1": 4, "num2": 4}), move |result| {
                let _ = tx.send(result);
            })
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), json!(8));
    }

    #[tokio::test]
    async fn test_pending_call_fails_when_server_closes() {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        // Closes every connection on its first request without answering.
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register_handler(MessageType::ReqRpc, |conn, _| conn.shutdown());
        tokio::spawn(async move {
            let _ = server.run(dispatcher).await;
        });

        let client = RpcClient::connect(&addr).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), client.call("add", json!({})))
            .await
            .unwrap();
        assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(RpcClient::connect(&addr).await.is_err());
        assert!(TopicClient::connect(&addr).await.is_err());
    }

    #[tokio::test]
    async fn test_strategy_can_change() {
        let addr = spawn_add_server().await;
        let client = RpcClient::connect(&addr).await.unwrap();
        assert_eq!(client.load_balance_strategy(), LoadBalanceStrategy::RoundRobin);

        client.set_load_balance_strategy(LoadBalanceStrategy::LowestLoad);
        assert_eq!(client.load_balance_strategy(), LoadBalanceStrategy::LowestLoad);
    }

    #[tokio::test]
    async fn test_dropping_registry_client_closes_connection() {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let (closed_tx, mut closed_rx) = tokio::sync::mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.on_close(move |_conn| {
            let _ = closed_tx.send(());
        });
        tokio::spawn(async move {
            let _ = server.run(dispatcher).await;
        });

        let client = RegistryClient::connect(&addr).await.unwrap();
        let conn = client.connection().clone();
        assert!(conn.connected());

        drop(client);
        assert!(!conn.connected());
        tokio::time::timeout(Duration::from_secs(5), closed_rx.recv())
            .await
            .unwrap()
            .unwrap();
    }
}
