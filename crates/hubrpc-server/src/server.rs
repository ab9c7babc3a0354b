//! Composition roots: each server binds a [`TcpServer`] and wires a
//! [`Dispatcher`] to its engine.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use hubrpc_client::RegistryClient;
use hubrpc_common::protocol::error::Result;
use hubrpc_common::sync::{lock, read, write};
use hubrpc_common::transport::{ConnectionRef, TcpServer};
use hubrpc_common::{
    ClockRef, Dispatcher, HeartbeatConfig, HostInfo, Message, MessageType, RpcError, RpcRequest,
    ServiceRequest, SystemClock, TopicRequest,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::RegistryService;
use crate::router::{RpcRouter, ServiceDescribe};
use crate::topic::TopicManager;

/// Routes `message_type` to `handler` after converting the message to its
/// variant.
fn route<T, F>(dispatcher: &Dispatcher, message_type: MessageType, handler: F)
where
    T: TryFrom<Message, Error = RpcError> + 'static,
    F: Fn(&ConnectionRef, T) + Send + Sync + 'static,
{
    dispatcher.register_handler(message_type, move |conn, message| match T::try_from(message) {
        Ok(request) => handler(conn, request),
        Err(e) => {
            warn!(conn = conn.id(), error = %e, "message does not match its type tag");
            conn.shutdown();
        }
    });
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Clone)]
pub struct RegistryServerConfig {
    pub bind_addr: String,
    pub heartbeat: HeartbeatConfig,
}

impl Default for RegistryServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Service registry server.
///
/// Sweeps providers whose heartbeat is older than the idle timeout every
/// check interval, from the moment it is bound.
pub struct RegistryServer {
    server: TcpServer,
    service: Arc<RegistryService>,
    dispatcher: Arc<Dispatcher>,
    sweeper: JoinHandle<()>,
}

impl RegistryServer {
    pub async fn bind(config: RegistryServerConfig) -> Result<Self> {
        Self::bind_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Binds with heartbeat ages measured by `clock`.
    pub async fn bind_with_clock(config: RegistryServerConfig, clock: ClockRef) -> Result<Self> {
        let server = TcpServer::new(&config.bind_addr).await?;
        let service = Arc::new(RegistryService::new(clock));

        let dispatcher = Arc::new(Dispatcher::new());
        let handler_service = service.clone();
        route(&dispatcher, MessageType::ReqService, move |conn, request: ServiceRequest| {
            handler_service.on_service_request(conn, request);
        });
        let close_service = service.clone();
        dispatcher.on_close(move |conn| close_service.on_connection_closed(conn));

        let sweeper = spawn_sweeper(service.clone(), config.heartbeat);
        info!(addr = ?server.local_addr().ok(), "registry server bound");

        Ok(Self {
            server,
            service,
            dispatcher,
            sweeper,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn service(&self) -> &Arc<RegistryService> {
        &self.service
    }

    /// Serves connections until the listener fails.
    pub async fn run(&self) -> Result<()> {
        self.server.run(self.dispatcher.clone()).await
    }
}

impl Drop for RegistryServer {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

fn spawn_sweeper(service: Arc<RegistryService>, config: HeartbeatConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.check_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            let evicted = service.sweep_and_notify(config.idle_timeout);
            if evicted > 0 {
                info!(evicted, "heartbeat sweep evicted providers");
            }
        }
    })
}

// ============================================================================
// Topics
// ============================================================================

#[derive(Debug, Clone)]
pub struct TopicServerConfig {
    pub bind_addr: String,
}

impl Default for TopicServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Topic publish/subscribe server.
pub struct TopicServer {
    server: TcpServer,
    manager: Arc<TopicManager>,
    dispatcher: Arc<Dispatcher>,
}

impl TopicServer {
    pub async fn bind(config: TopicServerConfig) -> Result<Self> {
        let server = TcpServer::new(&config.bind_addr).await?;
        let manager = Arc::new(TopicManager::new());

        let dispatcher = Arc::new(Dispatcher::new());
        let handler_manager = manager.clone();
        route(&dispatcher, MessageType::ReqTopic, move |conn, request: TopicRequest| {
            handler_manager.on_topic_request(conn, request);
        });
        let close_manager = manager.clone();
        dispatcher.on_close(move |conn| close_manager.on_connection_closed(conn));

        info!(addr = ?server.local_addr().ok(), "topic server bound");
        Ok(Self {
            server,
            manager,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn manager(&self) -> &Arc<TopicManager> {
        &self.manager
    }

    pub async fn run(&self) -> Result<()> {
        self.server.run(self.dispatcher.clone()).await
    }
}

// ============================================================================
// RPC
// ============================================================================

/// Supplies the load a provider reports to the registry.
pub type LoadSource = Arc<dyn Fn() -> u32 + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    pub bind_addr: String,
    /// Address announced to the registry; defaults to the bound address.
    pub access_addr: Option<HostInfo>,
    /// Registry to register methods with, if any.
    pub registry_addr: Option<String>,
    /// Load announced with each registration.
    pub initial_load: u32,
    pub heartbeat: HeartbeatConfig,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9001".to_string(),
            access_addr: None,
            registry_addr: None,
            initial_load: 10,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

struct Reporting {
    registry: Arc<RegistryClient>,
    host: HostInfo,
    methods: Arc<RwLock<Vec<String>>>,
}

/// RPC server, optionally registered as a provider.
///
/// With a registry configured, every method is registered under the access
/// address. After the first registration the server reports its load every
/// load-report interval and heartbeats every heartbeat interval, for every
/// registered method. Unless a [`LoadSource`] is installed, the reported
/// load is the number of requests served since the previous report.
///
/// # Example
///
/// ```no_run
/// use hubrpc_server::router::{ServiceDescribe, ValueType};
/// use hubrpc_server::server::{RpcServer, RpcServerConfig};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let server = RpcServer::bind(RpcServerConfig {
///     registry_addr: Some("127.0.0.1:8080".to_string()),
///     ..Default::default()
/// })
/// .await?;
///
/// let echo = ServiceDescribe::builder("echo")
///     .param("text", ValueType::String)
///     .returns(ValueType::String)
///     .handler(|params| Ok(params["text"].clone()))
///     .build()?;
/// server.register_method(echo).await?;
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct RpcServer {
    server: TcpServer,
    router: Arc<RpcRouter>,
    dispatcher: Arc<Dispatcher>,
    config: RpcServerConfig,
    reporting: Option<Reporting>,
    load_source: Arc<RwLock<Option<LoadSource>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcServer {
    pub async fn bind(config: RpcServerConfig) -> Result<Self> {
        let server = TcpServer::new(&config.bind_addr).await?;
        let router = Arc::new(RpcRouter::new());

        let dispatcher = Arc::new(Dispatcher::new());
        let handler_router = router.clone();
        route(&dispatcher, MessageType::ReqRpc, move |conn, request: RpcRequest| {
            handler_router.on_rpc_request(conn, request);
        });

        let reporting = match &config.registry_addr {
            Some(addr) => {
                let host = match &config.access_addr {
                    Some(host) => host.clone(),
                    None => HostInfo::from(server.local_addr()?),
                };
                Some(Reporting {
                    registry: Arc::new(RegistryClient::connect(addr).await?),
                    host,
                    methods: Arc::new(RwLock::new(Vec::new())),
                })
            }
            None => None,
        };

        info!(addr = ?server.local_addr().ok(), registry = ?config.registry_addr, "rpc server bound");
        Ok(Self {
            server,
            router,
            dispatcher,
            config,
            reporting,
            load_source: Arc::new(RwLock::new(None)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn router(&self) -> &Arc<RpcRouter> {
        &self.router
    }

    /// Replaces the served-request count as the reported load.
    pub fn set_load_source<F>(&self, source: F)
    where
        F: Fn() -> u32 + Send + Sync + 'static,
    {
        *write(&self.load_source) = Some(Arc::new(source));
    }

    /// Adds `service` to the router and, with a registry configured,
    /// registers it as provided by this server.
    pub async fn register_method(&self, service: ServiceDescribe) -> Result<()> {
        let method = service.name().to_string();
        self.router.register_method(service);

        let Some(reporting) = &self.reporting else {
            return Ok(());
        };
        reporting
            .registry
            .register_method(&method, &reporting.host, self.config.initial_load)
            .await?;

        let first = {
            let mut methods = write(&reporting.methods);
            if !methods.contains(&method) {
                methods.push(method);
            }
            methods.len() == 1
        };
        if first {
            self.start_reporting(reporting);
        }
        Ok(())
    }

    fn start_reporting(&self, reporting: &Reporting) {
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            return;
        }
        let heartbeat = &self.config.heartbeat;

        let registry = reporting.registry.clone();
        let host = reporting.host.clone();
        let methods = reporting.methods.clone();
        let router = self.router.clone();
        let load_source = self.load_source.clone();
        let period = heartbeat.load_report_interval;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !registry.connection().connected() {
                    warn!("registry connection closed, stopping load reports");
                    break;
                }
                let custom = read(&load_source).clone();
                let load = match custom {
                    Some(source) => source(),
                    None => u32::try_from(router.take_served()).unwrap_or(u32::MAX),
                };
                let current: Vec<String> = read(&methods).clone();
                for method in current {
                    if let Err(e) = registry.report_load(&method, &host, load).await {
                        warn!(method = %method, error = %e, "load report failed");
                    }
                }
            }
        }));

        let registry = reporting.registry.clone();
        let host = reporting.host.clone();
        let methods = reporting.methods.clone();
        let period = heartbeat.heartbeat_interval;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !registry.connection().connected() {
                    warn!("registry connection closed, stopping heartbeats");
                    break;
                }
                let current: Vec<String> = read(&methods).clone();
                for method in current {
                    if let Err(e) = registry.heartbeat(&method, &host).await {
                        warn!(method = %method, error = %e, "heartbeat failed");
                    }
                }
            }
        }));
        debug!(host = %reporting.host, "provider reporting started");
    }

    /// Serves connections until the listener fails.
    pub async fn run(&self) -> Result<()> {
        self.server.run(self.dispatcher.clone()).await
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(reporting) = &self.reporting {
            reporting.registry.shutdown();
        }
    }
}
