//! Client side of the service registry.
//!
//! - [`Provider`]: the process offering methods (register, load report,
//!   heartbeat)
//! - [`Discover`]: the process looking methods up, with a per-method
//!   [`MethodHost`] cache kept current by registry pushes

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hubrpc_common::protocol::error::Result;
use hubrpc_common::sync::lock;
use hubrpc_common::transport::ConnectionRef;
use hubrpc_common::{
    HostDetail, HostInfo, Message, Requestor, RpcError, ServiceOpType, ServiceRequest,
    ServiceResponse,
};
use tracing::{debug, info, warn};

use crate::load_balancer::{LoadBalanceStrategy, MethodHost};

/// Runs after a host goes offline for a method, with the cache already
/// updated.
pub type OfflineCallback = Arc<dyn Fn(&str, &HostInfo) + Send + Sync>;

fn unwrap_service_response(message: Message) -> Result<ServiceResponse> {
    let response = ServiceResponse::try_from(message)?;
    if !response.rcode.is_success() {
        return Err(RpcError::Remote(response.rcode));
    }
    Ok(response)
}

/// Registry requests issued by a process that offers methods.
#[derive(Clone)]
pub struct Provider {
    requestor: Arc<Requestor>,
}

impl Provider {
    pub fn new(requestor: Arc<Requestor>) -> Self {
        Self { requestor }
    }

    /// Announces that `host` serves `method` with an initial `load`.
    pub async fn register_method(
        &self,
        conn: &ConnectionRef,
        method: &str,
        host: &HostInfo,
        load: u32,
    ) -> Result<()> {
        let request =
            ServiceRequest::new(method, ServiceOpType::Register, Some(host.clone())).with_load(load);
        self.request(conn, request).await?;
        info!(method, %host, load, "registered method");
        Ok(())
    }

    /// Reports the current load of `host` for `method`. Also counts as a
    /// heartbeat.
    pub async fn report_load(
        &self,
        conn: &ConnectionRef,
        method: &str,
        host: &HostInfo,
        load: u32,
    ) -> Result<()> {
        let request =
            ServiceRequest::new(method, ServiceOpType::LoadReport, Some(host.clone())).with_load(load);
        self.request(conn, request).await?;
        debug!(method, %host, load, "load reported");
        Ok(())
    }

    /// Refreshes the registry's liveness timestamp for `host`.
    pub async fn heartbeat(&self, conn: &ConnectionRef, method: &str, host: &HostInfo) -> Result<()> {
        let request = ServiceRequest::new(method, ServiceOpType::HeartbeatProvider, Some(host.clone()));
        self.request(conn, request).await?;
        debug!(method, %host, "heartbeat acknowledged");
        Ok(())
    }

    async fn request(&self, conn: &ConnectionRef, request: ServiceRequest) -> Result<ServiceResponse> {
        let optype = request.optype;
        let method = request.method.clone();
        let response = self.requestor.send(conn, request.into()).await?;
        unwrap_service_response(response).map_err(|e| {
            warn!(method = %method, ?optype, error = %e, "registry request failed");
            e
        })
    }
}

/// Method lookup with a local host cache.
pub struct Discover {
    requestor: Arc<Requestor>,
    method_hosts: Mutex<HashMap<String, Arc<MethodHost>>>,
    on_offline: Option<OfflineCallback>,
}

impl Discover {
    pub fn new(requestor: Arc<Requestor>, on_offline: Option<OfflineCallback>) -> Self {
        Self {
            requestor,
            method_hosts: Mutex::new(HashMap::new()),
            on_offline,
        }
    }

    /// Picks a provider of `method`.
    ///
    /// Serves from the cache when it holds at least one host, unless
    /// `force_remote` is set. Otherwise asks the registry, replaces the
    /// cache entry with the fresh list, and selects from it.
    ///
    /// # Errors
    ///
    /// - [`RpcError::NoProvider`] if the registry knows no provider
    /// - [`RpcError::Remote`] if the registry rejected the lookup
    pub async fn discover(
        &self,
        conn: &ConnectionRef,
        method: &str,
        strategy: LoadBalanceStrategy,
        key: &str,
        force_remote: bool,
    ) -> Result<HostDetail> {
        if !force_remote {
            if let Some(hosts) = self.method_host(method) {
                if let Some(host) = hosts.select_host(strategy, key) {
                    return Ok(host);
                }
            }
        }

        let hosts = self.refresh(conn, method).await?;
        hosts
            .select_host(strategy, key)
            .ok_or_else(|| RpcError::NoProvider(method.to_string()))
    }

    /// Fetches the provider list for `method` and replaces the cache entry.
    ///
    /// An empty list still replaces the entry (so stale hosts disappear) but
    /// is reported as [`RpcError::NoProvider`].
    pub async fn refresh(&self, conn: &ConnectionRef, method: &str) -> Result<Arc<MethodHost>> {
        let request = ServiceRequest::new(method, ServiceOpType::Discover, None);
        let response = unwrap_service_response(self.requestor.send(conn, request.into()).await?)?;
        let hosts = response.hosts.unwrap_or_default();
        let empty = hosts.is_empty();

        let method_host = Arc::new(MethodHost::new(hosts));
        lock(&self.method_hosts).insert(method.to_string(), method_host.clone());

        if empty {
            warn!(method, "no providers for method");
            return Err(RpcError::NoProvider(method.to_string()));
        }
        debug!(method, hosts = method_host.host_count(), "discovered providers");
        Ok(method_host)
    }

    /// Applies an online/offline push from the registry.
    ///
    /// Online appends the host with zero load, creating the cache entry if
    /// needed. Offline removes the host and then runs the offline callback.
    pub fn on_service_notification(&self, request: ServiceRequest) {
        let Some(host) = request.host else {
            warn!(method = %request.method, "service notification without host");
            return;
        };

        match request.optype {
            ServiceOpType::Online => {
                info!(method = %request.method, %host, "provider online");
                let method_host = lock(&self.method_hosts)
                    .entry(request.method.clone())
                    .or_insert_with(|| Arc::new(MethodHost::new(Vec::new())))
                    .clone();
                method_host.append_host(HostDetail::new(host, 0));
            }
            ServiceOpType::Offline => {
                info!(method = %request.method, %host, "provider offline");
                let method_host = lock(&self.method_hosts).get(&request.method).cloned();
                if let Some(method_host) = method_host {
                    method_host.remove_host(&host);
                }
                if let Some(callback) = &self.on_offline {
                    callback(&request.method, &host);
                }
            }
            other => {
                warn!(method = %request.method, optype = ?other, "unexpected service notification");
            }
        }
    }

    pub fn method_host(&self, method: &str) -> Option<Arc<MethodHost>> {
        lock(&self.method_hosts).get(method).cloned()
    }

    /// Every method with a cache entry.
    pub fn discovered_methods(&self) -> Vec<String> {
        lock(&self.method_hosts).keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubrpc_common::transport::MemoryConnection;
    use hubrpc_common::RespCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<Requestor>, Arc<MemoryConnection>, ConnectionRef) {
        let requestor = Arc::new(Requestor::new());
        let memory = Arc::new(MemoryConnection::new());
        let conn: ConnectionRef = memory.clone();
        (requestor, memory, conn)
    }

    /// Answers the next request sent on `memory` with `respond`.
    fn answer_next<F>(
        requestor: Arc<Requestor>,
        memory: Arc<MemoryConnection>,
        conn: ConnectionRef,
        respond: F,
    ) -> tokio::task::JoinHandle<ServiceRequest>
    where
        F: FnOnce(&ServiceRequest) -> ServiceResponse + Send + 'static,
    {
        tokio::spawn(async move {
            loop {
                if let Some(message) = memory.take_sent().into_iter().next() {
                    let request = ServiceRequest::try_from(message).unwrap();
                    let mut response = respond(&request);
                    response.id = request.id.clone();
                    requestor.on_response(&conn, response.into());
                    return request;
                }
                tokio::task::yield_now().await;
            }
        })
    }

    fn host(port: u16) -> HostInfo {
        HostInfo::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_register_sends_host_and_load() {
        let (requestor, memory, conn) = setup();
        let provider = Provider::new(requestor.clone());

        let responder = answer_next(requestor, memory, conn.clone(), |_| {
            ServiceResponse::new("", RespCode::Success, ServiceOpType::Register)
        });
        provider.register_method(&conn, "add", &host(9001), 10).await.unwrap();

        let request = responder.await.unwrap();
        assert_eq!(request.optype, ServiceOpType::Register);
        assert_eq!(request.host, Some(host(9001)));
        assert_eq!(request.load, Some(10));
    }

    #[tokio::test]
    async fn test_heartbeat_failure_is_reported() {
        let (requestor, memory, conn) = setup();
        let provider = Provider::new(requestor.clone());

        let responder = answer_next(requestor, memory, conn.clone(), |_| {
            ServiceResponse::failure("", RespCode::ServiceNotFound)
        });
        let err = provider.heartbeat(&conn, "add", &host(9001)).await.unwrap_err();
        assert_eq!(err.resp_code(), Some(RespCode::ServiceNotFound));
        assert_eq!(responder.await.unwrap().optype, ServiceOpType::HeartbeatProvider);
    }

    #[tokio::test]
    async fn test_discover_caches_remote_result() {
        let (requestor, memory, conn) = setup();
        let discover = Discover::new(requestor.clone(), None);

        let responder = answer_next(requestor, memory.clone(), conn.clone(), |req| {
            ServiceResponse::discovered("", req.method.clone(), vec![HostDetail::new(host(9001), 10)])
        });
        let selected = discover
            .discover(&conn, "add", LoadBalanceStrategy::RoundRobin, "", false)
            .await
            .unwrap();
        assert_eq!(selected.host, host(9001));
        assert_eq!(responder.await.unwrap().optype, ServiceOpType::Discover);

        // Served from cache: nothing else goes on the wire.
        let again = discover
            .discover(&conn, "add", LoadBalanceStrategy::RoundRobin, "", false)
            .await
            .unwrap();
        assert_eq!(again.host, host(9001));
        assert_eq!(memory.sent_count(), 0);
        assert_eq!(discover.discovered_methods(), vec!["add".to_string()]);
    }

    #[tokio::test]
    async fn test_discover_empty_list_fails() {
        let (requestor, memory, conn) = setup();
        let discover = Discover::new(requestor.clone(), None);

        let _responder = answer_next(requestor, memory, conn.clone(), |req| {
            ServiceResponse::discovered("", req.method.clone(), vec![])
        });
        let result = discover
            .discover(&conn, "add", LoadBalanceStrategy::RoundRobin, "", false)
            .await;
        assert!(matches!(result, Err(RpcError::NoProvider(_))));
    }

    #[test]
    fn test_online_creates_cache_entry() {
        let (requestor, _, _) = setup();
        let discover = Discover::new(requestor, None);

        discover.on_service_notification(ServiceRequest::new(
            "add",
            ServiceOpType::Online,
            Some(host(9001)),
        ));
        discover.on_service_notification(ServiceRequest::new(
            "add",
            ServiceOpType::Online,
            Some(host(9002)),
        ));

        let hosts = discover.method_host("add").unwrap();
        assert_eq!(hosts.host_count(), 2);
        assert!(hosts.hosts().iter().all(|h| h.load == 0));
    }

    #[test]
    fn test_offline_prunes_and_notifies() {
        let (requestor, _, _) = setup();
        let offline_calls = Arc::new(AtomicUsize::new(0));
        let counter = offline_calls.clone();
        let callback: OfflineCallback = Arc::new(move |method, host| {
            assert_eq!(method, "add");
            assert_eq!(host.port, 9001);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let discover = Discover::new(requestor, Some(callback));

        discover.on_service_notification(ServiceRequest::new(
            "add",
            ServiceOpType::Online,
            Some(host(9001)),
        ));
        discover.on_service_notification(ServiceRequest::new(
            "add",
            ServiceOpType::Offline,
            Some(host(9001)),
        ));

        assert!(discover.method_host("add").unwrap().is_empty());
        assert_eq!(offline_calls.load(Ordering::SeqCst), 1);
    }
}
