//! Server side of the service registry.
//!
//! [`ProviderManager`] tracks which connections provide which methods,
//! with their load and last heartbeat. [`DiscovererManager`] tracks which
//! connections watch which methods and pushes online/offline notifications
//! to them. [`RegistryService`] ties the two to the wire protocol.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hubrpc_common::sync::lock;
use hubrpc_common::transport::{ConnectionId, ConnectionRef};
use hubrpc_common::{
    ClockRef, HostDetail, HostInfo, RespCode, ServiceOpType, ServiceRequest, ServiceResponse,
};
use tracing::{debug, info, warn};

// ============================================================================
// Providers
// ============================================================================

#[derive(Debug)]
struct ProviderState {
    host: HostInfo,
    load: u32,
    last_heartbeat: Instant,
    methods: HashSet<String>,
}

/// One provider connection.
#[derive(Debug)]
pub struct Provider {
    conn: ConnectionId,
    state: Mutex<ProviderState>,
}

impl Provider {
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    pub fn host(&self) -> HostInfo {
        lock(&self.state).host.clone()
    }

    pub fn detail(&self) -> HostDetail {
        let state = lock(&self.state);
        HostDetail::new(state.host.clone(), state.load)
    }

    pub fn methods(&self) -> Vec<String> {
        lock(&self.state).methods.iter().cloned().collect()
    }
}

#[derive(Default)]
struct ProviderIndex {
    by_conn: HashMap<ConnectionId, Arc<Provider>>,
    by_method: HashMap<String, BTreeMap<ConnectionId, Arc<Provider>>>,
}

/// Provider bookkeeping, indexed by connection and by method.
pub struct ProviderManager {
    clock: ClockRef,
    index: Mutex<ProviderIndex>,
}

impl ProviderManager {
    pub fn new(clock: ClockRef) -> Self {
        Self {
            clock,
            index: Mutex::new(ProviderIndex::default()),
        }
    }

    /// Creates or updates the provider for `conn` and adds it to the
    /// providers of `method`. Refreshes its load and heartbeat.
    pub fn add_provider(&self, conn: ConnectionId, host: HostInfo, method: &str, load: u32) {
        let now = self.clock.now();
        let mut index = lock(&self.index);

        let provider = index
            .by_conn
            .entry(conn)
            .or_insert_with(|| {
                Arc::new(Provider {
                    conn,
                    state: Mutex::new(ProviderState {
                        host: host.clone(),
                        load,
                        last_heartbeat: now,
                        methods: HashSet::new(),
                    }),
                })
            })
            .clone();

        {
            let mut state = lock(&provider.state);
            state.host = host;
            state.load = load;
            state.last_heartbeat = now;
            state.methods.insert(method.to_string());
        }

        index
            .by_method
            .entry(method.to_string())
            .or_default()
            .insert(conn, provider);
    }

    /// Current providers of `method` with their loads.
    pub fn method_host_details(&self, method: &str) -> Vec<HostDetail> {
        let index = lock(&self.index);
        index
            .by_method
            .get(method)
            .map(|providers| providers.values().map(|p| p.detail()).collect())
            .unwrap_or_default()
    }

    /// Sets the load of the provider at `host` for `method`. A load report
    /// also counts as a heartbeat. Returns false if no such provider exists.
    pub fn update_provider_load(&self, method: &str, host: &HostInfo, load: u32) -> bool {
        let now = self.clock.now();
        self.with_provider(method, host, |state| {
            state.load = load;
            state.last_heartbeat = now;
        })
    }

    /// Refreshes the heartbeat of the provider at `host` for `method`.
    pub fn update_provider_last_heartbeat(&self, method: &str, host: &HostInfo) -> bool {
        let now = self.clock.now();
        self.with_provider(method, host, |state| state.last_heartbeat = now)
    }

    fn with_provider<F>(&self, method: &str, host: &HostInfo, update: F) -> bool
    where
        F: FnOnce(&mut ProviderState),
    {
        let index = lock(&self.index);
        let Some(providers) = index.by_method.get(method) else {
            return false;
        };
        for provider in providers.values() {
            let mut state = lock(&provider.state);
            if &state.host == host {
                update(&mut *state);
                return true;
            }
        }
        false
    }

    /// Evicts every (method, provider) pair whose last heartbeat is older
    /// than `idle_timeout`, returning the evicted pairs.
    ///
    /// An evicted provider loses the method from its own set as well, and
    /// a provider left with no methods is forgotten entirely, so each
    /// eviction is reported once.
    pub fn sweep_expired(&self, idle_timeout: Duration) -> Vec<(String, HostInfo)> {
        let now = self.clock.now();
        let mut index = lock(&self.index);
        let mut evicted = Vec::new();
        let mut emptied_conns = Vec::new();

        for (method, providers) in index.by_method.iter_mut() {
            providers.retain(|conn, provider| {
                let mut state = lock(&provider.state);
                if now.saturating_duration_since(state.last_heartbeat) <= idle_timeout {
                    return true;
                }
                state.methods.remove(method);
                if state.methods.is_empty() {
                    emptied_conns.push(*conn);
                }
                evicted.push((method.clone(), state.host.clone()));
                false
            });
        }

        index.by_method.retain(|_, providers| !providers.is_empty());
        for conn in emptied_conns {
            index.by_conn.remove(&conn);
        }
        evicted
    }

    /// Forgets the provider on `conn`. Returns its host and the methods it
    /// provided, or `None` if `conn` was not a provider.
    pub fn remove_connection(&self, conn: ConnectionId) -> Option<(HostInfo, Vec<String>)> {
        let mut index = lock(&self.index);
        let provider = index.by_conn.remove(&conn)?;
        let (host, methods) = {
            let state = lock(&provider.state);
            (state.host.clone(), state.methods.iter().cloned().collect::<Vec<_>>())
        };

        for method in &methods {
            if let Some(providers) = index.by_method.get_mut(method) {
                providers.remove(&conn);
                if providers.is_empty() {
                    index.by_method.remove(method);
                }
            }
        }
        Some((host, methods))
    }

    pub fn provider(&self, conn: ConnectionId) -> Option<Arc<Provider>> {
        lock(&self.index).by_conn.get(&conn).cloned()
    }

    pub fn provider_count(&self) -> usize {
        lock(&self.index).by_conn.len()
    }
}

// ============================================================================
// Discoverers
// ============================================================================

#[derive(Default)]
struct DiscovererIndex {
    by_method: HashMap<String, BTreeMap<ConnectionId, ConnectionRef>>,
    by_conn: HashMap<ConnectionId, HashSet<String>>,
}

/// Connections watching methods for provider changes.
#[derive(Default)]
pub struct DiscovererManager {
    index: Mutex<DiscovererIndex>,
}

impl DiscovererManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_discoverer(&self, conn: &ConnectionRef, method: &str) {
        let mut index = lock(&self.index);
        index
            .by_method
            .entry(method.to_string())
            .or_default()
            .insert(conn.id(), conn.clone());
        index
            .by_conn
            .entry(conn.id())
            .or_default()
            .insert(method.to_string());
    }

    /// Pushes an Online notification for `host` to every watcher of
    /// `method`. Returns how many were sent.
    pub fn online_notify(&self, method: &str, host: &HostInfo) -> usize {
        self.notify(method, host, ServiceOpType::Online)
    }

    pub fn offline_notify(&self, method: &str, host: &HostInfo) -> usize {
        self.notify(method, host, ServiceOpType::Offline)
    }

    fn notify(&self, method: &str, host: &HostInfo, optype: ServiceOpType) -> usize {
        let watchers: Vec<ConnectionRef> = lock(&self.index)
            .by_method
            .get(method)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default();

        let mut sent = 0;
        for conn in watchers {
            let push = ServiceRequest::new(method, optype, Some(host.clone()));
            match conn.send(&push.into()) {
                Ok(()) => sent += 1,
                Err(e) => debug!(conn = conn.id(), method, error = %e, "failed to push service notification"),
            }
        }
        debug!(method, %host, ?optype, watchers = sent, "service notification pushed");
        sent
    }

    pub fn remove_connection(&self, conn: ConnectionId) {
        let mut index = lock(&self.index);
        let Some(methods) = index.by_conn.remove(&conn) else {
            return;
        };
        for method in methods {
            if let Some(conns) = index.by_method.get_mut(&method) {
                conns.remove(&conn);
                if conns.is_empty() {
                    index.by_method.remove(&method);
                }
            }
        }
    }

    pub fn watcher_count(&self, method: &str) -> usize {
        lock(&self.index)
            .by_method
            .get(method)
            .map_or(0, |conns| conns.len())
    }
}

// ============================================================================
// Registry service
// ============================================================================

/// Serves [`ServiceRequest`]s against the provider and discoverer
/// managers.
pub struct RegistryService {
    providers: ProviderManager,
    discoverers: DiscovererManager,
}

impl RegistryService {
    pub fn new(clock: ClockRef) -> Self {
        Self {
            providers: ProviderManager::new(clock),
            discoverers: DiscovererManager::new(),
        }
    }

    pub fn providers(&self) -> &ProviderManager {
        &self.providers
    }

    pub fn discoverers(&self) -> &DiscovererManager {
        &self.discoverers
    }

    /// Builds the response to `request` from `conn`, applying its effects.
    pub fn handle(&self, conn: &ConnectionRef, request: &ServiceRequest) -> ServiceResponse {
        let id = request.id.clone();
        let method = request.method.as_str();

        match request.optype {
            ServiceOpType::Register => {
                let Some(host) = request.host.clone() else {
                    return ServiceResponse::failure(id, RespCode::InvalidMsg);
                };
                let load = request.load.unwrap_or_default();
                info!(conn = conn.id(), method, %host, load, "provider registered");
                self.providers.add_provider(conn.id(), host.clone(), method, load);
                self.discoverers.online_notify(method, &host);
                ServiceResponse::new(id, RespCode::Success, ServiceOpType::Register)
            }
            ServiceOpType::Discover => {
                self.discoverers.add_discoverer(conn, method);
                let hosts = self.providers.method_host_details(method);
                debug!(conn = conn.id(), method, hosts = hosts.len(), "discovery");
                ServiceResponse::discovered(id, method, hosts)
            }
            ServiceOpType::LoadReport => {
                let (Some(host), Some(load)) = (&request.host, request.load) else {
                    return ServiceResponse::failure(id, RespCode::InvalidMsg);
                };
                if self.providers.update_provider_load(method, host, load) {
                    ServiceResponse::new(id, RespCode::Success, ServiceOpType::LoadReport)
                } else {
                    warn!(method, %host, "load report for unknown provider");
                    ServiceResponse::failure(id, RespCode::ServiceNotFound)
                }
            }
            ServiceOpType::HeartbeatProvider => {
                let Some(host) = &request.host else {
                    return ServiceResponse::failure(id, RespCode::InvalidMsg);
                };
                if self.providers.update_provider_last_heartbeat(method, host) {
                    ServiceResponse::new(id, RespCode::Success, ServiceOpType::HeartbeatProvider)
                } else {
                    warn!(method, %host, "heartbeat for unknown provider");
                    ServiceResponse::failure(id, RespCode::ServiceNotFound)
                }
            }
            other => {
                warn!(conn = conn.id(), method, optype = ?other, "invalid registry operation");
                ServiceResponse::failure(id, RespCode::InvalidOptype)
            }
        }
    }

    /// Answers `request` on `conn`.
    pub fn on_service_request(&self, conn: &ConnectionRef, request: ServiceRequest) {
        let response = self.handle(conn, &request);
        if let Err(e) = conn.send(&response.into()) {
            warn!(conn = conn.id(), method = %request.method, error = %e, "failed to send registry response");
        }
    }

    /// Forgets `conn` as a discoverer and, if it was a provider, announces
    /// each of its methods offline.
    pub fn on_connection_closed(&self, conn: &ConnectionRef) {
        self.discoverers.remove_connection(conn.id());
        if let Some((host, methods)) = self.providers.remove_connection(conn.id()) {
            info!(conn = conn.id(), %host, methods = methods.len(), "provider disconnected");
            for method in methods {
                self.discoverers.offline_notify(&method, &host);
            }
        }
    }

    /// Evicts providers idle longer than `idle_timeout` and announces them
    /// offline. Returns how many (method, host) pairs were evicted.
    pub fn sweep_and_notify(&self, idle_timeout: Duration) -> usize {
        let evicted = self.providers.sweep_expired(idle_timeout);
        for (method, host) in &evicted {
            info!(method = %method, %host, "provider heartbeat expired");
            self.discoverers.offline_notify(method, host);
        }
        evicted.len()
    }
}
