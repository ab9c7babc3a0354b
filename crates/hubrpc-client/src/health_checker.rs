use std::sync::Arc;
use std::time::Duration;

use hubrpc_common::transport::ConnectionRef;
use hubrpc_common::HeartbeatConfig;
use tracing::{debug, info, warn};

use crate::registry::Discover;

/// Discovery refresh configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Period of forced re-discovery for every cached method.
    pub refresh_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            refresh_interval: HeartbeatConfig::default().heartbeat_interval,
        }
    }
}

/// Periodic re-discovery of every cached method.
///
/// Each pass forces a registry round-trip per method, so cached loads are
/// refreshed and hosts the registry no longer knows drop out of the cache.
pub struct HealthChecker {
    discover: Arc<Discover>,
    conn: ConnectionRef,
    config: DiscoveryConfig,
}

impl HealthChecker {
    /// Creates a new health checker.
    ///
    /// # Arguments
    /// * `discover` - The discovery cache to refresh
    /// * `conn` - Connection to the registry
    /// * `config` - Refresh configuration
    pub fn new(discover: Arc<Discover>, conn: ConnectionRef, config: DiscoveryConfig) -> Self {
        Self {
            discover,
            conn,
            config,
        }
    }

    /// Starts the health checker task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Main refresh loop; ends when the registry connection closes.
    async fn run(self) {
        let mut interval = tokio::time::interval(self.config.refresh_interval);
        // The first tick completes immediately; nothing is cached yet.
        interval.tick().await;

        loop {
            interval.tick().await;
            if !self.conn.connected() {
                info!("registry connection closed, stopping discovery refresh");
                break;
            }
            self.check_all_methods().await;
        }
    }

    /// Re-discovers every cached method. Returns how many refreshed with
    /// at least one provider.
    pub async fn check_all_methods(&self) -> usize {
        let methods = self.discover.discovered_methods();

        let checks: Vec<_> = methods
            .into_iter()
            .map(|method| {
                let discover = &self.discover;
                let conn = &self.conn;
                async move {
                    let result = discover.refresh(conn, &method).await;
                    (method, result)
                }
            })
            .collect();

        let results = futures::future::join_all(checks).await;

        let mut refreshed = 0;
        for (method, result) in results {
            match result {
                Ok(hosts) => {
                    debug!(method = %method, hosts = hosts.host_count(), "discovery refreshed");
                    refreshed += 1;
                }
                Err(e) => warn!(method = %method, error = %e, "discovery refresh failed"),
            }
        }
        refreshed
    }
}
