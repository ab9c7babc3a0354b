use std::time::Duration;

/// Liveness timing shared by the registry and its providers.
///
/// # Default Configuration
///
/// - `check_interval`: 5s (registry sweep period)
/// - `idle_timeout`: 15s (silence after which a provider is evicted)
/// - `heartbeat_interval`: 10s (provider heartbeat and client re-discovery period)
/// - `load_report_interval`: 3s (provider load report period)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub check_interval: Duration,
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub load_report_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(10),
            load_report_interval: Duration::from_secs(3),
        }
    }
}
