use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Network address of a provider, as advertised to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostInfo {
    pub ip: String,
    pub port: u16,
}

impl HostInfo {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// `ip:port` form accepted by the TCP connector.
    pub fn to_addr_string(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<SocketAddr> for HostInfo {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// A host together with the load it last reported.
///
/// On the wire this is a flat `{ip, port, load}` object; `load` defaults to
/// zero when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDetail {
    #[serde(flatten)]
    pub host: HostInfo,
    #[serde(default)]
    pub load: u32,
}

impl HostDetail {
    pub fn new(host: HostInfo, load: u32) -> Self {
        Self { host, load }
    }
}
