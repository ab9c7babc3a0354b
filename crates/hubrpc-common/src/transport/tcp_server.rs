use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::protocol::error::{Result, RpcError};
use crate::transport::connection::ConnectionEvents;
use crate::transport::tcp::TcpConnection;

/// Async TCP server.
///
/// Accepts connections in a loop and hands each to a [`TcpConnection`]
/// whose events go to a shared [`ConnectionEvents`] sink.
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    /// Creates a new TCP server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:8080")
    pub async fn new(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self { listener })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Runs the accept loop until the listener fails.
    ///
    /// Transient accept errors (e.g. the peer resetting before the
    /// handshake completes) are logged and skipped.
    pub async fn run(&self, events: Arc<dyn ConnectionEvents>) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "accepting connections");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, "transient accept failure");
                    continue;
                }
                Err(e) => {
                    return Err(RpcError::Connection(format!(
                        "Failed to accept connection: {}",
                        e
                    )))
                }
            };

            debug!(%peer_addr, "accepted connection");
            TcpConnection::spawn(stream, events.clone());
        }
    }
}

fn is_transient_accept_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_server_creation() {
        let server = TcpServer::new("127.0.0.1:0").await;
        assert!(server.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_server_local_addr() {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_tcp_server_bind_conflict() {
        let first = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap().to_string();
        let second = TcpServer::new(&addr).await;
        assert!(matches!(second, Err(RpcError::Connection(_))));
    }
}
