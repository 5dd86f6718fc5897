// src/fleet/ports.rs
//! OS-level port checks used by the spawner

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Probes local ports
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// `true` if nothing is bound to the port
    fn is_free(&self, port: u16) -> bool;

    /// `true` if something accepts TCP connections on the port
    async fn is_accepting(&self, port: u16) -> bool;
}

/// Probes by binding and connecting on a host address
#[derive(Debug, Clone)]
pub struct TcpPortProbe {
    host: String,
    connect_timeout: Duration,
}

impl TcpPortProbe {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            connect_timeout: Duration::from_millis(500),
        }
    }
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self::new("127.0.0.1")
    }
}

#[async_trait]
impl PortProbe for TcpPortProbe {
    fn is_free(&self, port: u16) -> bool {
        // the listener drops immediately, releasing the port
        let free = std::net::TcpListener::bind((self.host.as_str(), port)).is_ok();
        trace!("Port {} free: {}", port, free);
        free
    }

    async fn is_accepting(&self, port: u16) -> bool {
        let connect = TcpStream::connect((self.host.as_str(), port));
        matches!(
            tokio::time::timeout(self.connect_timeout, connect).await,
            Ok(Ok(_))
        )
    }
}
