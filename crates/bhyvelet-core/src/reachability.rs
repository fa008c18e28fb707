//! Waiting for the guest to accept connections.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Decides when a guest with a known address is usable.
#[async_trait]
pub trait Reachability: Send + Sync {
    /// Return once `addr` accepts connections, or fail.
    async fn wait(&self, addr: SocketAddr) -> Result<()>;
}

/// Retries a TCP connect until it succeeds or `timeout` elapses.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub timeout: Duration,
    pub interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

#[async_trait]
impl Reachability for TcpProbe {
    async fn wait(&self, addr: SocketAddr) -> Result<()> {
        let start = tokio::time::Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let connect = TcpStream::connect(addr);
            let error = match tokio::time::timeout(self.connect_timeout, connect).await {
                Ok(Ok(_stream)) => {
                    tracing::info!(
                        %addr,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        attempts,
                        "guest reachable"
                    );
                    return Ok(());
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "connect timed out".to_string(),
            };
            if start.elapsed() >= self.timeout {
                tracing::warn!(%addr, attempts, "guest unreachable");
                return Err(CoreError::Unreachable {
                    addr,
                    waited: start.elapsed(),
                });
            }
            tracing::trace!(%addr, attempt = attempts, error = %error, "connect failed, retrying");
            tokio::time::sleep(self.interval).await;
        }
    }
}
