//! Upstream TCP connections
//!
//! The server dials origins through an [`UpstreamConnector`] so tests can
//! route hostnames to local listeners without touching DNS.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Keepalive interval for upstream sockets; tunnels have no idle timeout
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Opens TCP connections to origin servers
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Connect to `host:port`, giving up after `timeout`
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<TcpStream>;
}

/// Resolves the host and dials it directly
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectConnector;

#[async_trait]
impl UpstreamConnector for DirectConnector {
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(host, port, error = %e, "Upstream connect failed");
                return Err(ProxyError::UpstreamConnect {
                    host: host.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ProxyError::UpstreamTimeout {
                    host: host.to_string(),
                })
            }
        };
        tune(&stream);
        Ok(stream)
    }
}

/// Dials one fixed address whatever the requested host
///
/// Useful for chaining through a local relay and for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedConnector {
    addr: SocketAddr,
}

impl FixedConnector {
    /// Route every connection to `addr`
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl UpstreamConnector for FixedConnector {
    async fn connect(&self, host: &str, _port: u16, timeout: Duration) -> Result<TcpStream> {
        match tokio::time::timeout(timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(stream)) => {
                tune(&stream);
                Ok(stream)
            }
            Ok(Err(e)) => Err(ProxyError::UpstreamConnect {
                host: host.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ProxyError::UpstreamTimeout {
                host: host.to_string(),
            }),
        }
    }
}

/// Nodelay plus TCP keepalive; failures only cost latency
fn tune(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "set_tcp_keepalive failed");
    }
}
