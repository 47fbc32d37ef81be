//! Broker reachability probing used by validation.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

#[async_trait]
pub trait BrokerProbe: Send + Sync {
    /// Whether a broker at `address` answers within the probe's timeout.
    async fn is_reachable(&self, address: &str) -> bool;
}

/// Probes a broker by opening a TCP connection to it.
///
/// Addresses may carry a scheme (`kafka://host:9092`) and may be a
/// comma-separated bootstrap list; the address counts as reachable when any
/// entry accepts a connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

fn endpoints(address: &str) -> Vec<String> {
    address
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.split_once("://") {
            Some((_, rest)) => rest.trim_end_matches('/').to_string(),
            None => s.trim_end_matches('/').to_string(),
        })
        .collect()
}

fn has_port(endpoint: &str) -> bool {
    endpoint
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
}

#[async_trait]
impl BrokerProbe for TcpProbe {
    async fn is_reachable(&self, address: &str) -> bool {
        for endpoint in endpoints(address) {
            if !has_port(&endpoint) {
                tracing::debug!(%endpoint, "Broker endpoint has no port");
                continue;
            }
            match tokio::time::timeout(self.timeout, TcpStream::connect(endpoint.as_str())).await {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) => tracing::debug!(%endpoint, error = %e, "Broker connect failed"),
                Err(_) => tracing::debug!(%endpoint, "Broker connect timed out"),
            }
        }
        false
    }
}
