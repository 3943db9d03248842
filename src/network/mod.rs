//! Network module - UDP link to the motor controller
//!
//! Provides:
//! - A transceiver owning the datagram socket and the background receive task
//! - Address resolution helpers for the console and CLI

mod transceiver;

pub use transceiver::*;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Configuration for the transceiver
#[derive(Debug, Clone)]
pub struct TransceiverConfig {
    /// Back-off after a receive error, in milliseconds
    pub poll_interval_ms: u64,
    /// Upper bound on waiting for the receive task at shutdown, in milliseconds
    pub join_timeout_ms: u64,
    /// Capacity of the console's record and log channels
    pub channel_capacity: usize,
}

impl Default for TransceiverConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1,
            join_timeout_ms: 1000,
            channel_capacity: 256,
        }
    }
}

impl TransceiverConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn with_join_timeout(mut self, join_timeout_ms: u64) -> Self {
        self.join_timeout_ms = join_timeout_ms;
        self
    }
}

/// Resolve a host (IP literal or hostname) to an IPv4 socket address.
///
/// The transceiver binds an IPv4 socket, so IPv6 literals are rejected and
/// hostnames resolve to their first IPv4 address.
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use std::io::{Error, ErrorKind};
    use tokio::net::lookup_host;

    let host = host.trim();

    if let Ok(ip) = host.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(_) => Ok(SocketAddr::new(ip, port)),
            IpAddr::V6(_) => Err(Error::new(
                ErrorKind::InvalidInput,
                format!("IPv6 address {} is not supported", ip),
            )),
        };
    }

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.find(SocketAddr::is_ipv4).ok_or_else(|| {
        Error::new(
            ErrorKind::NotFound,
            format!("Could not resolve host to an IPv4 address: {}", host),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let addr = resolve_host("192.168.70.129", 9000).await.unwrap();
        assert_eq!(addr, "192.168.70.129:9000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = resolve_host("localhost", 9000).await.unwrap();
        assert!(addr.is_ipv4());
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 9000);
    }

    #[tokio::test]
    async fn test_resolve_rejects_ipv6_literal() {
        let err = resolve_host("::1", 9000).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(resolve_host(" fe80::1 ", 9000).await.is_err());
    }

    #[test]
    fn test_default_timings() {
        let config = TransceiverConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
        assert_eq!(config.join_timeout(), Duration::from_secs(1));
    }
}
