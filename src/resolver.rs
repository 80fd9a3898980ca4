//! Name resolution for the peer's external endpoint
//!
//! Lookups go to one fixed DNS server over UDP rather than the system
//! resolver, so the result does not depend on local resolver configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use hickory_resolver::config::{
    NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts,
};
use hickory_resolver::TokioAsyncResolver;

use crate::error::{NetworkError, Result};

/// Public resolver used unless another is given
pub const DEFAULT_DNS_SERVER: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);

/// Host name lookup
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// All addresses for `host`, in the order the server returned them
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolver that queries a single name server
pub struct FixedDnsResolver {
    resolver: TokioAsyncResolver,
    server: SocketAddr,
}

impl FixedDnsResolver {
    pub fn new(server: SocketAddr) -> Self {
        let group = NameServerConfigGroup::from(vec![NameServerConfig::new(server, Protocol::Udp)]);
        let config = ResolverConfig::from_parts(None, vec![], group);

        let mut opts = ResolverOpts::default();
        opts.attempts = 1;
        opts.use_hosts_file = false;

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            server,
        }
    }
}

impl Default for FixedDnsResolver {
    fn default() -> Self {
        Self::new(DEFAULT_DNS_SERVER)
    }
}

#[async_trait]
impl EndpointResolver for FixedDnsResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        tracing::debug!("Resolving {} via {}", host, self.server);
        let lookup = self.resolver.lookup_ip(host).await.map_err(|e| {
            tracing::debug!("Lookup of {} failed: {}", host, e);
            NetworkError::DnsResolutionFailed {
                host: host.to_string(),
            }
        })?;
        Ok(lookup.iter().collect())
    }
}

/// Resolve `host` and join it with `port` into `ip:port` (`[ip]:port` for
/// IPv6). Literal addresses are used as-is; otherwise the first address
/// returned wins.
pub async fn resolve_endpoint(
    resolver: &dyn EndpointResolver,
    host: &str,
    port: u16,
) -> Result<String> {
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port).to_string());
    }

    let addresses = resolver.lookup(host).await?;
    let ip = addresses
        .first()
        .copied()
        .ok_or_else(|| NetworkError::DnsResolutionFailed {
            host: host.to_string(),
        })?;

    tracing::debug!("Resolved {} to {}", host, ip);
    Ok(SocketAddr::new(ip, port).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::WgncError;

    struct MockResolver {
        answer: Vec<IpAddr>,
        calls: AtomicUsize,
    }

    impl MockResolver {
        fn new(answer: &[&str]) -> Self {
            Self {
                answer: answer.iter().map(|a| a.parse().unwrap()).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EndpointResolver for MockResolver {
        async fn lookup(&self, _host: &str) -> Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.clone())
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl EndpointResolver for FailingResolver {
        async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
            Err(NetworkError::DnsResolutionFailed {
                host: host.to_string(),
            }
            .into())
        }
    }

    #[tokio::test]
    async fn test_literal_ip_skips_lookup() {
        let resolver = MockResolver::new(&["192.0.2.99"]);
        let joined = resolve_endpoint(&resolver, "203.0.113.5", 51820).await.unwrap();
        assert_eq!(joined, "203.0.113.5:51820");
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_address_wins() {
        let resolver = MockResolver::new(&["198.51.100.1", "198.51.100.2"]);
        let joined = resolve_endpoint(&resolver, "vpn.example.com", 51820).await.unwrap();
        assert_eq!(joined, "198.51.100.1:51820");
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ipv6_is_bracketed() {
        let resolver = MockResolver::new(&["2001:db8::1"]);
        let joined = resolve_endpoint(&resolver, "vpn.example.com", 51820).await.unwrap();
        assert_eq!(joined, "[2001:db8::1]:51820");

        let joined = resolve_endpoint(&resolver, "2001:db8::7", 1).await.unwrap();
        assert_eq!(joined, "[2001:db8::7]:1");
    }

    #[tokio::test]
    async fn test_port_zero_passes_through() {
        let resolver = MockResolver::new(&[]);
        let joined = resolve_endpoint(&resolver, "192.0.2.1", 0).await.unwrap();
        assert_eq!(joined, "192.0.2.1:0");
    }

    #[tokio::test]
    async fn test_empty_answer_is_an_error() {
        let resolver = MockResolver::new(&[]);
        let result = resolve_endpoint(&resolver, "nowhere.example", 51820).await;
        assert!(matches!(
            result,
            Err(WgncError::Network(NetworkError::DnsResolutionFailed { host })) if host == "nowhere.example"
        ));
    }

    #[tokio::test]
    async fn test_lookup_error_propagates() {
        let result = resolve_endpoint(&FailingResolver, "vpn.example.com", 51820).await;
        assert!(matches!(
            result,
            Err(WgncError::Network(NetworkError::DnsResolutionFailed { .. }))
        ));
    }

    #[test]
    fn test_default_server() {
        assert_eq!(DEFAULT_DNS_SERVER.to_string(), "8.8.8.8:53");
    }
}
