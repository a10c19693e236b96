//! Hostname to endpoint resolution with positive and negative caching

use crate::config::ResolverConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

/// Resolves a host (name or IP literal) and port to a transport endpoint
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Option<SocketAddr>;
}

struct CacheEntry {
    endpoint: Option<SocketAddr>,
    expires_at: Instant,
}

/// System DNS resolver. Failures are remembered for the negative TTL so a
/// dead hostname is not looked up on every probe.
pub struct DnsResolver {
    config: ResolverConfig,
    cache: DashMap<(String, u16), CacheEntry>,
}

impl DnsResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            cache: DashMap::new(),
        }
    }

    fn cached(&self, key: &(String, u16)) -> Option<Option<SocketAddr>> {
        let entry = self.cache.get(key)?;
        (entry.expires_at > Instant::now()).then_some(entry.endpoint)
    }

    fn store(&self, key: (String, u16), endpoint: Option<SocketAddr>) {
        let ttl = if endpoint.is_some() {
            self.config.ttl
        } else {
            self.config.negative_ttl
        };
        self.cache.insert(
            key,
            CacheEntry {
                endpoint,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drops expired entries
    pub fn purge(&self) {
        let now = Instant::now();
        self.cache.retain(|_, entry| entry.expires_at > now);
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

#[async_trait]
impl Resolve for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> Option<SocketAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(SocketAddr::new(ip, port));
        }

        let key = (host.to_ascii_lowercase(), port);
        if let Some(endpoint) = self.cached(&key) {
            return endpoint;
        }

        let endpoint = match tokio::net::lookup_host((host, port)).await {
            Ok(addrs) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                addrs
                    .iter()
                    .find(|a| a.is_ipv4())
                    .or_else(|| addrs.first())
                    .copied()
            }
            Err(e) => {
                debug!("Failed to resolve {}:{}: {}", host, port, e);
                None
            }
        };

        self.store(key, endpoint);
        endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ip_literal_short_circuits() {
        let resolver = DnsResolver::default();
        let endpoint = resolver.resolve("192.168.0.10", 28960).await;

        assert_eq!(endpoint, Some("192.168.0.10:28960".parse().unwrap()));
        assert!(resolver.cache.is_empty());
    }

    #[tokio::test]
    async fn test_localhost_resolves_and_is_cached() {
        let resolver = DnsResolver::default();
        let endpoint = resolver.resolve("localhost", 28960).await;

        assert_eq!(endpoint.map(|e| e.port()), Some(28960));
        assert!(resolver.cached(&("localhost".to_string(), 28960)).is_some());
    }

    #[tokio::test]
    async fn test_negative_results_are_cached_briefly() {
        let resolver = DnsResolver::new(ResolverConfig {
            ttl: Duration::from_secs(600),
            negative_ttl: Duration::from_millis(200),
        });
        let key = ("no-such-host.invalid".to_string(), 1);
        resolver.store(key.clone(), None);

        assert_eq!(resolver.cached(&key), Some(None));
        assert_eq!(resolver.resolve("no-such-host.invalid", 1).await, None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(resolver.cached(&key), None);
        resolver.purge();
        assert!(resolver.cache.is_empty());
    }
}
