//! Sources of game server endpoints

use crate::query::ServerAddress;
use crate::resolver::Resolve;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lists the game servers matchmaking may use
#[async_trait]
pub trait ServerList: Send + Sync {
    /// Fetches the list from its source, yielding endpoints as they resolve
    fn fetch_servers(&self) -> BoxStream<'_, SocketAddr>;

    /// Returns a cached list, fetching when there is none
    async fn get_servers(&self) -> Vec<SocketAddr> {
        self.fetch_servers().collect().await
    }
}

/// A fixed list of `host:port` entries, resolved on every fetch
pub struct StaticServerList {
    entries: Vec<ServerAddress>,
    resolver: Arc<dyn Resolve>,
    concurrency: usize,
}

impl StaticServerList {
    /// Entries that do not parse as `host:port` are skipped with a warning
    pub fn new(entries: &[String], resolver: Arc<dyn Resolve>, concurrency: usize) -> Self {
        let entries = entries
            .iter()
            .filter_map(|entry| {
                let parsed = ServerAddress::parse(entry);
                if parsed.is_none() {
                    warn!("Ignoring malformed server entry `{}`", entry);
                }
                parsed
            })
            .collect();
        Self {
            entries,
            resolver,
            concurrency: concurrency.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ServerList for StaticServerList {
    fn fetch_servers(&self) -> BoxStream<'_, SocketAddr> {
        stream::iter(self.entries.iter())
            .map(move |entry| async move {
                let endpoint = self.resolver.resolve(&entry.host, entry.port).await;
                if endpoint.is_none() {
                    debug!("Server {} did not resolve", entry);
                }
                endpoint
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|endpoint| async move { endpoint })
            .boxed()
    }
}

struct CachedList {
    servers: Vec<SocketAddr>,
    fetched_at: Instant,
}

/// Remembers the last fetched list for `ttl`
pub struct CachedServerList<L> {
    inner: L,
    ttl: Duration,
    cache: Mutex<Option<CachedList>>,
}

impl<L: ServerList> CachedServerList<L> {
    pub fn new(inner: L, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(None),
        }
    }

    fn cached(&self) -> Option<Vec<SocketAddr>> {
        let cache = self.cache.lock();
        let cached = cache.as_ref()?;
        let fresh = cached.fetched_at.elapsed() < self.ttl && !cached.servers.is_empty();
        fresh.then(|| cached.servers.clone())
    }
}

#[async_trait]
impl<L: ServerList> ServerList for CachedServerList<L> {
    fn fetch_servers(&self) -> BoxStream<'_, SocketAddr> {
        self.inner.fetch_servers()
    }

    async fn get_servers(&self) -> Vec<SocketAddr> {
        if let Some(servers) = self.cached() {
            return servers;
        }

        let mut servers: Vec<SocketAddr> = self.inner.fetch_servers().collect().await;
        servers.sort();
        servers.dedup();
        *self.cache.lock() = Some(CachedList {
            servers: servers.clone(),
            fetched_at: Instant::now(),
        });
        servers
    }
}
