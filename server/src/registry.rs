//! Directory of known game servers
//!
//! One `GameServer` per IP:port holds the latest info and status snapshots
//! with their fetch times, the server's admission queue and the players
//! attributed to it. Snapshots are replaced whole, never edited in place.

use crate::admission::AdmissionQueue;
use crate::config::QueueConfig;
use crate::query::{ProbeResponse, QueryService, ServerAddress};
use dashmap::DashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};
use shared::{GameServerInfo, GameServerStatus, PlayerId};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A snapshot together with the time it was fetched
#[derive(Debug, Clone)]
pub struct Timestamped<T> {
    pub value: T,
    pub fetched_at: Instant,
}

impl<T> Timestamped<T> {
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.fetched_at.elapsed() <= max_age
    }
}

pub struct GameServer {
    address: SocketAddr,
    name_hint: String,
    info: RwLock<Option<Timestamped<GameServerInfo>>>,
    status: RwLock<Option<Timestamped<GameServerStatus>>>,
    known_players: Mutex<HashSet<PlayerId>>,
    queue: Mutex<AdmissionQueue>,
    privileged_slots: AtomicU32,
}

impl GameServer {
    pub fn new(address: SocketAddr, name_hint: impl Into<String>, queue_config: QueueConfig) -> Self {
        Self {
            address,
            name_hint: name_hint.into(),
            info: RwLock::new(None),
            status: RwLock::new(None),
            known_players: Mutex::new(HashSet::new()),
            queue: Mutex::new(AdmissionQueue::new(queue_config, Instant::now())),
            privileged_slots: AtomicU32::new(0),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Hostname from the latest info, else the name it was registered with
    pub fn display_name(&self) -> String {
        match self.info.read().as_ref() {
            Some(info) if !info.value.hostname.is_empty() => info.value.hostname.clone(),
            _ => self.name_hint.clone(),
        }
    }

    pub fn info(&self) -> Option<GameServerInfo> {
        self.info.read().as_ref().map(|i| i.value.clone())
    }

    pub fn status(&self) -> Option<GameServerStatus> {
        self.status.read().as_ref().map(|s| s.value.clone())
    }

    pub fn info_fetched_at(&self) -> Option<Instant> {
        self.info.read().as_ref().map(|i| i.fetched_at)
    }

    pub fn queue(&self) -> &Mutex<AdmissionQueue> {
        &self.queue
    }

    pub fn joining_count(&self) -> u32 {
        self.queue.lock().joining_count()
    }

    /// Players held by the admission queue, waiting or joining
    pub fn queued_count(&self) -> u32 {
        self.queue.lock().len() as u32
    }

    pub fn privileged_slots(&self) -> u32 {
        self.privileged_slots.load(Ordering::Relaxed)
    }

    /// Reserves capacity matchmaking may not hand out. Clamped so joining
    /// players plus privileged slots never exceed the server's capacity;
    /// returns the value actually stored.
    pub fn set_privileged_slots(&self, slots: u32) -> u32 {
        let clamped = match self.info() {
            Some(info) => slots.min(info.max_clients.saturating_sub(self.joining_count())),
            None => slots,
        };
        self.privileged_slots.store(clamped, Ordering::Relaxed);
        clamped
    }

    /// How many players may be joining at once, None while capacity is
    /// unknown
    pub fn joinable_slots(&self) -> Option<u32> {
        self.info()
            .map(|info| info.free_slots().saturating_sub(self.privileged_slots()))
    }

    /// Free slots minus everything reserved, as matchmaking sees it
    pub fn available_slots(&self) -> u32 {
        let reserved = self.queued_count() + self.privileged_slots();
        self.info()
            .map(|info| info.free_slots().saturating_sub(reserved))
            .unwrap_or(0)
    }

    pub fn known_players(&self) -> Vec<PlayerId> {
        self.known_players.lock().iter().copied().collect()
    }

    pub fn has_player(&self, player: PlayerId) -> bool {
        self.known_players.lock().contains(&player)
    }

    pub fn add_player(&self, player: PlayerId) -> bool {
        self.known_players.lock().insert(player)
    }

    pub fn remove_player(&self, player: PlayerId) -> bool {
        self.known_players.lock().remove(&player)
    }

    fn player_capacity(&self) -> Option<usize> {
        self.info().map(|info| info.max_clients as usize)
    }
}

/// Snapshot types cached on a `GameServer`
pub trait Snapshot: ProbeResponse {
    fn slot(server: &GameServer) -> &RwLock<Option<Timestamped<Self>>>;
}

impl Snapshot for GameServerInfo {
    fn slot(server: &GameServer) -> &RwLock<Option<Timestamped<Self>>> {
        &server.info
    }
}

impl Snapshot for GameServerStatus {
    fn slot(server: &GameServer) -> &RwLock<Option<Timestamped<Self>>> {
        &server.status
    }
}

fn store<T: Snapshot>(server: &GameServer, value: T) {
    *T::slot(server).write() = Some(Timestamped {
        value,
        fetched_at: Instant::now(),
    });
}

fn cached<T: Snapshot>(server: &GameServer, max_age: Option<Duration>) -> Option<T> {
    let max_age = max_age?;
    T::slot(server)
        .read()
        .as_ref()
        .filter(|snapshot| snapshot.is_fresh(max_age))
        .map(|snapshot| snapshot.value.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshSource {
    /// Fresh enough already, not probed
    Cached,
    Fetched,
    /// Probe failed; whatever was cached before is untouched
    Failed,
}

/// One server of a bulk refresh
#[derive(Clone)]
pub struct Refreshed {
    pub server: Arc<GameServer>,
    pub source: RefreshSource,
}

impl Refreshed {
    pub fn responded(&self) -> bool {
        self.source != RefreshSource::Failed
    }
}

pub struct Registry {
    servers: DashMap<SocketAddr, Arc<GameServer>>,
    query: Arc<QueryService>,
    queue_config: QueueConfig,
}

impl Registry {
    pub fn new(query: Arc<QueryService>, queue_config: QueueConfig) -> Self {
        Self {
            servers: DashMap::new(),
            query,
            queue_config,
        }
    }

    pub fn query(&self) -> &Arc<QueryService> {
        &self.query
    }

    /// Returns the entry for `ip:port`, creating it on first reference
    pub fn get_or_create(&self, ip: IpAddr, port: u16, name_hint: &str) -> Arc<GameServer> {
        let address = SocketAddr::new(ip, port);
        let entry = self.servers.entry(address).or_insert_with(|| {
            debug!("Registering game server {}", address);
            Arc::new(GameServer::new(
                address,
                name_hint,
                self.queue_config.clone(),
            ))
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, address: SocketAddr) -> Option<Arc<GameServer>> {
        self.servers.get(&address).map(|entry| Arc::clone(entry.value()))
    }

    pub fn servers(&self) -> Vec<Arc<GameServer>> {
        self.servers.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Latest info. Without `max_age` the server is always probed; a failed
    /// probe leaves the cache alone and the last known snapshot is returned.
    pub async fn get_info(
        &self,
        server: &GameServer,
        max_age: Option<Duration>,
    ) -> Option<GameServerInfo> {
        self.fetch(server, max_age).await
    }

    pub async fn get_status(
        &self,
        server: &GameServer,
        max_age: Option<Duration>,
    ) -> Option<GameServerStatus> {
        self.fetch(server, max_age).await
    }

    async fn fetch<T: Snapshot>(&self, server: &GameServer, max_age: Option<Duration>) -> Option<T> {
        if let Some(value) = cached::<T>(server, max_age) {
            return Some(value);
        }

        let target = ServerAddress::from(server.address);
        match self.query.probe::<T>(&target, &CancellationToken::new()).await {
            Some(value) => {
                store(server, value.clone());
                Some(value)
            }
            None => {
                debug!("Serving last known snapshot of {}", server.address);
                T::slot(server).read().as_ref().map(|s| s.value.clone())
            }
        }
    }

    /// Refreshes many servers at once. Fresh cache entries are yielded
    /// first, probed servers follow as their responses arrive, and servers
    /// that do not answer are yielded too, so every input comes back once.
    pub fn refresh<T: Snapshot>(
        &self,
        servers: Vec<Arc<GameServer>>,
        max_age: Option<Duration>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<Refreshed> {
        let (refreshed_tx, refreshed_rx) = mpsc::unbounded_channel();

        let mut stale = Vec::new();
        for server in servers {
            if cached::<T>(&server, max_age).is_some() {
                let _ = refreshed_tx.send(Refreshed {
                    server,
                    source: RefreshSource::Cached,
                });
            } else {
                stale.push(server);
            }
        }
        if stale.is_empty() {
            return refreshed_rx;
        }

        let targets = stale.iter().map(|s| ServerAddress::from(s.address)).collect();
        let mut results = self.query.probe_many::<T>(targets, timeout, cancel);
        tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                let server = Arc::clone(&stale[result.index]);
                let source = match result.result {
                    Some(value) => {
                        store(&server, value);
                        RefreshSource::Fetched
                    }
                    None => RefreshSource::Failed,
                };
                let _ = refreshed_tx.send(Refreshed { server, source });
            }
        });
        refreshed_rx
    }

    /// Collects a bulk refresh
    pub async fn refresh_all<T: Snapshot>(
        &self,
        servers: Vec<Arc<GameServer>>,
        max_age: Option<Duration>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Vec<Refreshed> {
        let mut refreshed_rx = self.refresh::<T>(servers, max_age, timeout, cancel);
        let mut refreshed = Vec::new();
        while let Some(server) = refreshed_rx.recv().await {
            refreshed.push(server);
        }
        refreshed
    }

    /// Moves a player's attribution from one server to another. Both
    /// player sets are locked in address order; if the destination refuses
    /// the player (tracked as full) the source removal is undone.
    pub fn move_player(
        &self,
        player: PlayerId,
        from: Option<&GameServer>,
        to: &GameServer,
    ) -> bool {
        let Some(from) = from else {
            return try_admit(&mut to.known_players.lock(), to.player_capacity(), player);
        };
        if from.address == to.address {
            return to.has_player(player);
        }

        let (first, second) = if from.address < to.address {
            (from, to)
        } else {
            (to, from)
        };
        let mut first_players = first.known_players.lock();
        let mut second_players = second.known_players.lock();
        let (source, destination) = if from.address < to.address {
            (&mut *first_players, &mut *second_players)
        } else {
            (&mut *second_players, &mut *first_players)
        };

        let removed = source.remove(&player);
        if try_admit(destination, to.player_capacity(), player) {
            true
        } else {
            if removed {
                source.insert(player);
            }
            debug!("{} refused player {}, move rolled back", to.address, player);
            false
        }
    }

    /// Drops servers whose admission queue is empty and idle. Does nothing
    /// unless idle pruning is configured.
    pub fn prune_idle(&self) -> usize {
        if !self.queue_config.prune_idle_servers {
            return 0;
        }
        let now = Instant::now();
        let before = self.servers.len();
        self.servers.retain(|_, server| {
            let queue = server.queue.lock();
            !queue.is_idle(now)
        });
        let pruned = before - self.servers.len();
        if pruned > 0 {
            debug!("Pruned {} idle game servers", pruned);
        }
        pruned
    }
}

fn try_admit(players: &mut HashSet<PlayerId>, capacity: Option<usize>, player: PlayerId) -> bool {
    if players.contains(&player) {
        return true;
    }
    if capacity.is_some_and(|capacity| players.len() >= capacity) {
        return false;
    }
    players.insert(player);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;
    use crate::resolver::DnsResolver;
    use crate::responder::{QueryResponder, ServerSnapshot};
    use crate::transport::Transport;
    use shared::DequeueReason;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn registry(queue_config: QueueConfig) -> Registry {
        let transport = Transport::bind(local()).await.unwrap();
        let query = QueryService::new(
            transport,
            Arc::new(DnsResolver::default()),
            QueryConfig {
                request_timeout: Duration::from_millis(300),
                ..QueryConfig::default()
            },
        );
        Registry::new(query, queue_config)
    }

    fn info(address: SocketAddr, clients: u32, max_clients: u32) -> GameServerInfo {
        let body = format!(
            "\\hostname\\test\\clients\\{}\\sv_maxclients\\{}\\dedicated\\1\\sv_running\\1",
            clients, max_clients
        );
        GameServerInfo::parse(address, &body, 20).unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = registry(QueueConfig::default()).await;
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        let a = registry.get_or_create(ip, 28960, "alpha");
        let b = registry.get_or_create(ip, 28960, "other");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.display_name(), "alpha");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_cached_info_within_max_age() {
        let registry = registry(QueueConfig::default()).await;
        let server = registry.get_or_create("10.255.255.1".parse().unwrap(), 28960, "x");
        store(&server, info(server.address(), 3, 10));

        let cached = registry
            .get_info(&server, Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(cached.clients, 3);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_stale_snapshot() {
        let responder = QueryResponder::bind(local(), ServerSnapshot::default())
            .await
            .unwrap();
        responder.set_silent(true);
        let registry = registry(QueueConfig::default()).await;
        let addr = responder.local_addr();
        let server = registry.get_or_create(addr.ip(), addr.port(), "silent");
        store(&server, info(addr, 5, 10));
        let fetched_at = server.info_fetched_at();

        let info = registry.get_info(&server, None).await.unwrap();
        assert_eq!(info.clients, 5);
        assert_eq!(server.info_fetched_at(), fetched_at);
        assert_eq!(responder.probes_received(), 1);
    }

    #[tokio::test]
    async fn test_refresh_yields_every_server() {
        let live = QueryResponder::bind(local(), ServerSnapshot::default().with_players(2, 10))
            .await
            .unwrap();
        let silent = QueryResponder::bind(local(), ServerSnapshot::default())
            .await
            .unwrap();
        silent.set_silent(true);

        let registry = registry(QueueConfig::default()).await;
        let cached = registry.get_or_create("10.255.255.2".parse().unwrap(), 28960, "cached");
        store(&cached, info(cached.address(), 1, 10));
        let live_server =
            registry.get_or_create(live.local_addr().ip(), live.local_addr().port(), "live");
        let silent_server = registry.get_or_create(
            silent.local_addr().ip(),
            silent.local_addr().port(),
            "silent",
        );

        let refreshed = registry
            .refresh_all::<GameServerInfo>(
                vec![
                    Arc::clone(&cached),
                    Arc::clone(&live_server),
                    Arc::clone(&silent_server),
                ],
                Some(Duration::from_secs(60)),
                Duration::from_secs(2),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(refreshed.len(), 3);
        assert_eq!(refreshed[0].source, RefreshSource::Cached);
        let source_of = |addr: SocketAddr| {
            refreshed
                .iter()
                .find(|r| r.server.address() == addr)
                .map(|r| r.source)
        };
        assert_eq!(source_of(live_server.address()), Some(RefreshSource::Fetched));
        assert_eq!(source_of(silent_server.address()), Some(RefreshSource::Failed));
        assert_eq!(live_server.info().map(|i| i.clients), Some(2));
        assert!(silent_server.info().is_none());
    }

    #[tokio::test]
    async fn test_privileged_slots_are_clamped() {
        let registry = registry(QueueConfig::default()).await;
        let server = registry.get_or_create("10.0.0.3".parse().unwrap(), 28960, "x");
        assert_eq!(server.available_slots(), 0);

        store(&server, info(server.address(), 4, 10));
        assert_eq!(server.available_slots(), 6);
        assert_eq!(server.set_privileged_slots(2), 2);
        assert_eq!(server.available_slots(), 4);
        assert_eq!(server.joinable_slots(), Some(4));
        assert_eq!(server.set_privileged_slots(50), 10);
    }

    #[tokio::test]
    async fn test_queued_players_reserve_slots() {
        let registry = registry(QueueConfig::default()).await;
        let server = registry.get_or_create("10.0.0.4".parse().unwrap(), 28960, "x");
        store(&server, info(server.address(), 8, 10));

        server.queue().lock().enqueue(1, Instant::now()).unwrap();
        assert_eq!(server.queued_count(), 1);
        assert_eq!(server.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_move_player_between_servers() {
        let registry = registry(QueueConfig::default()).await;
        let a = registry.get_or_create("10.0.0.5".parse().unwrap(), 28960, "a");
        let b = registry.get_or_create("10.0.0.6".parse().unwrap(), 28960, "b");

        assert!(registry.move_player(1, None, &a));
        assert!(registry.move_player(1, Some(&*a), &b));
        assert!(!a.has_player(1));
        assert!(b.has_player(1));

        // Reverse direction takes the locks in the same order
        assert!(registry.move_player(1, Some(&*b), &a));
        assert_eq!(a.known_players(), vec![1]);
    }

    #[tokio::test]
    async fn test_move_player_rolls_back_when_destination_full() {
        let registry = registry(QueueConfig::default()).await;
        let a = registry.get_or_create("10.0.0.7".parse().unwrap(), 28960, "a");
        let full = registry.get_or_create("10.0.0.8".parse().unwrap(), 28960, "full");
        store(&full, info(full.address(), 1, 1));
        full.add_player(99);
        a.add_player(1);

        assert!(!registry.move_player(1, Some(&*a), &full));
        assert!(a.has_player(1));
        assert!(!full.has_player(1));
    }

    #[tokio::test]
    async fn test_prune_idle_only_when_enabled() {
        let disabled = registry(QueueConfig::default()).await;
        disabled.get_or_create("10.0.0.9".parse().unwrap(), 28960, "x");
        assert_eq!(disabled.prune_idle(), 0);
        assert_eq!(disabled.len(), 1);

        let enabled = registry(QueueConfig {
            prune_idle_servers: true,
            idle_timeout: Duration::ZERO,
            ..QueueConfig::default()
        })
        .await;
        let _idle = enabled.get_or_create("10.0.0.10".parse().unwrap(), 28960, "idle");
        let busy = enabled.get_or_create("10.0.0.11".parse().unwrap(), 28960, "busy");
        busy.queue().lock().enqueue(1, Instant::now()).unwrap();

        assert_eq!(enabled.prune_idle(), 1);
        assert!(enabled.get(busy.address()).is_some());

        let now = Instant::now();
        busy.queue().lock().remove(1, DequeueReason::UserLeave, now);
        assert_eq!(enabled.prune_idle(), 1);
        assert!(enabled.is_empty());
    }
}
