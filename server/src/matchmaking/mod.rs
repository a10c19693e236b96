//! Matchmaking engine
//!
//! This module turns the pool of searching players into server assignments:
//! - Players enter with search criteria and the servers they measured
//! - Every tick refreshes info and status of the servers players prefer
//! - Selection commits groups to servers, best quality first
//! - Matched players are handed to the server's admission queue
//! - Everyone left over gets a search update with possible matches
//!
//! The tick idles while nobody is searching.

pub mod player;
pub mod scoring;
pub mod selection;

pub use player::MMPlayer;
pub use scoring::{adjusted_quality, server_quality, ServerView};
pub use selection::{best_prefix, evaluate, Candidate, Evaluation};

use crate::admission::{Admission, QueueError};
use crate::config::MatchmakingConfig;
use crate::notify::Notifier;
use crate::registry::{GameServer, Registry};
use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::{
    ClientEvent, DequeueReason, GameServerInfo, GameServerStatus, MatchmakingError, PlayerId, PossibleMatch,
    PreferredServer, SearchCriteria,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Where a withdrawn player was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Withdrawal {
    Search,
    Queue(SocketAddr),
}

pub struct Matchmaker {
    players: Mutex<HashMap<PlayerId, MMPlayer>>,
    /// Held while matched players move from the pool into admission
    commit_lock: Mutex<()>,
    registry: Arc<Registry>,
    admission: Arc<Admission>,
    notifier: Arc<dyn Notifier>,
    config: MatchmakingConfig,
    wake: Notify,
}

impl Matchmaker {
    pub fn new(
        registry: Arc<Registry>,
        admission: Arc<Admission>,
        notifier: Arc<dyn Notifier>,
        config: MatchmakingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            players: Mutex::new(HashMap::new()),
            commit_lock: Mutex::new(()),
            registry,
            admission,
            notifier,
            config,
            wake: Notify::new(),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Starts a search. Fails when the player is already searching or
    /// already waiting to join a server.
    pub fn enter_matchmaking(
        &self,
        player: PlayerId,
        criteria: SearchCriteria,
        servers: &[PreferredServer],
    ) -> bool {
        if self.is_joining(player) {
            warn!("Player {} entered matchmaking while joining a server", player);
            self.notifier
                .notify(player, ClientEvent::Error(MatchmakingError::AlreadyJoining));
            return false;
        }

        let entered = {
            let mut players = self.players.lock();
            if players.contains_key(&player) {
                false
            } else {
                players.insert(player, MMPlayer::new(player, criteria, servers, Instant::now()));
                true
            }
        };
        if !entered {
            warn!("Player {} is already searching", player);
            self.notifier
                .notify(player, ClientEvent::Error(MatchmakingError::AlreadySearching));
            return false;
        }

        for server in servers {
            self.registry
                .get_or_create(server.address.ip(), server.address.port(), "");
        }
        info!(
            "Player {} searching on {} servers ({:?})",
            player,
            servers.len(),
            criteria
        );
        self.wake.notify_one();
        true
    }

    pub fn leave_matchmaking(&self, player: PlayerId) -> bool {
        let _commit = self.commit_lock.lock();
        let left = self.players.lock().remove(&player).is_some();
        if left {
            info!("Player {} left matchmaking", player);
        }
        left
    }

    /// Takes a departing player out of the search pool or, once matched, out
    /// of the admission queue holding it. `queued_at` is checked before the
    /// other queues. A player caught between match and admission is always
    /// found in one of the two.
    pub fn withdraw(
        &self,
        player: PlayerId,
        queued_at: Option<SocketAddr>,
        reason: DequeueReason,
    ) -> Option<Withdrawal> {
        let _commit = self.commit_lock.lock();
        if self.players.lock().remove(&player).is_some() {
            info!("Player {} left matchmaking", player);
            return Some(Withdrawal::Search);
        }

        let server = queued_at
            .and_then(|addr| self.registry.get(addr))
            .filter(|server| server.queue().lock().contains(player))
            .or_else(|| {
                self.registry
                    .servers()
                    .into_iter()
                    .find(|server| server.queue().lock().contains(player))
            })?;
        self.admission
            .remove(&server, player, reason)
            .then(|| Withdrawal::Queue(server.address()))
    }

    /// Replaces a searching player's criteria and pings. Wait time and
    /// attempts are kept.
    pub fn update_search_preferences(
        &self,
        player: PlayerId,
        criteria: SearchCriteria,
        servers: &[PreferredServer],
    ) -> bool {
        let updated = match self.players.lock().get_mut(&player) {
            Some(searching) => {
                searching.update_preferences(criteria, servers);
                true
            }
            None => false,
        };
        if !updated {
            self.notifier
                .notify(player, ClientEvent::Error(MatchmakingError::NotSearching));
            return false;
        }

        for server in servers {
            self.registry
                .get_or_create(server.address.ip(), server.address.port(), "");
        }
        debug!("Player {} updated search preferences", player);
        true
    }

    pub fn is_searching(&self, player: PlayerId) -> bool {
        self.players.lock().contains_key(&player)
    }

    pub fn searching(&self) -> usize {
        self.players.lock().len()
    }

    pub fn attempts_of(&self, player: PlayerId) -> Option<u32> {
        self.players.lock().get(&player).map(|p| p.attempts)
    }

    pub fn possible_matches(&self, player: PlayerId) -> Vec<PossibleMatch> {
        self.players
            .lock()
            .get(&player)
            .map(|p| p.possible_matches.clone())
            .unwrap_or_default()
    }

    fn is_joining(&self, player: PlayerId) -> bool {
        self.registry
            .servers()
            .iter()
            .any(|server| server.queue().lock().contains(player))
    }

    /// Ticks until `shutdown`, sleeping while nobody searches
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Matchmaking every {:?}", self.config.tick_interval);

        loop {
            if self.players.lock().is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.wake.notified() => continue,
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.tick() => {}
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
        }
        debug!("Matchmaking stopped");
    }

    /// One matchmaking pass
    pub async fn tick(&self) -> Evaluation {
        let snapshot: Vec<MMPlayer> = self.players.lock().values().cloned().collect();
        if snapshot.is_empty() {
            return Evaluation::default();
        }

        let addresses: HashSet<SocketAddr> = snapshot
            .iter()
            .flat_map(|p| p.pings.keys().copied())
            .collect();
        let servers: Vec<Arc<GameServer>> = addresses
            .iter()
            .map(|addr| self.registry.get_or_create(addr.ip(), addr.port(), ""))
            .collect();

        let cancel = CancellationToken::new();
        let timeout = self.config.probe_timeout;
        let (infos, statuses) = tokio::join!(
            self.registry.refresh_all::<GameServerInfo>(
                servers.clone(),
                None,
                timeout,
                cancel.clone()
            ),
            self.registry.refresh_all::<GameServerStatus>(
                servers.clone(),
                None,
                timeout,
                cancel.clone()
            ),
        );

        let status_ok: HashSet<SocketAddr> = statuses
            .iter()
            .filter(|r| r.responded())
            .map(|r| r.server.address())
            .collect();
        let views: Vec<ServerView> = infos
            .iter()
            .filter(|r| r.responded())
            .filter_map(|r| {
                let info = r.server.info()?;
                let status = status_ok
                    .contains(&r.server.address())
                    .then(|| r.server.status())
                    .flatten();
                let reserved = r.server.queued_count() + r.server.privileged_slots();
                Some(ServerView::new(&info, status.as_ref(), reserved))
            })
            .collect();
        debug!(
            "Tick: {} players, {}/{} servers responding",
            snapshot.len(),
            views.len(),
            servers.len()
        );

        let mut evaluation = evaluate(&snapshot, views, Instant::now());
        self.commit(&mut evaluation);
        self.report(&snapshot, &mut evaluation);
        evaluation
    }

    /// Hands committed groups to admission. Players that left while the
    /// tick was probing are dropped from their group.
    fn commit(&self, evaluation: &mut Evaluation) {
        let _commit = self.commit_lock.lock();
        for candidate in &mut evaluation.matches {
            let matched: Vec<MMPlayer> = {
                let mut players = self.players.lock();
                candidate
                    .players
                    .iter()
                    .filter_map(|id| players.remove(id))
                    .collect()
            };
            candidate.players = matched.iter().map(|p| p.id).collect();
            if matched.is_empty() {
                continue;
            }

            info!(
                "Matched {:?} to {} (quality {:.1})",
                candidate.players, candidate.server, candidate.quality
            );
            let Some(server) = self.registry.get(candidate.server) else {
                warn!("Matched server {} vanished from the registry", candidate.server);
                self.players
                    .lock()
                    .extend(matched.into_iter().map(|p| (p.id, p)));
                continue;
            };

            for player in matched {
                self.notifier.notify(
                    player.id,
                    ClientEvent::MatchFound {
                        server: candidate.server,
                        players: candidate.players.clone(),
                    },
                );
                if let Err(e) = self.admission.enqueue(&server, player.id) {
                    warn!(
                        "Could not queue player {} for {}: {}",
                        player.id, candidate.server, e
                    );
                    self.notifier
                        .notify(player.id, ClientEvent::Error(matchmaking_error(e)));
                    self.players.lock().insert(player.id, player);
                }
            }
        }
    }

    /// Bumps attempts of everyone still searching and sends the hints
    fn report(&self, snapshot: &[MMPlayer], evaluation: &mut Evaluation) {
        let mut updates = Vec::new();
        {
            let mut players = self.players.lock();
            for id in snapshot.iter().map(|p| p.id) {
                let Some(player) = players.get_mut(&id) else {
                    continue;
                };
                player.attempts += 1;
                player.possible_matches = evaluation.hints.remove(&id).unwrap_or_default();
                updates.push((id, player.attempts, player.possible_matches.clone()));
            }
        }

        for (id, attempts, possible_matches) in updates {
            self.notifier.notify(
                id,
                ClientEvent::SearchUpdate {
                    attempts,
                    possible_matches,
                },
            );
        }
    }
}

fn matchmaking_error(error: QueueError) -> MatchmakingError {
    match error {
        QueueError::QueueFull => MatchmakingError::QueueFull,
        QueueError::AlreadyQueued => MatchmakingError::AlreadyJoining,
        QueueError::NotQueued => MatchmakingError::NotSearching,
    }
}
