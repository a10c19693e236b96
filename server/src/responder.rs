//! Game-server side of the query protocol
//!
//! Answers `getinfo` and `getstatus` from a snapshot that can be changed at
//! runtime. Backs the `fake_game_server` binary and the integration suites.

use crate::error::Result;
use crate::transport::{Inbound, Subscription, Transport};
use log::{debug, info};
use parking_lot::RwLock;
use shared::{CommandMessage, PlayerScore, ProbeKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// What the simulated server reports about itself
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub hostname: String,
    pub map: String,
    pub game_type: String,
    pub max_clients: u32,
    pub bots: u32,
    pub players: Vec<PlayerScore>,
    pub is_private: bool,
}

impl Default for ServerSnapshot {
    fn default() -> Self {
        Self {
            hostname: "^2Fake ^7Server".to_string(),
            map: "mp_crash".to_string(),
            game_type: "war".to_string(),
            max_clients: 18,
            bots: 0,
            players: Vec::new(),
            is_private: false,
        }
    }
}

impl ServerSnapshot {
    /// Adds `count` human players with the given score each
    pub fn with_players(mut self, count: usize, score: i32) -> Self {
        self.players.extend((0..count).map(|i| PlayerScore {
            score,
            ping: 50,
            name: format!("player{}", i + 1),
        }));
        self
    }

    pub fn info_body(&self) -> String {
        format!(
            "\\hostname\\{}\\mapname\\{}\\gametype\\{}\\clients\\{}\\bots\\{}\\sv_maxclients\\{}\\pswrd\\{}\\dedicated\\1\\sv_running\\1",
            self.hostname,
            self.map,
            self.game_type,
            self.players.len() as u32 + self.bots,
            self.bots,
            self.max_clients,
            self.is_private as u8,
        )
    }

    pub fn status_body(&self) -> String {
        let mut body = format!(
            "\\sv_hostname\\{}\\mapname\\{}\\g_gametype\\{}\n",
            self.hostname, self.map, self.game_type
        );
        for player in &self.players {
            body.push_str(&format!(
                "{} {} \"{}\"\n",
                player.score, player.ping, player.name
            ));
        }
        body
    }
}

struct State {
    snapshot: RwLock<ServerSnapshot>,
    silent: AtomicBool,
    probes: AtomicUsize,
}

pub struct QueryResponder {
    transport: Arc<Transport>,
    state: Arc<State>,
    _subscriptions: Vec<Subscription>,
}

impl QueryResponder {
    pub async fn bind(addr: SocketAddr, snapshot: ServerSnapshot) -> Result<Self> {
        let transport = Transport::bind(addr).await?;
        let state = Arc::new(State {
            snapshot: RwLock::new(snapshot),
            silent: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
        });

        let subscriptions = [ProbeKind::Info, ProbeKind::Status]
            .into_iter()
            .map(|kind| {
                let state = Arc::clone(&state);
                let replies = Arc::downgrade(&transport);
                transport.on(kind.request_command(), move |inbound: &Inbound| {
                    state.probes.fetch_add(1, Ordering::Relaxed);
                    if state.silent.load(Ordering::Relaxed) {
                        return;
                    }
                    let Some(transport) = replies.upgrade() else {
                        return;
                    };
                    let body = match kind {
                        ProbeKind::Info => state.snapshot.read().info_body(),
                        ProbeKind::Status => state.snapshot.read().status_body(),
                    };
                    let reply = match kind {
                        ProbeKind::Info => CommandMessage::new("infoResponse", body, '\n'),
                        ProbeKind::Status => CommandMessage::new("statusResponse", body, '\n'),
                    };
                    match reply {
                        Ok(reply) => {
                            let _ = transport.try_send(inbound.from, &reply);
                        }
                        Err(e) => debug!("Could not build reply: {}", e),
                    }
                })
            })
            .collect();

        info!("Answering queries on {}", transport.local_addr());
        Ok(Self {
            transport,
            state,
            _subscriptions: subscriptions,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn set_snapshot(&self, snapshot: ServerSnapshot) {
        *self.state.snapshot.write() = snapshot;
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        self.state.snapshot.read().clone()
    }

    /// A silent server still counts probes but never answers
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::Relaxed);
    }

    /// Probes received so far, answered or not
    pub fn probes_received(&self) -> usize {
        self.state.probes.load(Ordering::Relaxed)
    }

    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
    }
}
