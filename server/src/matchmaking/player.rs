//! Players waiting for a match

use super::scoring::ServerView;
use shared::{Ineligibility, PlayerId, PossibleMatch, PreferredServer, SearchCriteria};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct MMPlayer {
    pub id: PlayerId,
    pub criteria: SearchCriteria,
    /// Preferred servers and the ping the player measured to each
    pub pings: HashMap<SocketAddr, u32>,
    pub joined_at: Instant,
    /// Completed search ticks without a match
    pub attempts: u32,
    /// Hints computed on the last tick
    pub possible_matches: Vec<PossibleMatch>,
}

impl MMPlayer {
    pub fn new(
        id: PlayerId,
        criteria: SearchCriteria,
        servers: &[PreferredServer],
        now: Instant,
    ) -> Self {
        Self {
            id,
            criteria,
            pings: servers.iter().map(|s| (s.address, s.ping)).collect(),
            joined_at: now,
            attempts: 0,
            possible_matches: Vec::new(),
        }
    }

    /// Replaces criteria and preferred servers; wait time and attempts carry
    /// over
    pub fn update_preferences(&mut self, criteria: SearchCriteria, servers: &[PreferredServer]) {
        self.criteria = criteria;
        self.pings = servers.iter().map(|s| (s.address, s.ping)).collect();
    }

    pub fn prefers(&self, server: SocketAddr) -> bool {
        self.pings.contains_key(&server)
    }

    pub fn ping_to(&self, server: SocketAddr) -> Option<u32> {
        self.pings.get(&server).copied()
    }

    pub fn wait_secs(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.joined_at).as_secs_f64()
    }

    pub fn min_players(&self) -> u32 {
        self.criteria.min_players
    }

    /// Everything that keeps the player off `server` right now; empty when
    /// eligible
    pub fn ineligibility(&self, server: &ServerView) -> Vec<Ineligibility> {
        let Some(ping) = self.ping_to(server.address) else {
            return vec![Ineligibility::NotPreferred];
        };

        let mut reasons = Vec::new();
        // Fresh searches hold out for a lobby that already has enough players
        if self.attempts == 0 && server.real_players < self.criteria.min_players {
            reasons.push(Ineligibility::WaitingForPlayers {
                current: server.real_players,
                required: self.criteria.min_players,
            });
        }
        if let (Some(max), Some(score)) = (self.criteria.score_limit(), server.total_score) {
            if score > max {
                reasons.push(Ineligibility::ScoreTooHigh { score, max });
            }
        }
        if let Some(max) = self.criteria.player_limit() {
            if server.real_players > max {
                reasons.push(Ineligibility::TooManyPlayers {
                    current: server.real_players,
                    max,
                });
            }
        }
        if let Some(max) = self.criteria.ping_limit() {
            if ping >= max {
                reasons.push(Ineligibility::PingTooHigh { ping, max });
            }
        }
        reasons
    }

    pub fn is_eligible(&self, server: &ServerView) -> bool {
        self.ineligibility(server).is_empty()
    }
}
