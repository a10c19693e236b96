//! Matchmaking values exchanged between the daemon and player clients

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub type PlayerId = u64;

/// What a player is willing to accept from a match
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchCriteria {
    /// Players (already on the server plus the matched group) needed before
    /// the player considers a match worth joining
    pub min_players: u32,
    /// Highest acceptable ping in milliseconds, zero or below for no limit
    pub max_ping: i32,
    /// Highest acceptable aggregate server score, negative for no limit
    pub max_score: i64,
    /// Highest acceptable number of players already on the server, negative
    /// for no limit
    pub max_players: i32,
}

impl Default for SearchCriteria {
    fn default() -> Self {
        Self {
            min_players: 1,
            max_ping: 0,
            max_score: -1,
            max_players: -1,
        }
    }
}

impl SearchCriteria {
    pub fn ping_limit(&self) -> Option<u32> {
        (self.max_ping > 0).then_some(self.max_ping as u32)
    }

    pub fn score_limit(&self) -> Option<i64> {
        (self.max_score >= 0).then_some(self.max_score)
    }

    pub fn player_limit(&self) -> Option<u32> {
        (self.max_players >= 0).then_some(self.max_players as u32)
    }
}

/// A server the player wants to play on, with the ping the player measured
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreferredServer {
    pub address: SocketAddr,
    pub ping: u32,
}

/// Why a player cannot be matched to a server yet
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligibility {
    NotPreferred,
    /// First search attempt and the server has fewer players than wanted
    WaitingForPlayers { current: u32, required: u32 },
    PingTooHigh { ping: u32, max: u32 },
    ScoreTooHigh { score: i64, max: i64 },
    TooManyPlayers { current: u32, max: u32 },
}

/// A match the player could be part of, sent as a search hint
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PossibleMatch {
    pub server: SocketAddr,
    pub hostname: String,
    pub quality: f64,
    pub players: Vec<PlayerId>,
    /// Reasons the receiving player is not matched right away
    pub blocked_by: Vec<Ineligibility>,
}

/// Why a player left a server's admission queue
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DequeueReason {
    Unknown,
    Joined,
    UserLeave,
    Disconnect,
    JoinFailed,
    JoinTimeout,
    MaxJoinAttemptsReached,
}

/// Outcome of a join attempt as reported by the player's game client
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinResult {
    Joined,
    /// Connection failed; `server_full` is set when the server refused the
    /// player for lack of slots
    Failed { server_full: bool },
    /// The server refused the player for good (banned, wrong password)
    Rejected,
}

/// Errors surfaced to a player's client instead of raw network failures
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchmakingError {
    AlreadySearching,
    NotSearching,
    AlreadyJoining,
    QueueFull,
    UnknownSession,
}

/// Events pushed to a single player
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ClientEvent {
    SearchUpdate {
        attempts: u32,
        possible_matches: Vec<PossibleMatch>,
    },
    MatchFound {
        server: SocketAddr,
        players: Vec<PlayerId>,
    },
    QueuePosition {
        server: SocketAddr,
        position: usize,
        queue_len: usize,
    },
    JoinServer {
        server: SocketAddr,
        attempt: u32,
        timeout_ms: u64,
    },
    Dequeued {
        server: SocketAddr,
        reason: DequeueReason,
    },
    Error(MatchmakingError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_criteria_has_no_limits() {
        let criteria = SearchCriteria::default();
        assert_eq!(criteria.ping_limit(), None);
        assert_eq!(criteria.score_limit(), None);
        assert_eq!(criteria.player_limit(), None);
    }

    #[test]
    fn test_limits() {
        let criteria = SearchCriteria {
            min_players: 4,
            max_ping: 80,
            max_score: 0,
            max_players: 0,
        };
        assert_eq!(criteria.ping_limit(), Some(80));
        assert_eq!(criteria.score_limit(), Some(0));
        assert_eq!(criteria.player_limit(), Some(0));
    }
}
