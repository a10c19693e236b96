//! Server quality scoring

use super::player::MMPlayer;
use shared::{GameServerInfo, GameServerStatus, MAX_PING_MS};
use std::net::SocketAddr;
use std::time::Instant;

pub const BASE_QUALITY: f64 = 1000.0;
pub const EMPTY_SERVER_BONUS: f64 = 1000.0;
pub const HALF_FULL_BONUS: f64 = 3000.0;
/// A server counts as half full below this aggregate score...
pub const HALF_FULL_MAX_SCORE: i64 = 3000;
/// ...and below this many real players
pub const HALF_FULL_MAX_PLAYERS: u32 = 6;
pub const SCORE_PENALTY_DIVISOR: f64 = 300.0;
pub const MAX_SCORE_PENALTY: f64 = 600.0;
/// Aggregate score assumed when a server's status is unknown
pub const UNKNOWN_SCORE: i64 = 10_000;

pub const PLAYER_COUNT_WEIGHT: f64 = 15.0;
pub const WAIT_TIME_WEIGHT: f64 = 40.0;
pub const PING_DEVIATION_WEIGHT: f64 = 15.0;

/// Quality of a server before any players are considered.
///
/// Empty servers score `BASE + HALF_FULL_BONUS + EMPTY_SERVER_BONUS`, which
/// beats the best possible non-empty server (`BASE + HALF_FULL_BONUS`).
pub fn server_quality(real_players: u32, total_score: Option<i64>) -> f64 {
    if real_players == 0 {
        return BASE_QUALITY + HALF_FULL_BONUS + EMPTY_SERVER_BONUS;
    }

    let score = total_score.unwrap_or(UNKNOWN_SCORE);
    let mut quality = BASE_QUALITY;
    if score < HALF_FULL_MAX_SCORE && real_players < HALF_FULL_MAX_PLAYERS {
        quality += HALF_FULL_BONUS;
    }
    let penalty = (score.max(0) as f64 / SCORE_PENALTY_DIVISOR).min(MAX_SCORE_PENALTY);
    quality - penalty
}

/// Quality of a concrete match: rewards bigger groups and players that
/// waited long, penalises pings close to (or over) each player's limit
pub fn adjusted_quality(
    base: f64,
    server: SocketAddr,
    players: &[&MMPlayer],
    now: Instant,
) -> f64 {
    if players.is_empty() {
        return base;
    }

    let count = players.len() as f64;
    let avg_wait = players.iter().map(|p| p.wait_secs(now)).sum::<f64>() / count;
    let avg_deviation = players
        .iter()
        .map(|p| {
            let ping = p.ping_to(server).unwrap_or(MAX_PING_MS) as f64;
            let limit = p.criteria.ping_limit().unwrap_or(MAX_PING_MS) as f64;
            ping - limit
        })
        .sum::<f64>()
        / count;

    base + PLAYER_COUNT_WEIGHT * count + WAIT_TIME_WEIGHT * avg_wait
        - PING_DEVIATION_WEIGHT * avg_deviation
}

/// What one matchmaking pass knows about a responding server
#[derive(Debug, Clone)]
pub struct ServerView {
    pub address: SocketAddr,
    pub hostname: String,
    pub real_players: u32,
    pub free_slots: u32,
    /// Queued players plus privileged slots
    pub reserved_slots: u32,
    /// None when the status probe failed
    pub total_score: Option<i64>,
}

impl ServerView {
    pub fn new(
        info: &GameServerInfo,
        status: Option<&GameServerStatus>,
        reserved_slots: u32,
    ) -> Self {
        Self {
            address: info.address,
            hostname: info.hostname.clone(),
            real_players: info.real_players(),
            free_slots: info.free_slots(),
            reserved_slots,
            total_score: status.map(|s| s.total_score),
        }
    }

    pub fn available_slots(&self) -> u32 {
        self.free_slots.saturating_sub(self.reserved_slots)
    }

    pub fn quality(&self) -> f64 {
        server_quality(self.real_players, self.total_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::{PreferredServer, SearchCriteria};
    use std::time::Duration;

    fn server() -> SocketAddr {
        "10.0.0.1:28960".parse().unwrap()
    }

    #[test]
    fn test_empty_server_dominates() {
        let empty = server_quality(0, Some(1_000_000));
        for players in 1..64 {
            for score in [-100, 0, 1, 500, 2999, 3000, 10_000, 1_000_000] {
                assert!(empty > server_quality(players, Some(score)));
            }
            assert!(empty > server_quality(players, None));
        }
    }

    #[test]
    fn test_half_full_bonus_and_penalty() {
        assert_approx_eq!(server_quality(4, Some(600)), 1000.0 + 3000.0 - 2.0);
        assert_approx_eq!(server_quality(6, Some(600)), 1000.0 - 2.0);
        assert_approx_eq!(server_quality(4, Some(3000)), 1000.0 - 10.0);
    }

    #[test]
    fn test_penalty_is_capped() {
        assert_approx_eq!(server_quality(10, Some(1_000_000)), 1000.0 - 600.0);
    }

    #[test]
    fn test_unknown_score_is_conservative() {
        assert_approx_eq!(server_quality(3, None), 1000.0 - 10_000.0 / 300.0);
        assert!(server_quality(3, None) < server_quality(3, Some(0)));
    }

    #[test]
    fn test_adjusted_quality() {
        let start = Instant::now();
        let criteria = SearchCriteria {
            max_ping: 100,
            ..SearchCriteria::default()
        };
        let servers = [PreferredServer {
            address: server(),
            ping: 40,
        }];
        let a = MMPlayer::new(1, criteria, &servers, start);
        let b = MMPlayer::new(2, criteria, &servers, start);
        let now = start + Duration::from_secs(10);

        // +15 per player, +40 per second waited, -15 per ms of deviation
        let quality = adjusted_quality(2000.0, server(), &[&a, &b], now);
        assert_approx_eq!(quality, 2000.0 + 30.0 + 400.0 + 15.0 * 60.0, 1e-6);
    }
}
