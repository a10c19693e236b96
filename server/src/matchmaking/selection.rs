//! Group selection for one matchmaking pass

use super::player::MMPlayer;
use super::scoring::{adjusted_quality, ServerView};
use shared::{Ineligibility, PlayerId, PossibleMatch};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// A group the pass decided to send to a server
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub server: SocketAddr,
    pub hostname: String,
    pub quality: f64,
    pub players: Vec<PlayerId>,
}

/// Outcome of a matchmaking pass
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Committed matches in the order they were picked
    pub matches: Vec<Candidate>,
    /// Hints for players left unmatched
    pub hints: HashMap<PlayerId, Vec<PossibleMatch>>,
}

impl Evaluation {
    pub fn matched(&self, player: PlayerId) -> Option<&Candidate> {
        self.matches.iter().find(|m| m.players.contains(&player))
    }
}

/// Size of the largest viable prefix of `thresholds`.
///
/// `thresholds` are the min-player wishes of the candidates in ascending
/// order. A prefix is viable when the players already on the server plus
/// the prefix satisfy the highest wish inside it and the prefix fits in
/// `available` slots.
pub fn best_prefix(thresholds: &[u32], joined: u32, available: u32) -> usize {
    let capacity = joined.saturating_add(available);
    let mut highest = 0;
    let mut best = 0;

    for (i, &threshold) in thresholds.iter().enumerate() {
        let size = i + 1;
        if size as u64 > available as u64 {
            break;
        }
        highest = highest.max(threshold);
        if highest > capacity {
            break;
        }
        if size as u64 + joined as u64 >= highest as u64 && size >= best {
            best = size;
        }
    }
    best
}

/// Runs selection rounds until no server can take another group.
///
/// Each round ranks servers by quality, builds the best group per server
/// from eligible players and commits the single best one. Committed players
/// leave the pool and occupy slots on their server for later rounds. Hints
/// come from the last round, so they only mention unmatched players.
pub fn evaluate(players: &[MMPlayer], mut servers: Vec<ServerView>, now: Instant) -> Evaluation {
    let mut pool: Vec<&MMPlayer> = players.iter().collect();
    pool.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.id.cmp(&b.id)));

    let mut matches = Vec::new();
    loop {
        servers.sort_by(|a, b| b.quality().total_cmp(&a.quality()));
        let round = scan(&pool, &servers, now);

        let Some(best) = round.best else {
            return Evaluation {
                matches,
                hints: round.hints,
            };
        };

        pool.retain(|p| !best.players.contains(&p.id));
        if let Some(view) = servers.iter_mut().find(|v| v.address == best.server) {
            view.reserved_slots += best.players.len() as u32;
        }
        matches.push(best);
    }
}

struct Round {
    best: Option<Candidate>,
    hints: HashMap<PlayerId, Vec<PossibleMatch>>,
}

fn scan(pool: &[&MMPlayer], servers: &[ServerView], now: Instant) -> Round {
    let mut best: Option<Candidate> = None;
    let mut hints: HashMap<PlayerId, Vec<PossibleMatch>> = HashMap::new();

    for server in servers {
        let available = server.available_slots();
        if available == 0 {
            continue;
        }

        let mut interested: Vec<&MMPlayer> = pool
            .iter()
            .copied()
            .filter(|p| p.prefers(server.address))
            .collect();
        interested.sort_by_key(|p| p.min_players());

        let mut eligible = Vec::new();
        let mut blocked = Vec::new();
        for player in interested {
            let reasons = player.ineligibility(server);
            if reasons.is_empty() {
                eligible.push(player);
            } else {
                blocked.push((player, reasons));
            }
        }

        let base = server.quality();
        if let Some(group) = select(&eligible, server, available) {
            let quality = adjusted_quality(base, server.address, &group, now);
            if best.as_ref().map_or(true, |b| quality > b.quality) {
                best = Some(Candidate {
                    server: server.address,
                    hostname: server.hostname.clone(),
                    quality,
                    players: group.iter().map(|p| p.id).collect(),
                });
            }
        }

        // Players held back only by the fresh-lobby rule can still form a
        // lobby together, so they count towards each other's hints
        let waiting: Vec<&MMPlayer> = blocked
            .iter()
            .filter(|(_, reasons)| only_waiting_for_players(reasons))
            .map(|(p, _)| *p)
            .collect();

        for (player, reasons) in &blocked {
            let mut hint_pool: Vec<&MMPlayer> = eligible
                .iter()
                .chain(waiting.iter())
                .copied()
                .filter(|p| p.id != player.id)
                .collect();
            hint_pool.push(player);
            hint_pool.sort_by_key(|p| p.min_players());

            let Some(group) = select(&hint_pool, server, available) else {
                continue;
            };
            if !group.iter().any(|p| p.id == player.id) {
                continue;
            }
            hints.entry(player.id).or_default().push(PossibleMatch {
                server: server.address,
                hostname: server.hostname.clone(),
                quality: adjusted_quality(base, server.address, &group, now),
                players: group.iter().map(|p| p.id).collect(),
                blocked_by: reasons.clone(),
            });
        }
    }

    Round { best, hints }
}

/// Best prefix of `sorted` (ascending min players) for `server`
fn select<'a>(
    sorted: &[&'a MMPlayer],
    server: &ServerView,
    available: u32,
) -> Option<Vec<&'a MMPlayer>> {
    let thresholds: Vec<u32> = sorted.iter().map(|p| p.min_players()).collect();
    let size = best_prefix(&thresholds, server.real_players, available);
    (size > 0).then(|| sorted[..size].to_vec())
}

fn only_waiting_for_players(reasons: &[Ineligibility]) -> bool {
    reasons
        .iter()
        .all(|r| matches!(r, Ineligibility::WaitingForPlayers { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{PreferredServer, SearchCriteria};

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{}:28960", last).parse().unwrap()
    }

    fn view(last: u8, real_players: u32, free_slots: u32, total_score: Option<i64>) -> ServerView {
        ServerView {
            address: addr(last),
            hostname: format!("server {}", last),
            real_players,
            free_slots,
            reserved_slots: 0,
            total_score,
        }
    }

    fn player(id: PlayerId, min_players: u32, servers: &[(u8, u32)], now: Instant) -> MMPlayer {
        let preferred: Vec<PreferredServer> = servers
            .iter()
            .map(|&(last, ping)| PreferredServer {
                address: addr(last),
                ping,
            })
            .collect();
        MMPlayer::new(
            id,
            SearchCriteria {
                min_players,
                max_ping: 100,
                ..SearchCriteria::default()
            },
            &preferred,
            now,
        )
    }

    #[test]
    fn test_best_prefix_respects_capacity_and_thresholds() {
        assert_eq!(best_prefix(&[2, 3, 3, 5], 0, 4), 3);
        assert_eq!(best_prefix(&[2, 3, 3, 5], 0, 10), 3);
        assert_eq!(best_prefix(&[2, 3, 3, 5], 2, 10), 4);
        assert_eq!(best_prefix(&[1], 0, 1), 1);
        assert_eq!(best_prefix(&[], 0, 10), 0);
    }

    #[test]
    fn test_best_prefix_aborts_on_unreachable_threshold() {
        // The 12 can never be met, and nothing after it is considered
        assert_eq!(best_prefix(&[1, 12, 12], 0, 10), 1);
        assert_eq!(best_prefix(&[12], 0, 10), 0);
    }

    #[test]
    fn test_no_slots_no_match() {
        assert_eq!(best_prefix(&[1, 1], 5, 0), 0);
    }

    #[test]
    fn test_picks_highest_quality_server() {
        let now = Instant::now();
        let mut players = vec![player(1, 1, &[(1, 40), (2, 40)], now)];
        players[0].attempts = 1;

        let servers = vec![view(1, 7, 5, Some(9000)), view(2, 0, 10, None)];
        let evaluation = evaluate(&players, servers, now);

        assert_eq!(evaluation.matches.len(), 1);
        assert_eq!(evaluation.matches[0].server, addr(2));
        assert_eq!(evaluation.matches[0].players, vec![1]);
        assert!(evaluation.hints.is_empty());
    }

    #[test]
    fn test_rounds_split_players_across_servers() {
        let now = Instant::now();
        let mut players: Vec<MMPlayer> = (1..=3)
            .map(|id| player(id, 1, &[(1, 40), (2, 40)], now))
            .collect();
        for p in &mut players {
            p.attempts = 1;
        }

        // Server 1 has room for two, server 2 takes the rest
        let servers = vec![view(1, 0, 2, None), view(2, 3, 10, Some(100))];
        let evaluation = evaluate(&players, servers, now);

        assert_eq!(evaluation.matches.len(), 2);
        assert_eq!(evaluation.matches[0].server, addr(1));
        assert_eq!(evaluation.matches[0].players, vec![1, 2]);
        assert_eq!(evaluation.matches[1].server, addr(2));
        assert_eq!(evaluation.matches[1].players, vec![3]);
        assert_eq!(evaluation.matched(3).map(|m| m.server), Some(addr(2)));
    }

    #[test]
    fn test_reserved_slots_limit_groups() {
        let now = Instant::now();
        let mut players: Vec<MMPlayer> = (1..=3).map(|id| player(id, 1, &[(1, 40)], now)).collect();
        for p in &mut players {
            p.attempts = 1;
        }

        let mut server = view(1, 2, 4, Some(100));
        server.reserved_slots = 3;
        let evaluation = evaluate(&players, vec![server], now);

        assert_eq!(evaluation.matches.len(), 1);
        assert_eq!(evaluation.matches[0].players, vec![1]);
    }

    #[test]
    fn test_hints_for_fresh_lobby() {
        let now = Instant::now();
        let players: Vec<MMPlayer> = (1..=3).map(|id| player(id, 2, &[(1, 40)], now)).collect();

        let evaluation = evaluate(&players, vec![view(1, 0, 10, None)], now);

        assert!(evaluation.matches.is_empty());
        for id in 1..=3 {
            let hints = &evaluation.hints[&id];
            assert_eq!(hints.len(), 1);
            assert_eq!(hints[0].server, addr(1));
            assert_eq!(hints[0].players.len(), 3);
            assert_eq!(
                hints[0].blocked_by,
                vec![Ineligibility::WaitingForPlayers {
                    current: 0,
                    required: 2,
                }]
            );
        }
    }

    #[test]
    fn test_ping_blocked_player_gets_hint_with_eligible_players() {
        let now = Instant::now();
        let mut players = vec![
            player(1, 1, &[(1, 40)], now),
            player(2, 1, &[(1, 40)], now),
            player(3, 1, &[(1, 150)], now),
        ];
        for p in &mut players {
            p.attempts = 1;
        }
        // Room for one only, so player 2 stays queued next to player 3
        let evaluation = evaluate(&players, vec![view(1, 4, 1, Some(100))], now);

        assert_eq!(evaluation.matches.len(), 1);
        assert_eq!(evaluation.matches[0].players, vec![1]);
        // The second round runs without slots left, so no hints are produced
        assert!(evaluation.hints.is_empty());

        let evaluation = evaluate(&players[1..], vec![view(1, 4, 2, Some(100))], now);
        assert_eq!(evaluation.matches[0].players, vec![2]);
        let hints = &evaluation.hints[&3];
        assert_eq!(hints[0].players, vec![3]);
        assert_eq!(
            hints[0].blocked_by,
            vec![Ineligibility::PingTooHigh { ping: 150, max: 100 }]
        );
    }
}
