//! Protocol types shared by the matchmaking daemon, its player clients and
//! the game server query layer.

pub mod command;
pub mod info;
pub mod matchmaking;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use command::{strip_color_codes, CommandMessage, ProbeKind, ProtocolError, OOB_MARKER};
pub use info::{
    clamp_ping, parse_infostring, GameServerInfo, GameServerStatus, PlayerScore, MAX_PING_MS,
};
pub use matchmaking::{
    ClientEvent, DequeueReason, Ineligibility, JoinResult, MatchmakingError, PlayerId,
    PossibleMatch, PreferredServer, SearchCriteria,
};

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest control packet either side will read
pub const MAX_PACKET_SIZE: usize = 4096;

/// Control packets between player clients and the matchmaking daemon
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Hello {
        protocol_version: u32,
        player_id: PlayerId,
        name: String,
    },
    EnterMatchmaking {
        criteria: SearchCriteria,
        servers: Vec<PreferredServer>,
    },
    UpdatePreferences {
        criteria: SearchCriteria,
        servers: Vec<PreferredServer>,
    },
    LeaveMatchmaking,
    JoinAck {
        server: SocketAddr,
        result: JoinResult,
    },
    Heartbeat {
        timestamp: u64,
    },
    Disconnect,

    Welcome {
        player_id: PlayerId,
    },
    Rejected {
        reason: String,
    },
    Event(ClientEvent),
}

/// Milliseconds since the unix epoch
pub fn timestamp_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    millis.min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use bincode::{deserialize, serialize};

    #[test]
    fn test_enter_matchmaking_packet_survives_bincode() {
        let packet = Packet::EnterMatchmaking {
            criteria: SearchCriteria {
                min_players: 6,
                max_ping: 100,
                max_score: -1,
                max_players: 16,
            },
            servers: vec![PreferredServer {
                address: "10.0.0.1:28960".parse().unwrap(),
                ping: 40,
            }],
        };

        let bytes = serialize(&packet).unwrap();
        assert!(bytes.len() < MAX_PACKET_SIZE);
        assert_eq!(deserialize::<Packet>(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_event_packet_carries_hints() {
        let packet = Packet::Event(ClientEvent::SearchUpdate {
            attempts: 2,
            possible_matches: vec![PossibleMatch {
                server: "10.0.0.2:28960".parse().unwrap(),
                hostname: "hint".to_string(),
                quality: 1234.5,
                players: vec![1, 2, 3],
                blocked_by: vec![Ineligibility::WaitingForPlayers {
                    current: 0,
                    required: 2,
                }],
            }],
        });

        let decoded: Packet = deserialize(&serialize(&packet).unwrap()).unwrap();
        match decoded {
            Packet::Event(ClientEvent::SearchUpdate {
                attempts,
                possible_matches,
            }) => {
                assert_eq!(attempts, 2);
                assert_eq!(possible_matches[0].players, vec![1, 2, 3]);
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_timestamp_is_monotonic_enough() {
        let first = timestamp_ms();
        std::thread::sleep(Duration::from_millis(2));
        assert!(timestamp_ms() > first);
    }
}
