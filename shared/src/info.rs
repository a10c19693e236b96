//! Parsing of `getinfo` / `getstatus` response bodies

use crate::command::ProtocolError;
use regex::Regex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::OnceLock;

/// Highest ping ever reported, anything slower is clamped to this value
pub const MAX_PING_MS: u32 = 999;

/// Play mode reported when a server does not advertise one
pub const UNKNOWN_PLAY_MODE: &str = "Unknown";

/// Clamps a measured round trip to the display range
pub fn clamp_ping(ms: u128) -> u32 {
    ms.min(MAX_PING_MS as u128) as u32
}

/// Splits a backslash infostring into a map with lower-cased keys.
///
/// The usual layout alternates keys and values (`\key\value\key\value`);
/// a trailing key without a value maps to an empty string. Some servers
/// instead put key and value into one segment (`\key value\key value`),
/// which is assumed whenever a key position holds whitespace.
pub fn parse_infostring(body: &str) -> HashMap<String, String> {
    let body = body.trim_matches(|c: char| c == '\n' || c == '\r' || c == '\0');
    let body = body.strip_prefix('\\').unwrap_or(body);
    let segments: Vec<&str> = body.split('\\').collect();

    let alternating = segments
        .iter()
        .step_by(2)
        .all(|key| !key.contains(char::is_whitespace));
    let pairs: Vec<(&str, &str)> = if alternating {
        segments
            .chunks(2)
            .map(|pair| (pair[0], pair.get(1).copied().unwrap_or("")))
            .collect()
    } else {
        segments
            .iter()
            .map(|segment| {
                let segment = segment.trim_start();
                match segment.split_once(char::is_whitespace) {
                    Some((key, value)) => (key, value.trim_start()),
                    None => (segment, ""),
                }
            })
            .collect()
    };

    pairs
        .into_iter()
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_ascii_lowercase(), value.to_string()))
        .collect()
}

/// Snapshot of an `infoResponse`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameServerInfo {
    pub address: SocketAddr,
    pub hostname: String,
    pub map: String,
    pub game_type: String,
    pub mod_name: String,
    pub play_mode: String,
    pub clients: u32,
    pub bots: u32,
    pub max_clients: u32,
    /// Round trip of the probe in milliseconds, clamped to `MAX_PING_MS`
    pub ping: u32,
    pub is_private: bool,
}

impl GameServerInfo {
    /// Parses the body of an info response. Responses from listen servers or
    /// servers that are not running a map are rejected; any other missing
    /// field falls back to its default.
    pub fn parse(address: SocketAddr, body: &str, ping: u32) -> Result<Self, ProtocolError> {
        let fields = parse_infostring(body);

        if fields.get("dedicated").map(String::as_str) != Some("1") {
            return Err(ProtocolError::InvalidInfo("not a dedicated server"));
        }
        if fields.get("sv_running").map(String::as_str) != Some("1") {
            return Err(ProtocolError::InvalidInfo("server is not running"));
        }

        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| fields.get(*k))
                .cloned()
                .unwrap_or_default()
        };
        let count = |key: &str| {
            fields
                .get(key)
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(0)
        };
        let flag = |keys: &[&str]| {
            keys.iter()
                .filter_map(|k| fields.get(*k))
                .any(|v| v.trim() == "1")
        };

        let play_mode = fields
            .get("playmode")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| UNKNOWN_PLAY_MODE.to_string());

        Ok(Self {
            address,
            hostname: text(&["hostname", "sv_hostname"]),
            map: text(&["mapname"]),
            game_type: text(&["gametype", "g_gametype"]),
            mod_name: text(&["fs_game", "game"]),
            play_mode,
            clients: count("clients"),
            bots: count("bots"),
            max_clients: count("sv_maxclients"),
            ping: ping.min(MAX_PING_MS),
            is_private: flag(&["pswrd", "needpass", "g_needpass"]),
        })
    }

    /// Human players currently on the server
    pub fn real_players(&self) -> u32 {
        self.clients.saturating_sub(self.bots)
    }

    /// Slots not taken by any client
    pub fn free_slots(&self) -> u32 {
        self.max_clients.saturating_sub(self.clients)
    }
}

/// One scoreboard line of a status response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerScore {
    pub score: i32,
    pub ping: u32,
    pub name: String,
}

/// Snapshot of a `statusResponse`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameServerStatus {
    pub address: SocketAddr,
    pub players: Vec<PlayerScore>,
    pub total_score: i64,
}

fn player_line() -> Option<&'static Regex> {
    static LINE: OnceLock<Option<Regex>> = OnceLock::new();
    LINE.get_or_init(|| Regex::new(r#"^\s*(-?\d+)\s+(\d+)\s+"(.*)"\s*$"#).ok())
        .as_ref()
}

impl GameServerStatus {
    /// Parses a status body. The first line carries server cvars and is
    /// skipped; scoreboard lines that do not match `score ping "name"` are
    /// ignored.
    pub fn parse(address: SocketAddr, body: &str) -> Self {
        let players: Vec<PlayerScore> = body
            .lines()
            .skip(1)
            .filter_map(|line| {
                let caps = player_line()?.captures(line)?;
                Some(PlayerScore {
                    score: caps[1].parse().ok()?,
                    ping: caps[2].parse().ok()?,
                    name: caps[3].to_string(),
                })
            })
            .collect();

        let total_score = players.iter().map(|p| p.score as i64).sum();

        Self {
            address,
            players,
            total_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "10.0.0.1:28960".parse().unwrap()
    }

    const INFO_BODY: &str = "\\hostname\\^1Rust ^7Arena\\mapname\\mp_crash\\gametype\\war\\fs_game\\mods/pml\\clients\\7\\bots\\2\\sv_maxclients\\18\\dedicated\\1\\sv_running\\1\\pswrd\\0\\playmode\\Hardcore";

    #[test]
    fn test_parse_infostring() {
        let map = parse_infostring("\\Key\\Value\\other\\\\last");
        assert_eq!(map.get("key").map(String::as_str), Some("Value"));
        assert_eq!(map.get("other").map(String::as_str), Some(""));
        assert_eq!(map.get("last").map(String::as_str), Some(""));
    }

    #[test]
    fn test_parse_spaced_infostring() {
        let map = parse_infostring("\\hostname My Server\\Clients 7\\sv_running 1\\flag\n");
        assert_eq!(map.get("hostname").map(String::as_str), Some("My Server"));
        assert_eq!(map.get("clients").map(String::as_str), Some("7"));
        assert_eq!(map.get("sv_running").map(String::as_str), Some("1"));
        assert_eq!(map.get("flag").map(String::as_str), Some(""));

        // Spaces inside values keep the alternating layout
        let map = parse_infostring("\\hostname\\My Server\\clients\\7");
        assert_eq!(map.get("hostname").map(String::as_str), Some("My Server"));
        assert_eq!(map.get("clients").map(String::as_str), Some("7"));
    }

    #[test]
    fn test_parse_info_spaced_layout() {
        let body = "\\hostname Spaced\\clients 3\\bots 1\\sv_maxclients 12\\dedicated 1\\sv_running 1";
        let info = GameServerInfo::parse(addr(), body, 20).unwrap();
        assert_eq!(info.hostname, "Spaced");
        assert_eq!(info.real_players(), 2);
        assert_eq!(info.free_slots(), 9);
    }

    #[test]
    fn test_parse_info() {
        let info = GameServerInfo::parse(addr(), INFO_BODY, 42).unwrap();

        assert_eq!(info.address, addr());
        assert_eq!(info.hostname, "^1Rust ^7Arena");
        assert_eq!(info.map, "mp_crash");
        assert_eq!(info.game_type, "war");
        assert_eq!(info.mod_name, "mods/pml");
        assert_eq!(info.play_mode, "Hardcore");
        assert_eq!(info.clients, 7);
        assert_eq!(info.bots, 2);
        assert_eq!(info.max_clients, 18);
        assert_eq!(info.real_players(), 5);
        assert_eq!(info.free_slots(), 11);
        assert_eq!(info.ping, 42);
        assert!(!info.is_private);
    }

    #[test]
    fn test_parse_info_defaults() {
        let info =
            GameServerInfo::parse(addr(), "\\dedicated\\1\\sv_running\\1\\clients\\x", 5000)
                .unwrap();

        assert_eq!(info.hostname, "");
        assert_eq!(info.clients, 0);
        assert_eq!(info.max_clients, 0);
        assert_eq!(info.play_mode, UNKNOWN_PLAY_MODE);
        assert_eq!(info.ping, MAX_PING_MS);
    }

    #[test]
    fn test_parse_info_rejects_listen_and_idle_servers() {
        assert!(matches!(
            GameServerInfo::parse(addr(), "\\dedicated\\0\\sv_running\\1", 1),
            Err(ProtocolError::InvalidInfo(_))
        ));
        assert!(matches!(
            GameServerInfo::parse(addr(), "\\dedicated\\1", 1),
            Err(ProtocolError::InvalidInfo(_))
        ));
    }

    #[test]
    fn test_private_flag() {
        let info = GameServerInfo::parse(
            addr(),
            "\\dedicated\\1\\sv_running\\1\\needpass\\1",
            1,
        )
        .unwrap();
        assert!(info.is_private);
    }

    #[test]
    fn test_clamp_ping() {
        assert_eq!(clamp_ping(12), 12);
        assert_eq!(clamp_ping(999), 999);
        assert_eq!(clamp_ping(123_456), MAX_PING_MS);
    }

    #[test]
    fn test_parse_status() {
        let body = "\\sv_hostname\\test\\g_gametype\\war\n10 48 \"alpha\"\n-3 0 \"bot one\"\ngarbage line\n25 999 \"^2gamma\"\n";
        let status = GameServerStatus::parse(addr(), body);

        assert_eq!(status.players.len(), 3);
        assert_eq!(status.players[1].name, "bot one");
        assert_eq!(status.players[1].score, -3);
        assert_eq!(status.players[2].ping, 999);
        assert_eq!(status.total_score, 32);
    }

    #[test]
    fn test_parse_status_header_only() {
        let status = GameServerStatus::parse(addr(), "\\sv_hostname\\empty\n");
        assert!(status.players.is_empty());
        assert_eq!(status.total_score, 0);
    }
}
