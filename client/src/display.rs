//! Text rendering of server listings and matchmaking events

use shared::{
    strip_color_codes, ClientEvent, DequeueReason, GameServerInfo, GameServerStatus,
    Ineligibility, MatchmakingError, PossibleMatch,
};

/// One line of the server browser
pub fn server_row(info: &GameServerInfo, status: Option<&GameServerStatus>) -> String {
    let score = status.map_or_else(|| "?".to_string(), |s| s.total_score.to_string());
    format!(
        "{:<22} {:<32} {:<14} {:<6} {:>2}/{:<2} ({} bots) score {:>6} {:>4}ms{}",
        info.address.to_string(),
        truncate(&strip_color_codes(&info.hostname), 32),
        truncate(&info.map, 14),
        truncate(&info.game_type, 6),
        info.clients,
        info.max_clients,
        info.bots,
        score,
        info.ping,
        if info.is_private { " [private]" } else { "" },
    )
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        text.chars().take(width.saturating_sub(1)).chain(['…']).collect()
    }
}

pub fn ineligibility(reason: &Ineligibility) -> String {
    match *reason {
        Ineligibility::NotPreferred => "server not in your list".to_string(),
        Ineligibility::WaitingForPlayers { current, required } => {
            format!("waiting for players ({}/{})", current, required)
        }
        Ineligibility::PingTooHigh { ping, max } => format!("ping {}ms over {}ms", ping, max),
        Ineligibility::ScoreTooHigh { score, max } => format!("score {} over {}", score, max),
        Ineligibility::TooManyPlayers { current, max } => {
            format!("{} players, you allow {}", current, max)
        }
    }
}

fn possible_match(candidate: &PossibleMatch) -> String {
    let reasons: Vec<String> = candidate.blocked_by.iter().map(ineligibility).collect();
    format!(
        "  {} ({}) with {} players, quality {:.0}: {}",
        strip_color_codes(&candidate.hostname),
        candidate.server,
        candidate.players.len(),
        candidate.quality,
        reasons.join(", ")
    )
}

pub fn dequeue_reason(reason: DequeueReason) -> &'static str {
    match reason {
        DequeueReason::Joined => "joined",
        DequeueReason::UserLeave => "left the queue",
        DequeueReason::Disconnect => "disconnected",
        DequeueReason::JoinFailed => "the server refused the connection",
        DequeueReason::JoinTimeout => "joining took too long",
        DequeueReason::MaxJoinAttemptsReached => "too many failed join attempts",
        DequeueReason::Unknown => "unknown reason",
    }
}

pub fn matchmaking_error(error: MatchmakingError) -> &'static str {
    match error {
        MatchmakingError::AlreadySearching => "already searching",
        MatchmakingError::NotSearching => "not searching",
        MatchmakingError::AlreadyJoining => "already joining a server",
        MatchmakingError::QueueFull => "the server's queue is full",
        MatchmakingError::UnknownSession => "not connected to the matchmaker",
    }
}

/// Multi-line description of an event for the terminal
pub fn event(event: &ClientEvent) -> String {
    match event {
        ClientEvent::SearchUpdate {
            attempts,
            possible_matches,
        } => {
            let mut text = format!("Searching (attempt {})", attempts);
            if possible_matches.is_empty() {
                text.push_str(", no possible matches yet");
            }
            for candidate in possible_matches {
                text.push('\n');
                text.push_str(&possible_match(candidate));
            }
            text
        }
        ClientEvent::MatchFound { server, players } => {
            format!("Match found on {} with {} players", server, players.len())
        }
        ClientEvent::QueuePosition {
            server,
            position,
            queue_len,
        } => format!("Queued for {}: position {} of {}", server, position, queue_len),
        ClientEvent::JoinServer {
            server,
            attempt,
            timeout_ms,
        } => format!(
            "Join {} now (attempt {}, {}s to connect)",
            server,
            attempt,
            timeout_ms / 1000
        ),
        ClientEvent::Dequeued { server, reason } => {
            format!("Left queue of {}: {}", server, dequeue_reason(*reason))
        }
        ClientEvent::Error(error) => format!("Matchmaking error: {}", matchmaking_error(*error)),
    }
}
