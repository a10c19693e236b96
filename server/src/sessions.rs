//! Connected player sessions
//!
//! This module tracks the players talking to the daemon's control socket:
//! - Session lifecycle (hello, heartbeat, disconnect, timeout)
//! - Where each player stands in the matchmaking flow
//! - Address lookup for pushing events back to the player
//!
//! The store is an explicitly constructed object owned by the network
//! server; nothing about sessions lives in global state.

use log::info;
use shared::PlayerId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Where a player is in the matchmaking flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Matchmaking,
    /// Waiting in a server's admission queue
    Queued { server: SocketAddr },
    /// Told to connect to the server, acknowledgment pending
    Joining { server: SocketAddr },
    Joined { server: SocketAddr },
}

impl PlayerState {
    /// Server whose admission queue holds the player, if any
    pub fn queued_server(&self) -> Option<SocketAddr> {
        match *self {
            PlayerState::Queued { server } | PlayerState::Joining { server } => Some(server),
            _ => None,
        }
    }
}

/// A player connected to the control socket
#[derive(Debug)]
pub struct Session {
    /// Player identity announced in `Hello`
    pub id: PlayerId,
    pub name: String,
    /// Address events are sent to
    pub addr: SocketAddr,
    /// Last time any packet arrived from this player
    pub last_seen: Instant,
    pub state: PlayerState,
}

impl Session {
    pub fn new(id: PlayerId, name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            id,
            name: name.into(),
            addr,
            last_seen: Instant::now(),
            state: PlayerState::Idle,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Returns true if the player has been silent for longer than `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// All player sessions, bounded by a capacity limit
pub struct Sessions {
    sessions: HashMap<PlayerId, Session>,
    max_sessions: usize,
}

impl Sessions {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
        }
    }

    /// Returns the session for `id`, creating it when missing
    ///
    /// A known player reconnecting from a new address keeps its state and
    /// moves to the new address. Returns None when a new session would
    /// exceed the capacity limit.
    pub fn get_or_add(
        &mut self,
        id: PlayerId,
        name: &str,
        addr: SocketAddr,
    ) -> Option<&mut Session> {
        if !self.sessions.contains_key(&id) {
            if self.sessions.len() >= self.max_sessions {
                return None;
            }
            info!("Player {} ({}) connected from {}", id, name, addr);
            self.sessions.insert(id, Session::new(id, name, addr));
        }

        let session = self.sessions.get_mut(&id)?;
        if session.addr != addr {
            info!("Player {} moved from {} to {}", id, session.addr, addr);
            session.addr = addr;
        }
        session.name = name.to_string();
        session.touch();
        Some(session)
    }

    pub fn get(&self, id: PlayerId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: PlayerId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Finds the player sending from `addr`
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<PlayerId> {
        self.sessions
            .values()
            .find(|session| session.addr == addr)
            .map(|session| session.id)
    }

    pub fn addr_of(&self, id: PlayerId) -> Option<SocketAddr> {
        self.sessions.get(&id).map(|session| session.addr)
    }

    pub fn set_state(&mut self, id: PlayerId, state: PlayerState) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.state = state;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: PlayerId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        info!("Player {} disconnected", id);
        Some(session)
    }

    /// Removes and returns sessions silent for longer than `timeout`
    ///
    /// The caller is responsible for withdrawing the returned players from
    /// matchmaking and admission queues.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<Session> {
        let timed_out: Vec<PlayerId> = self
            .sessions
            .values()
            .filter(|session| session.is_timed_out(timeout))
            .map(|session| session.id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
