//! Per-server join admission
//!
//! Matched players wait in a server's queue until a joining slot frees up,
//! are told to connect, and must acknowledge the outcome within the
//! per-attempt timeout. Failed or silent attempts are retried until the
//! attempt limit or the total join budget runs out.
//!
//! `AdmissionQueue` is the synchronous state machine and takes the current
//! time as a parameter. `Admission` drives one background task per busy
//! server and reports every change through the notifier.

use crate::config::QueueConfig;
use crate::notify::Notifier;
use crate::registry::GameServer;
use log::{debug, info, warn};
use shared::{ClientEvent, DequeueReason, JoinResult, PlayerId};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("admission queue is full")]
    QueueFull,
    #[error("player is already queued")]
    AlreadyQueued,
    #[error("player is not queued")]
    NotQueued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Waiting,
    Joining,
}

#[derive(Debug)]
struct Entry {
    player: PlayerId,
    state: EntryState,
    /// Join instructions issued so far (the reset-on-full rule may zero it)
    attempts: u32,
    /// Start of the first attempt, for the total join budget
    first_attempt_at: Option<Instant>,
    attempt_started_at: Option<Instant>,
    reported_position: Option<usize>,
}

/// Changes the queue wants its players to hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Position {
        player: PlayerId,
        position: usize,
        queue_len: usize,
    },
    Join {
        player: PlayerId,
        attempt: u32,
    },
    Dequeued {
        player: PlayerId,
        reason: DequeueReason,
    },
}

impl QueueEvent {
    pub fn player(&self) -> PlayerId {
        match self {
            QueueEvent::Position { player, .. }
            | QueueEvent::Join { player, .. }
            | QueueEvent::Dequeued { player, .. } => *player,
        }
    }

    pub fn to_client_event(&self, server: SocketAddr, join_timeout: Duration) -> ClientEvent {
        match *self {
            QueueEvent::Position {
                position,
                queue_len,
                ..
            } => ClientEvent::QueuePosition {
                server,
                position,
                queue_len,
            },
            QueueEvent::Join { attempt, .. } => ClientEvent::JoinServer {
                server,
                attempt,
                timeout_ms: join_timeout.as_millis() as u64,
            },
            QueueEvent::Dequeued { reason, .. } => ClientEvent::Dequeued { server, reason },
        }
    }
}

pub struct AdmissionQueue {
    config: QueueConfig,
    entries: VecDeque<Entry>,
    last_activity: Instant,
    /// Set while a background task owns this queue
    processing: bool,
}

impl AdmissionQueue {
    pub fn new(config: QueueConfig, now: Instant) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            last_activity: now,
            processing: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, player: PlayerId) -> bool {
        self.index_of(player).is_some()
    }

    pub fn state_of(&self, player: PlayerId) -> Option<EntryState> {
        self.index_of(player).map(|i| self.entries[i].state)
    }

    pub fn attempts_of(&self, player: PlayerId) -> Option<u32> {
        self.index_of(player).map(|i| self.entries[i].attempts)
    }

    /// 1-based position among waiting players; joining players have none
    pub fn position(&self, player: PlayerId) -> Option<usize> {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Waiting)
            .position(|e| e.player == player)
            .map(|p| p + 1)
    }

    pub fn joining_count(&self) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Joining)
            .count() as u32
    }

    pub fn waiting_count(&self) -> usize {
        self.entries.len() - self.joining_count() as usize
    }

    /// Empty and untouched for longer than the idle timeout
    pub fn is_idle(&self, now: Instant) -> bool {
        self.entries.is_empty()
            && now.saturating_duration_since(self.last_activity) >= self.config.idle_timeout
    }

    fn index_of(&self, player: PlayerId) -> Option<usize> {
        self.entries.iter().position(|e| e.player == player)
    }

    pub fn enqueue(&mut self, player: PlayerId, now: Instant) -> Result<(), QueueError> {
        if self.contains(player) {
            return Err(QueueError::AlreadyQueued);
        }
        if self.entries.len() >= self.config.max_queue_len {
            return Err(QueueError::QueueFull);
        }

        self.entries.push_back(Entry {
            player,
            state: EntryState::Waiting,
            attempts: 0,
            first_attempt_at: None,
            attempt_started_at: None,
            reported_position: None,
        });
        self.last_activity = now;
        Ok(())
    }

    pub fn remove(
        &mut self,
        player: PlayerId,
        reason: DequeueReason,
        now: Instant,
    ) -> Option<QueueEvent> {
        let index = self.index_of(player)?;
        self.entries.remove(index);
        self.last_activity = now;
        Some(QueueEvent::Dequeued { player, reason })
    }

    /// Handles a player's report on its join attempt
    pub fn acknowledge(
        &mut self,
        player: PlayerId,
        result: JoinResult,
        now: Instant,
    ) -> Result<Vec<QueueEvent>, QueueError> {
        let index = self.index_of(player).ok_or(QueueError::NotQueued)?;
        self.last_activity = now;

        let mut events = Vec::new();
        match result {
            JoinResult::Joined => events.extend(self.remove(player, DequeueReason::Joined, now)),
            JoinResult::Rejected => {
                events.extend(self.remove(player, DequeueReason::JoinFailed, now))
            }
            JoinResult::Failed { server_full } => {
                if self.entries[index].state != EntryState::Joining {
                    warn!("Ignoring failed join from waiting player {}", player);
                    return Ok(events);
                }
                if server_full && self.config.reset_attempts_when_full {
                    self.entries[index].attempts = 0;
                }
                events.extend(self.retry_or_dequeue(index, now));
            }
        }
        Ok(events)
    }

    /// Expires attempts and join budgets, promotes waiting players into free
    /// joining slots and reports position changes. `slots` is how many
    /// players may join at once; unknown capacity allows one.
    pub fn process(&mut self, now: Instant, slots: Option<u32>) -> Vec<QueueEvent> {
        let mut events = Vec::new();

        let mut index = 0;
        while index < self.entries.len() {
            let entry = &self.entries[index];
            let over_budget = entry
                .first_attempt_at
                .is_some_and(|t| now.saturating_duration_since(t) >= self.config.total_join_time);
            let attempt_expired = entry.state == EntryState::Joining
                && entry
                    .attempt_started_at
                    .is_some_and(|t| now.saturating_duration_since(t) >= self.config.join_timeout);

            if over_budget {
                let player = entry.player;
                self.entries.remove(index);
                events.push(QueueEvent::Dequeued {
                    player,
                    reason: DequeueReason::JoinTimeout,
                });
                continue;
            }
            if attempt_expired {
                debug!("Join attempt of player {} timed out", entry.player);
                let before = self.entries.len();
                events.extend(self.retry_or_dequeue(index, now));
                if self.entries.len() < before {
                    continue;
                }
            }
            index += 1;
        }

        let capacity = slots.unwrap_or(1);
        while self.joining_count() < capacity {
            let Some(entry) = self
                .entries
                .iter_mut()
                .find(|e| e.state == EntryState::Waiting)
            else {
                break;
            };
            entry.state = EntryState::Joining;
            entry.attempts += 1;
            entry.attempt_started_at = Some(now);
            entry.first_attempt_at.get_or_insert(now);
            entry.reported_position = None;
            events.push(QueueEvent::Join {
                player: entry.player,
                attempt: entry.attempts,
            });
        }

        events.extend(self.position_updates());
        if !events.is_empty() {
            self.last_activity = now;
        }
        events
    }

    fn retry_or_dequeue(&mut self, index: usize, now: Instant) -> Option<QueueEvent> {
        let entry = &mut self.entries[index];
        let player = entry.player;

        if entry.attempts >= self.config.max_join_attempts {
            self.entries.remove(index);
            return Some(QueueEvent::Dequeued {
                player,
                reason: DequeueReason::MaxJoinAttemptsReached,
            });
        }
        let over_budget = entry
            .first_attempt_at
            .is_some_and(|t| now.saturating_duration_since(t) >= self.config.total_join_time);
        if over_budget {
            self.entries.remove(index);
            return Some(QueueEvent::Dequeued {
                player,
                reason: DequeueReason::JoinTimeout,
            });
        }

        entry.state = EntryState::Waiting;
        entry.attempt_started_at = None;
        None
    }

    fn position_updates(&mut self) -> Vec<QueueEvent> {
        let queue_len = self.entries.len();
        let mut events = Vec::new();
        let mut position = 0;
        for entry in self.entries.iter_mut() {
            if entry.state != EntryState::Waiting {
                continue;
            }
            position += 1;
            if entry.reported_position != Some(position) {
                entry.reported_position = Some(position);
                events.push(QueueEvent::Position {
                    player: entry.player,
                    position,
                    queue_len,
                });
            }
        }
        events
    }
}

/// A queue change other components track players by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionEvent {
    pub server: SocketAddr,
    pub event: QueueEvent,
}

/// Coordinates the admission queues of all servers
pub struct Admission {
    config: QueueConfig,
    notifier: Arc<dyn Notifier>,
    events: mpsc::UnboundedSender<AdmissionEvent>,
    shutdown: CancellationToken,
}

impl Admission {
    /// Returns the coordinator and the stream of queue changes
    pub fn new(
        config: QueueConfig,
        notifier: Arc<dyn Notifier>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AdmissionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let admission = Arc::new(Self {
            config,
            notifier,
            events,
            shutdown: CancellationToken::new(),
        });
        (admission, events_rx)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queues a matched player and immediately hands out free joining slots
    pub fn enqueue(
        self: &Arc<Self>,
        server: &Arc<GameServer>,
        player: PlayerId,
    ) -> Result<(), QueueError> {
        let now = Instant::now();
        let (events, start, waiting) = {
            let mut queue = server.queue().lock();
            queue.enqueue(player, now)?;
            let events = queue.process(now, server.joinable_slots());
            let start = !std::mem::replace(&mut queue.processing, true);
            (events, start, queue.waiting_count())
        };

        info!(
            "Player {} queued for {} ({} waiting)",
            player,
            server.address(),
            waiting
        );
        self.publish(server.address(), events);
        if start {
            self.spawn_processor(Arc::clone(server));
        }
        Ok(())
    }

    pub fn acknowledge(
        &self,
        server: &Arc<GameServer>,
        player: PlayerId,
        result: JoinResult,
    ) -> Result<(), QueueError> {
        let now = Instant::now();
        let events = {
            let mut queue = server.queue().lock();
            let mut events = queue.acknowledge(player, result, now)?;
            events.extend(queue.process(now, server.joinable_slots()));
            events
        };
        self.publish(server.address(), events);
        Ok(())
    }

    /// Removes a player for a reason of its own (leaving, disconnecting)
    pub fn remove(&self, server: &Arc<GameServer>, player: PlayerId, reason: DequeueReason) -> bool {
        let now = Instant::now();
        let events = {
            let mut queue = server.queue().lock();
            let Some(removed) = queue.remove(player, reason, now) else {
                return false;
            };
            let mut events = vec![removed];
            events.extend(queue.process(now, server.joinable_slots()));
            events
        };
        self.publish(server.address(), events);
        true
    }

    /// Stops all processing tasks
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn publish(&self, server: SocketAddr, events: Vec<QueueEvent>) {
        for event in events {
            if let QueueEvent::Dequeued { player, reason } = &event {
                info!("Player {} left queue of {}: {:?}", player, server, reason);
            }
            self.notifier.notify(
                event.player(),
                event.to_client_event(server, self.config.join_timeout),
            );
            let _ = self.events.send(AdmissionEvent { server, event });
        }
    }

    fn spawn_processor(self: &Arc<Self>, server: Arc<GameServer>) {
        let admission = Arc::clone(self);

        debug!("Starting admission processing for {}", server.address());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(admission.config.process_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = admission.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let now = Instant::now();
                let (events, idle) = {
                    let mut queue = server.queue().lock();
                    let events = queue.process(now, server.joinable_slots());
                    let idle = queue.is_idle(now);
                    if idle {
                        queue.processing = false;
                    }
                    (events, idle)
                };
                admission.publish(server.address(), events);

                if idle {
                    debug!("Admission queue of {} went idle", server.address());
                    break;
                }
            }
        });
    }
}
