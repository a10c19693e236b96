//! Push notifications to individual players

use crate::sessions::Sessions;
use log::debug;
use parking_lot::RwLock;
use shared::{ClientEvent, Packet, PlayerId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Delivers an event to one player. Delivery is best effort.
pub trait Notifier: Send + Sync {
    fn notify(&self, player: PlayerId, event: ClientEvent);
}

/// A control packet waiting for the network sender task
#[derive(Debug, Clone)]
pub struct Outbound {
    pub packet: Packet,
    pub addr: SocketAddr,
}

/// Wraps events in `Packet::Event` and queues them for the player's
/// session address
pub struct UdpNotifier {
    sessions: Arc<RwLock<Sessions>>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl UdpNotifier {
    pub fn new(sessions: Arc<RwLock<Sessions>>, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { sessions, outbound }
    }
}

impl Notifier for UdpNotifier {
    fn notify(&self, player: PlayerId, event: ClientEvent) {
        let Some(addr) = self.sessions.read().addr_of(player) else {
            debug!("Dropping event for player {} without a session", player);
            return;
        };
        let _ = self.outbound.send(Outbound {
            packet: Packet::Event(event),
            addr,
        });
    }
}

/// Forwards every event into a channel; handy for embedding and tests
pub struct ChannelNotifier {
    events: mpsc::UnboundedSender<(PlayerId, ClientEvent)>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(PlayerId, ClientEvent)>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (Self { events }, events_rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, player: PlayerId, event: ClientEvent) {
        let _ = self.events.send((player, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::MatchmakingError;

    #[test]
    fn test_udp_notifier_targets_session_address() {
        let sessions = Arc::new(RwLock::new(Sessions::new(8)));
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        sessions.write().get_or_add(7, "seven", addr);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = UdpNotifier::new(Arc::clone(&sessions), tx);

        notifier.notify(7, ClientEvent::Error(MatchmakingError::QueueFull));
        notifier.notify(8, ClientEvent::Error(MatchmakingError::QueueFull));

        let outbound = rx.try_recv().unwrap();
        assert_eq!(outbound.addr, addr);
        assert_eq!(
            outbound.packet,
            Packet::Event(ClientEvent::Error(MatchmakingError::QueueFull))
        );
        assert!(rx.try_recv().is_err());
    }
}
