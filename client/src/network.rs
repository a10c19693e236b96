use crate::display;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    timestamp_ms, ClientEvent, DequeueReason, JoinResult, Packet, PlayerId, PreferredServer,
    SearchCriteria, MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout};

/// How the client answers join instructions, standing in for the game
/// client that would really connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AckPolicy {
    /// Report a successful join
    Joined,
    /// Report a failed connection
    Fail,
    /// Report that the server was full
    Full,
    /// Report that the server refused us for good
    Reject,
    /// Never answer, letting the attempt time out
    Ignore,
}

impl AckPolicy {
    pub fn result(self) -> Option<JoinResult> {
        match self {
            AckPolicy::Joined => Some(JoinResult::Joined),
            AckPolicy::Fail => Some(JoinResult::Failed { server_full: false }),
            AckPolicy::Full => Some(JoinResult::Failed { server_full: true }),
            AckPolicy::Reject => Some(JoinResult::Rejected),
            AckPolicy::Ignore => None,
        }
    }
}

/// How a matchmaking session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Joined(SocketAddr),
    Dequeued(DequeueReason),
    Interrupted,
}

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    player_id: PlayerId,
    name: String,
    ack: AckPolicy,
    connected: bool,

    ping_ms: u64,
    heartbeat_interval: Duration,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        player_id: PlayerId,
        name: &str,
        ack: AckPolicy,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            player_id,
            name: name.to_string(),
            ack,
            connected: false,
            ping_ms: 0,
            heartbeat_interval: Duration::from_secs(2),
        })
    }

    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Round trip of the last answered heartbeat
    pub fn ping_ms(&self) -> u64 {
        self.ping_ms
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    async fn recv_packet(
        &self,
        buffer: &mut [u8],
    ) -> Result<Packet, Box<dyn std::error::Error>> {
        loop {
            let (len, from) = self.socket.recv_from(buffer).await?;
            if from != self.server_addr {
                debug!("Ignoring datagram from {}", from);
                continue;
            }
            return Ok(deserialize::<Packet>(&buffer[..len])?);
        }
    }

    /// Says hello and waits for the daemon to accept us
    pub async fn connect(&mut self, wait: Duration) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to matchmaker at {}...", self.server_addr);

        let hello = Packet::Hello {
            protocol_version: PROTOCOL_VERSION,
            player_id: self.player_id,
            name: self.name.clone(),
        };
        self.send_packet(&hello).await?;

        let mut buffer = [0u8; MAX_PACKET_SIZE];
        let response = timeout(wait, async {
            loop {
                match self.recv_packet(&mut buffer).await? {
                    packet @ (Packet::Welcome { .. } | Packet::Rejected { .. }) => {
                        return Ok::<_, Box<dyn std::error::Error>>(packet)
                    }
                    other => debug!("Ignoring {:?} while connecting", other),
                }
            }
        })
        .await
        .map_err(|_| "matchmaker did not answer")??;

        match response {
            Packet::Welcome { player_id } => {
                info!("Connected! Player ID: {}", player_id);
                self.connected = true;
                Ok(())
            }
            Packet::Rejected { reason } => Err(format!("rejected by matchmaker: {}", reason).into()),
            _ => Err("unexpected response".into()),
        }
    }

    pub async fn enter_matchmaking(
        &self,
        criteria: SearchCriteria,
        servers: Vec<PreferredServer>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.send_packet(&Packet::EnterMatchmaking { criteria, servers })
            .await
    }

    pub async fn leave_matchmaking(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.send_packet(&Packet::LeaveMatchmaking).await
    }

    pub async fn disconnect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if self.connected {
            self.send_packet(&Packet::Disconnect).await?;
            self.connected = false;
        }
        Ok(())
    }

    /// Handles one event; returns the outcome once the session is over
    async fn handle_event(&mut self, event: ClientEvent) -> Option<Outcome> {
        info!("{}", display::event(&event));

        match event {
            ClientEvent::JoinServer { server, .. } => {
                match self.ack.result() {
                    Some(result) => {
                        let ack = Packet::JoinAck { server, result };
                        if let Err(e) = self.send_packet(&ack).await {
                            error!("Error acknowledging join: {}", e);
                        }
                    }
                    None => warn!("Not answering join instruction for {}", server),
                }
                None
            }
            ClientEvent::Dequeued {
                server,
                reason: DequeueReason::Joined,
            } => Some(Outcome::Joined(server)),
            ClientEvent::Dequeued { reason, .. } => Some(Outcome::Dequeued(reason)),
            _ => None,
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Option<Outcome> {
        match packet {
            Packet::Event(event) => self.handle_event(event).await,

            Packet::Heartbeat { timestamp } => {
                self.ping_ms = timestamp_ms().saturating_sub(timestamp);
                debug!("Matchmaker ping {}ms", self.ping_ms);
                None
            }

            Packet::Rejected { reason } => {
                warn!("Disconnected: {}", reason);
                self.connected = false;
                Some(Outcome::Interrupted)
            }

            _ => {
                warn!("Unexpected packet type");
                None
            }
        }
    }

    /// Searches for a match and follows the join handshake until the
    /// player joins, is dequeued or presses Ctrl+C
    pub async fn run(
        &mut self,
        criteria: SearchCriteria,
        servers: Vec<PreferredServer>,
    ) -> Result<Outcome, Box<dyn std::error::Error>> {
        if !self.connected {
            self.connect(Duration::from_secs(5)).await?;
        }
        info!("Searching on {} servers", servers.len());
        self.enter_matchmaking(criteria, servers).await?;

        let mut heartbeat = interval(self.heartbeat_interval);
        let mut buffer = [0u8; MAX_PACKET_SIZE];

        let outcome = loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, from)) if from == self.server_addr => {
                            if let Ok(packet) = deserialize::<Packet>(&buffer[..len]) {
                                if let Some(outcome) = self.handle_packet(packet).await {
                                    break outcome;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = heartbeat.tick() => {
                    let packet = Packet::Heartbeat { timestamp: timestamp_ms() };
                    if let Err(e) = self.send_packet(&packet).await {
                        error!("Error sending heartbeat: {}", e);
                    }
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Leaving matchmaking...");
                    let _ = self.leave_matchmaking().await;
                    break Outcome::Interrupted;
                },
            }
        };

        self.disconnect().await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_policy_results() {
        assert_eq!(AckPolicy::Joined.result(), Some(JoinResult::Joined));
        assert_eq!(
            AckPolicy::Full.result(),
            Some(JoinResult::Failed { server_full: true })
        );
        assert_eq!(AckPolicy::Ignore.result(), None);
    }

    #[tokio::test]
    async fn test_connect_against_rejecting_server() {
        let daemon = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let daemon_addr = daemon.local_addr().unwrap();
        let mut client = Client::new(&daemon_addr.to_string(), 9, "nine", AckPolicy::Joined)
            .await
            .unwrap();

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_PACKET_SIZE];
            let (len, from) = daemon.recv_from(&mut buffer).await.unwrap();
            let hello: Packet = deserialize(&buffer[..len]).unwrap();
            assert!(matches!(hello, Packet::Hello { player_id: 9, .. }));
            let rejected = Packet::Rejected {
                reason: "Server full".to_string(),
            };
            daemon
                .send_to(&serialize(&rejected).unwrap(), from)
                .await
                .unwrap();
        });

        let err = client.connect(Duration::from_secs(2)).await.unwrap_err();
        assert!(err.to_string().contains("Server full"));
        assert!(!client.is_connected());
    }
}
