//! Control plane: the UDP socket player clients talk to, and the loop that
//! routes their packets into sessions, matchmaking and admission queues

use crate::admission::{Admission, AdmissionEvent, QueueEvent};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::matchmaking::{Matchmaker, Withdrawal};
use crate::notify::{Notifier, Outbound, UdpNotifier};
use crate::query::QueryService;
use crate::registry::Registry;
use crate::resolver::{DnsResolver, Resolve};
use crate::server_list::{CachedServerList, ServerList, StaticServerList};
use crate::sessions::{PlayerState, Session, Sessions};
use crate::transport::Transport;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use shared::{
    ClientEvent, DequeueReason, MatchmakingError, Packet, PlayerId, MAX_PACKET_SIZE,
    PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long the configured server list is trusted before it is resolved again
const SERVER_LIST_TTL: Duration = Duration::from_secs(300);

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    SessionTimeout { session: Session },
    Admission(AdmissionEvent),
}

/// The matchmaking daemon
pub struct Server {
    socket: Arc<UdpSocket>,
    config: ServerConfig,
    sessions: Arc<RwLock<Sessions>>,
    transport: Arc<Transport>,
    resolver: Arc<DnsResolver>,
    registry: Arc<Registry>,
    admission: Arc<Admission>,
    matchmaker: Arc<Matchmaker>,
    server_list: CachedServerList<StaticServerList>,
    shutdown: CancellationToken,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
    admission_rx: Option<mpsc::UnboundedReceiver<AdmissionEvent>>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(config.control_address).await?);
        info!("Matchmaking daemon listening on {}", socket.local_addr()?);

        let transport = Transport::bind(config.query_address).await?;
        info!("Probing game servers from {}", transport.local_addr());

        let resolver = Arc::new(DnsResolver::new(config.resolver.clone()));
        let query = QueryService::new(
            Arc::clone(&transport),
            Arc::clone(&resolver) as Arc<dyn Resolve>,
            config.query.clone(),
        );
        let registry = Arc::new(Registry::new(query, config.queue.clone()));
        let sessions = Arc::new(RwLock::new(Sessions::new(config.max_sessions)));

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let notifier: Arc<dyn Notifier> =
            Arc::new(UdpNotifier::new(Arc::clone(&sessions), outbound_tx.clone()));
        let (admission, admission_rx) = Admission::new(config.queue.clone(), Arc::clone(&notifier));
        let matchmaker = Matchmaker::new(
            Arc::clone(&registry),
            Arc::clone(&admission),
            notifier,
            config.matchmaking.clone(),
        );
        let server_list = CachedServerList::new(
            StaticServerList::new(
                &config.servers,
                Arc::clone(&resolver) as Arc<dyn Resolve>,
                config.query.resolve_concurrency,
            ),
            SERVER_LIST_TTL,
        );

        Ok(Server {
            socket,
            config,
            sessions,
            transport,
            resolver,
            registry,
            admission,
            matchmaker,
            server_list,
            shutdown: CancellationToken::new(),
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            admission_rx: Some(admission_rx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Address game servers see probes coming from
    pub fn query_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Cancelling the token stops `run`
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn matchmaker(&self) -> &Arc<Matchmaker> {
        &self.matchmaker
    }

    pub fn sessions(&self) -> &Arc<RwLock<Sessions>> {
        &self.sessions
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_PACKET_SIZE];

            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = socket.recv_from(&mut buffer) => received,
                };

                match received {
                    Ok((len, addr)) => match deserialize::<Packet>(&buffer[..len]) {
                        Ok(packet) => {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        }
                        Err(_) => debug!("Failed to deserialize packet from {}", addr),
                    },
                    Err(e) => {
                        // Refused sends to departed clients surface here on some platforms
                        debug!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let Some(mut outbound_rx) = self.outbound_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(Outbound { packet, addr }) = outbound_rx.recv().await {
                if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                    warn!("Failed to send packet to {}: {}", addr, e);
                }
            }
        });
    }

    /// Spawns task that drops silent sessions, idle game servers and
    /// expired DNS entries
    fn spawn_timeout_checker(&self) {
        let sessions = Arc::clone(&self.sessions);
        let registry = Arc::clone(&self.registry);
        let resolver = Arc::clone(&self.resolver);
        let server_tx = self.server_tx.clone();
        let shutdown = self.shutdown.clone();
        let timeout = self.config.session_timeout;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let timed_out = sessions.write().check_timeouts(timeout);
                for session in timed_out {
                    info!("Player {} timed out", session.id);
                    if let Err(e) = server_tx.send(ServerMessage::SessionTimeout { session }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
                registry.prune_idle();
                resolver.purge();
            }
        });
    }

    /// Spawns task that feeds admission queue changes into the main loop
    fn spawn_admission_forwarder(&mut self) {
        let server_tx = self.server_tx.clone();
        let Some(mut admission_rx) = self.admission_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(event) = admission_rx.recv().await {
                if server_tx.send(ServerMessage::Admission(event)).is_err() {
                    break;
                }
            }
        });
    }

    async fn send_packet_impl(socket: &UdpSocket, packet: &Packet, addr: SocketAddr) -> Result<()> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.outbound_tx.send(Outbound { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn send_error(&self, error: MatchmakingError, addr: SocketAddr) {
        self.send_packet(Packet::Event(ClientEvent::Error(error)), addr);
    }

    /// Announces the configured game servers to the registry
    async fn register_servers(&self) {
        let servers = self.server_list.get_servers().await;
        for addr in &servers {
            self.registry.get_or_create(addr.ip(), addr.port(), "");
        }
        if !servers.is_empty() {
            info!("Registered {} game servers", servers.len());
        }
    }

    /// Processes incoming packets from player clients
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        if let Packet::Hello {
            protocol_version,
            player_id,
            name,
        } = packet
        {
            self.handle_hello(protocol_version, player_id, &name, addr);
            return;
        }

        let player = {
            let mut sessions = self.sessions.write();
            let player = sessions.find_by_addr(addr);
            if let Some(session) = player.and_then(|id| sessions.get_mut(id)) {
                session.touch();
            }
            player
        };
        let Some(player) = player else {
            debug!("Packet from {} without a session", addr);
            self.send_error(MatchmakingError::UnknownSession, addr);
            return;
        };

        match packet {
            Packet::EnterMatchmaking { criteria, servers } => {
                if self.matchmaker.enter_matchmaking(player, criteria, &servers) {
                    self.sessions
                        .write()
                        .set_state(player, PlayerState::Matchmaking);
                }
            }

            Packet::UpdatePreferences { criteria, servers } => {
                self.matchmaker
                    .update_search_preferences(player, criteria, &servers);
            }

            Packet::LeaveMatchmaking => {
                let state = self.state_of(player);
                match self.withdraw(player, state, DequeueReason::UserLeave) {
                    Some(Withdrawal::Search) => {
                        self.sessions.write().set_state(player, PlayerState::Idle);
                    }
                    // The dequeue event resets the session
                    Some(Withdrawal::Queue(_)) => {}
                    None => self.send_error(MatchmakingError::NotSearching, addr),
                }
            }

            Packet::JoinAck { server, result } => {
                let Some(game_server) = self.registry.get(server) else {
                    warn!("Player {} acknowledged unknown server {}", player, server);
                    return;
                };
                if let Err(e) = self.admission.acknowledge(&game_server, player, result) {
                    warn!("Ignoring join ack of player {} for {}: {}", player, server, e);
                }
            }

            Packet::Heartbeat { timestamp } => {
                self.send_packet(Packet::Heartbeat { timestamp }, addr);
            }

            Packet::Disconnect => {
                let state = self.state_of(player);
                self.withdraw(player, state, DequeueReason::Disconnect);
                self.sessions.write().remove(player);
            }

            _ => {
                warn!("Unexpected packet type from player at {}", addr);
            }
        }
    }

    fn handle_hello(&self, protocol_version: u32, player: PlayerId, name: &str, addr: SocketAddr) {
        if protocol_version != PROTOCOL_VERSION {
            info!(
                "Rejecting player {} from {} (protocol {})",
                player, addr, protocol_version
            );
            self.send_packet(
                Packet::Rejected {
                    reason: "Protocol version mismatch".to_string(),
                },
                addr,
            );
            return;
        }

        let accepted = self.sessions.write().get_or_add(player, name, addr).is_some();
        let response = if accepted {
            Packet::Welcome { player_id: player }
        } else {
            Packet::Rejected {
                reason: "Server full".to_string(),
            }
        };
        self.send_packet(response, addr);
    }

    fn state_of(&self, player: PlayerId) -> PlayerState {
        self.sessions
            .read()
            .get(player)
            .map_or(PlayerState::Idle, |session| session.state)
    }

    /// Takes a departing player out of matchmaking or its admission queue
    fn withdraw(
        &self,
        player: PlayerId,
        state: PlayerState,
        reason: DequeueReason,
    ) -> Option<Withdrawal> {
        let withdrawal = self
            .matchmaker
            .withdraw(player, state.queued_server(), reason);
        if let Some(Withdrawal::Queue(server)) = withdrawal {
            debug!("Player {} withdrawn from queue of {}", player, server);
        }
        withdrawal
    }

    /// Mirrors admission queue changes into the player's session
    fn handle_admission(&self, AdmissionEvent { server, event }: AdmissionEvent) {
        let player = event.player();
        let state = match event {
            QueueEvent::Position { .. } => PlayerState::Queued { server },
            QueueEvent::Join { .. } => PlayerState::Joining { server },
            QueueEvent::Dequeued {
                reason: DequeueReason::Joined,
                ..
            } => {
                self.track_join(player, server);
                PlayerState::Joined { server }
            }
            QueueEvent::Dequeued { .. } => PlayerState::Idle,
        };
        self.sessions.write().set_state(player, state);
    }

    /// Attributes a player to the server it joined, taking it off the
    /// server it played on before
    fn track_join(&self, player: PlayerId, server: SocketAddr) {
        let Some(to) = self.registry.get(server) else {
            return;
        };
        let from = self
            .registry
            .servers()
            .into_iter()
            .find(|s| s.address() != server && s.has_player(player));
        if !self.registry.move_player(player, from.as_deref(), &to) {
            warn!("Could not attribute player {} to full server {}", player, server);
        }
    }

    /// Main server loop; returns once the shutdown token is cancelled
    pub async fn run(&mut self) -> Result<()> {
        // Initialize concurrent tasks
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();
        self.spawn_admission_forwarder();
        tokio::spawn(Arc::clone(&self.matchmaker).run(self.shutdown.child_token()));

        self.register_servers().await;
        info!("Server started successfully");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Server shutting down");
                    break;
                }

                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        }
                        Some(ServerMessage::SessionTimeout { session }) => {
                            self.withdraw(session.id, session.state, DequeueReason::Disconnect);
                        }
                        Some(ServerMessage::Admission(event)) => {
                            self.handle_admission(event);
                        }
                        None => break,
                    }
                }
            }
        }

        self.admission.shutdown();
        self.transport.shutdown().await;
        Ok(())
    }
}
