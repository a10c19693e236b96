//! Datagram transport for game server query traffic
//!
//! One UDP socket, one receive task and one dispatch task. The receive task
//! only decodes; every handler runs on the dispatch task, so handlers never
//! race each other.

use crate::error::{Error, Result};
use dashmap::DashMap;
use log::{debug, error, warn};
use parking_lot::Mutex;
use shared::CommandMessage;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Status responses of full servers run to several kilobytes
const RECV_BUFFER_LEN: usize = 64 * 1024;
const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// A decoded datagram together with its origin
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: SocketAddr,
    pub message: CommandMessage,
    pub received_at: Instant,
}

pub type Handler = Arc<dyn Fn(&Inbound) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: AtomicU64,
    by_command: DashMap<String, Vec<(u64, Handler)>>,
}

impl Handlers {
    fn add(&self, command: String, handler: Handler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.by_command
            .entry(command)
            .or_default()
            .push((id, handler));
        id
    }

    fn remove(&self, command: &str, id: u64) {
        if let Some(mut list) = self.by_command.get_mut(command) {
            list.retain(|(handler_id, _)| *handler_id != id);
        }
        self.by_command.remove_if(command, |_, list| list.is_empty());
    }

    /// Calls handlers in registration order on a snapshot of the list, so
    /// handlers may subscribe or unsubscribe while being dispatched
    fn dispatch(&self, inbound: &Inbound) -> usize {
        let snapshot: Vec<Handler> = match self.by_command.get(&inbound.message.command_key()) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };
        for handler in &snapshot {
            handler(inbound);
        }
        snapshot.len()
    }
}

/// Deregisters its handler when dropped
pub struct Subscription {
    handlers: Weak<Handlers>,
    command: String,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            handlers.remove(&self.command, self.id);
        }
    }
}

pub struct Transport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    handlers: Arc<Handlers>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    /// Binds the socket and starts the receive and dispatch tasks
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = UdpSocket::from_std(build_socket(addr)?)?;
        let local_addr = socket.local_addr()?;
        debug!("Query transport bound to {}", local_addr);

        let transport = Arc::new(Transport {
            socket: Arc::new(socket),
            local_addr,
            handlers: Arc::new(Handlers::default()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let receiver = transport.spawn_receiver(inbound_tx);
        let dispatcher = transport.spawn_dispatcher(inbound_rx);
        transport.tasks.lock().extend([receiver, dispatcher]);

        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns task that reads datagrams and forwards decoded messages
    fn spawn_receiver(&self, inbound_tx: mpsc::UnboundedSender<Inbound>) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; RECV_BUFFER_LEN];

            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = socket.recv_from(&mut buffer) => received,
                };

                match received {
                    Ok((len, from)) => match CommandMessage::decode(&buffer[..len]) {
                        Ok(message) => {
                            let inbound = Inbound {
                                from,
                                message,
                                received_at: Instant::now(),
                            };
                            if inbound_tx.send(inbound).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("Dropping datagram from {}: {}", from, e),
                    },
                    // ICMP port unreachable from an earlier probe surfaces
                    // here on some platforms
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        debug!("Ignoring {} on query socket", e);
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        })
    }

    /// Spawns the single task all handlers run on
    fn spawn_dispatcher(&self, mut inbound_rx: mpsc::UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        let handlers = Arc::clone(&self.handlers);

        tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                if handlers.dispatch(&inbound) == 0 {
                    debug!(
                        "No handler for `{}` from {}",
                        inbound.message.command(),
                        inbound.from
                    );
                }
            }
        })
    }

    /// Sends a framed message. Unreachable destinations are reported as an
    /// error value, never logged above debug.
    pub async fn send(&self, to: SocketAddr, message: &CommandMessage) -> Result<usize> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }

        match self.socket.send_to(&message.encode(), to).await {
            Ok(sent) => Ok(sent),
            Err(e) => {
                debug!("Failed to send `{}` to {}: {}", message.command(), to, e);
                Err(Error::Send(to))
            }
        }
    }

    /// Non-blocking send for use inside handlers, which run synchronously on
    /// the dispatch task
    pub fn try_send(&self, to: SocketAddr, message: &CommandMessage) -> Result<usize> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }

        self.socket.try_send_to(&message.encode(), to).map_err(|e| {
            debug!("Failed to send `{}` to {}: {}", message.command(), to, e);
            Error::Send(to)
        })
    }

    pub async fn send_command(
        &self,
        to: SocketAddr,
        command: &str,
        data: &str,
        separator: char,
    ) -> Result<usize> {
        let message = CommandMessage::new(command, data, separator)?;
        self.send(to, &message).await
    }

    /// Registers a handler for a command name (case-insensitive). Handlers
    /// for the same command run in registration order.
    pub fn on<F>(&self, command: &str, handler: F) -> Subscription
    where
        F: Fn(&Inbound) + Send + Sync + 'static,
    {
        let command = command.to_ascii_lowercase();
        let id = self.handlers.add(command.clone(), Arc::new(handler));
        Subscription {
            handlers: Arc::downgrade(&self.handlers),
            command,
            id,
        }
    }

    /// Stops both tasks and drops every handler
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Transport task ended abnormally: {}", e);
            }
        }
        self.handlers.by_command.clear();
        debug!("Query transport on {} shut down", self.local_addr);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn build_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("Failed to enlarge query socket receive buffer: {}", e);
    }
    suppress_unreachable_errors(&socket, addr.is_ipv4());
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Keeps ICMP errors caused by probing dead servers off the socket
#[cfg(any(target_os = "linux", target_os = "android"))]
fn suppress_unreachable_errors(socket: &Socket, ipv4: bool) {
    use std::os::fd::AsRawFd;

    let (level, name) = if ipv4 {
        (libc::IPPROTO_IP, libc::IP_RECVERR)
    } else {
        (libc::IPPROTO_IPV6, libc::IPV6_RECVERR)
    };
    let optval: libc::c_int = 0;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of_val(&optval) as libc::socklen_t,
        )
    };
    if ret != 0 {
        warn!(
            "Failed to disable error queue on query socket: {}",
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn suppress_unreachable_errors(_socket: &Socket, _ipv4: bool) {
    debug!("Unreachable-port suppression unsupported here, resets are skipped on receive");
}
