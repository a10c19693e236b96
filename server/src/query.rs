//! Game server query service
//!
//! Sends `getinfo` / `getstatus` probes to one or many game servers and
//! correlates the answers. Bulk probes resolve endpoints in parallel, send
//! sequentially with a minimum gap between datagrams and stream results back
//! in the order responses arrive. Every input server yields exactly one
//! result, so callers can treat a missing response like any other failure.

use crate::config::QueryConfig;
use crate::correlator::{PendingRequest, PendingRequests, ResponseFuture};
use crate::error::{Error, Result};
use crate::resolver::Resolve;
use crate::transport::{Inbound, Subscription, Transport};
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use shared::{
    clamp_ping, CommandMessage, GameServerInfo, GameServerStatus, ProbeKind, MAX_PING_MS,
};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Host name or IP literal plus port, as listed by a player or a master server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`. IPv6 literals must be bracketed.
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Some(addr.into());
        }
        let (host, port) = s.rsplit_once(':')?;
        if host.is_empty() || host.contains(':') {
            return None;
        }
        Some(Self::new(host, port.parse().ok()?))
    }
}

impl From<SocketAddr> for ServerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A snapshot type that can be produced by a probe
pub trait ProbeResponse: Clone + Send + 'static {
    const KIND: ProbeKind;

    /// Parses a response body. `None` means the response was invalid.
    fn from_response(endpoint: SocketAddr, body: &str, ping: u32) -> Option<Self>;
}

impl ProbeResponse for GameServerInfo {
    const KIND: ProbeKind = ProbeKind::Info;

    fn from_response(endpoint: SocketAddr, body: &str, ping: u32) -> Option<Self> {
        match GameServerInfo::parse(endpoint, body, ping) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("Discarding info response from {}: {}", endpoint, e);
                None
            }
        }
    }
}

impl ProbeResponse for GameServerStatus {
    const KIND: ProbeKind = ProbeKind::Status;

    fn from_response(endpoint: SocketAddr, body: &str, _ping: u32) -> Option<Self> {
        Some(GameServerStatus::parse(endpoint, body))
    }
}

/// Outcome of one input server of a bulk probe
#[derive(Debug, Clone)]
pub struct ProbeResult<T> {
    /// Position of the server in the input list
    pub index: usize,
    pub server: ServerAddress,
    pub endpoint: Option<SocketAddr>,
    pub result: Option<T>,
}

/// Keeps consecutive sends at least `interval` apart
struct Pacer {
    interval: Duration,
    last_send: Option<Instant>,
}

/// Below this, sleeping overshoots; finish by yielding until the deadline
const SPIN_THRESHOLD: Duration = Duration::from_millis(2);

impl Pacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_send: None,
        }
    }

    async fn wait(&mut self) {
        if let Some(last) = self.last_send {
            wait_until(last + self.interval).await;
        }
        self.last_send = Some(Instant::now());
    }
}

async fn wait_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;
        if remaining > SPIN_THRESHOLD {
            tokio::time::sleep(remaining - SPIN_THRESHOLD).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
}

fn ping_of(request: &PendingRequest, inbound: &Inbound) -> u32 {
    request
        .sent_at()
        .map(|sent| clamp_ping(inbound.received_at.saturating_duration_since(sent).as_millis()))
        .unwrap_or(MAX_PING_MS)
}

pub struct QueryService {
    transport: Arc<Transport>,
    resolver: Arc<dyn Resolve>,
    pending: Arc<PendingRequests>,
    config: QueryConfig,
    pacer: Mutex<Pacer>,
    _subscriptions: Vec<Subscription>,
}

impl QueryService {
    /// Registers the response handlers on `transport`
    pub fn new(
        transport: Arc<Transport>,
        resolver: Arc<dyn Resolve>,
        config: QueryConfig,
    ) -> Arc<Self> {
        let pending = Arc::new(PendingRequests::new());

        let subscriptions = [ProbeKind::Info, ProbeKind::Status]
            .into_iter()
            .map(|kind| {
                let pending = Arc::clone(&pending);
                transport.on(kind.response_command(), move |inbound: &Inbound| {
                    if pending.complete(inbound) == 0 {
                        debug!(
                            "Unsolicited `{}` from {}",
                            inbound.message.command(),
                            inbound.from
                        );
                    }
                })
            })
            .collect();

        Arc::new(Self {
            pacer: Mutex::new(Pacer::new(config.send_interval)),
            transport,
            resolver,
            pending,
            config,
            _subscriptions: subscriptions,
        })
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<dyn Resolve> {
        &self.resolver
    }

    /// Requests currently waiting for a response
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Sends one command and waits for the correlated response. Unlike the
    /// probe helpers this reports every failure as an error.
    pub async fn request(
        &self,
        endpoint: SocketAddr,
        message: CommandMessage,
        response_command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Inbound> {
        let (request, response) = PendingRequest::new(endpoint, message, response_command, timeout);
        self.round_trip(&request, response, cancel).await
    }

    pub async fn get_info(&self, server: &ServerAddress) -> Option<GameServerInfo> {
        self.probe(server, &CancellationToken::new()).await
    }

    pub async fn get_status(&self, server: &ServerAddress) -> Option<GameServerStatus> {
        self.probe(server, &CancellationToken::new()).await
    }

    /// Probes one server. Resolution failure, send failure, timeout and an
    /// invalid response all yield `None`.
    pub async fn probe<T: ProbeResponse>(
        &self,
        server: &ServerAddress,
        cancel: &CancellationToken,
    ) -> Option<T> {
        let Some(endpoint) = self.resolver.resolve(&server.host, server.port).await else {
            debug!("Could not resolve {}", server);
            return None;
        };

        let (request, response) = PendingRequest::new(
            endpoint,
            T::KIND.request(),
            T::KIND.response_command(),
            self.config.request_timeout,
        );
        match self.round_trip(&request, response, cancel).await {
            Ok(inbound) => {
                T::from_response(endpoint, inbound.message.data(), ping_of(&request, &inbound))
            }
            Err(e) => {
                debug!("Probe `{}` to {} failed: {}", T::KIND.request_command(), server, e);
                None
            }
        }
    }

    async fn round_trip(
        &self,
        request: &Arc<PendingRequest>,
        response: ResponseFuture,
        cancel: &CancellationToken,
    ) -> Result<Inbound> {
        self.pending.insert(Arc::clone(request));
        let outcome = self.exchange(request, response, cancel).await;
        self.pending.remove(request);
        outcome
    }

    async fn exchange(
        &self,
        request: &Arc<PendingRequest>,
        response: ResponseFuture,
        cancel: &CancellationToken,
    ) -> Result<Inbound> {
        if let Err(e) = self.paced_send(request).await {
            request.try_fail(Error::Send(request.endpoint()));
            return Err(e);
        }
        request.activate();

        tokio::select! {
            outcome = response => outcome,
            _ = cancel.cancelled() => {
                request.try_cancel();
                Err(Error::Canceled)
            }
        }
    }

    async fn paced_send(&self, request: &PendingRequest) -> Result<()> {
        let mut pacer = self.pacer.lock().await;
        pacer.wait().await;
        request.mark_sent();
        self.transport
            .send(request.endpoint(), request.message())
            .await?;
        Ok(())
    }

    pub fn get_info_many(
        self: &Arc<Self>,
        servers: Vec<ServerAddress>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<ProbeResult<GameServerInfo>> {
        self.probe_many(servers, timeout, cancel)
    }

    pub fn get_status_many(
        self: &Arc<Self>,
        servers: Vec<ServerAddress>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<ProbeResult<GameServerStatus>> {
        self.probe_many(servers, timeout, cancel)
    }

    /// Probes every server and streams one `ProbeResult` per input, in the
    /// order responses arrive. The channel closes once every request has
    /// resolved, `timeout` elapses or `cancel` fires; inputs still open at
    /// that point are reported without a result.
    pub fn probe_many<T: ProbeResponse>(
        self: &Arc<Self>,
        servers: Vec<ServerAddress>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<ProbeResult<T>> {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service
                .run_batch(Batch::new(servers, results_tx), timeout, cancel)
                .await;
        });
        results_rx
    }

    /// Collects a bulk probe into a list ordered like the input
    pub async fn probe_all<T: ProbeResponse>(
        self: &Arc<Self>,
        servers: Vec<ServerAddress>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Vec<ProbeResult<T>> {
        let mut results_rx = self.probe_many(servers, timeout, cancel);
        let mut results = Vec::new();
        while let Some(result) = results_rx.recv().await {
            results.push(result);
        }
        results.sort_by_key(|r| r.index);
        results
    }

    /// Calls `on_response` for every successful response as it arrives
    pub fn probe_each<T, F>(
        self: &Arc<Self>,
        servers: Vec<ServerAddress>,
        timeout: Duration,
        on_response: F,
    ) -> BulkProbe
    where
        T: ProbeResponse,
        F: Fn(T) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let listening = CancellationToken::new();
        let mut results_rx = self.probe_many::<T>(servers, timeout, cancel.clone());

        let stopped = listening.clone();
        let done = tokio::spawn(async move {
            while let Some(result) = results_rx.recv().await {
                if stopped.is_cancelled() {
                    continue;
                }
                if let Some(value) = result.result {
                    on_response(value);
                }
            }
        });

        BulkProbe {
            listener: ProbeListener { token: listening },
            cancel,
            done,
        }
    }

    async fn resolve_all(&self, servers: &[ServerAddress]) -> Vec<Option<SocketAddr>> {
        let mut unique: Vec<&ServerAddress> = servers.iter().collect();
        unique.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        unique.dedup();

        let lookups: Vec<_> = unique
            .into_iter()
            .map(|server| async move {
                (server, self.resolver.resolve(&server.host, server.port).await)
            })
            .collect();
        let resolved: HashMap<&ServerAddress, Option<SocketAddr>> = stream::iter(lookups)
            .buffer_unordered(self.config.resolve_concurrency.max(1))
            .collect()
            .await;

        servers
            .iter()
            .map(|server| resolved.get(server).copied().flatten())
            .collect()
    }

    async fn run_batch<T: ProbeResponse>(
        &self,
        mut batch: Batch<T>,
        timeout: Duration,
        cancel: CancellationToken,
    ) {
        let deadline = tokio::time::Instant::now() + timeout;

        let endpoints = tokio::select! {
            endpoints = self.resolve_all(&batch.servers) => endpoints,
            _ = cancel.cancelled() => {
                batch.finish();
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                debug!("Bulk probe timed out while resolving");
                batch.finish();
                return;
            }
        };

        // One request per distinct endpoint, in input order
        let (sink, mut outcomes) = mpsc::unbounded_channel();
        let request_timeout = self.config.request_timeout.min(timeout);
        let mut order: Vec<Arc<PendingRequest>> = Vec::new();
        let mut targets: HashMap<u64, Vec<usize>> = HashMap::new();
        let mut by_endpoint: HashMap<SocketAddr, u64> = HashMap::new();

        for (index, endpoint) in endpoints.into_iter().enumerate() {
            let Some(endpoint) = endpoint else {
                debug!("Could not resolve {}", batch.servers[index]);
                batch.emit(index, None);
                continue;
            };
            batch.endpoints[index] = Some(endpoint);

            let id = *by_endpoint.entry(endpoint).or_insert_with(|| {
                let request = PendingRequest::with_sink(
                    endpoint,
                    T::KIND.request(),
                    T::KIND.response_command(),
                    request_timeout,
                    sink.clone(),
                );
                let id = request.id();
                order.push(request);
                id
            });
            targets.entry(id).or_default().push(index);
        }
        drop(sink);

        let requests: HashMap<u64, &Arc<PendingRequest>> =
            order.iter().map(|request| (request.id(), request)).collect();

        let send_all = async {
            for request in &order {
                if cancel.is_cancelled() {
                    break;
                }
                self.pending.insert(Arc::clone(request));
                if let Err(e) = self.paced_send(request).await {
                    debug!("Probe to {} not sent: {}", request.endpoint(), e);
                    request.try_fail(Error::Send(request.endpoint()));
                    continue;
                }
                request.activate();
            }
        };

        let collect = async {
            let mut remaining = order.len();
            while remaining > 0 {
                let Some((id, outcome)) = outcomes.recv().await else {
                    break;
                };
                remaining -= 1;
                let Some(request) = requests.get(&id) else {
                    continue;
                };
                self.pending.remove(request);

                let result = match outcome {
                    Ok(inbound) => T::from_response(
                        request.endpoint(),
                        inbound.message.data(),
                        ping_of(request, &inbound),
                    ),
                    Err(e) => {
                        debug!("Probe to {} failed: {}", request.endpoint(), e);
                        None
                    }
                };
                for &index in targets.get(&id).into_iter().flatten() {
                    batch.emit(index, result.clone());
                }
            }
        };

        tokio::select! {
            _ = async { tokio::join!(send_all, collect) } => {}
            _ = cancel.cancelled() => debug!("Bulk probe canceled"),
            _ = tokio::time::sleep_until(deadline) => debug!("Bulk probe timed out"),
        }

        // Only this batch's own requests are withdrawn
        for request in &order {
            request.try_cancel();
            self.pending.remove(request);
        }
        batch.finish();
    }
}

/// Per-batch bookkeeping guaranteeing one result per input
struct Batch<T> {
    servers: Vec<ServerAddress>,
    endpoints: Vec<Option<SocketAddr>>,
    emitted: Vec<bool>,
    results: mpsc::UnboundedSender<ProbeResult<T>>,
}

impl<T: ProbeResponse> Batch<T> {
    fn new(servers: Vec<ServerAddress>, results: mpsc::UnboundedSender<ProbeResult<T>>) -> Self {
        let len = servers.len();
        Self {
            servers,
            endpoints: vec![None; len],
            emitted: vec![false; len],
            results,
        }
    }

    fn emit(&mut self, index: usize, result: Option<T>) {
        if std::mem::replace(&mut self.emitted[index], true) {
            return;
        }
        let _ = self.results.send(ProbeResult {
            index,
            server: self.servers[index].clone(),
            endpoint: self.endpoints[index],
            result,
        });
    }

    fn finish(&mut self) {
        for index in 0..self.servers.len() {
            self.emit(index, None);
        }
    }
}

/// Stops callbacks of a `probe_each` batch when stopped or dropped
pub struct ProbeListener {
    token: CancellationToken,
}

impl ProbeListener {
    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for ProbeListener {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub struct BulkProbe {
    pub listener: ProbeListener,
    cancel: CancellationToken,
    /// Completes once every outstanding request of the batch has resolved
    pub done: JoinHandle<()>,
}

impl BulkProbe {
    /// Abandons requests that have not resolved yet
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the batch while still delivering callbacks
    pub async fn finished(self) {
        let BulkProbe { listener, done, .. } = self;
        if let Err(e) = done.await {
            warn!("Bulk probe task ended abnormally: {}", e);
        }
        drop(listener);
    }
}
