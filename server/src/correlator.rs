//! Correlation of outbound probes with their responses
//!
//! A `PendingRequest` resolves exactly once: with the response, with a
//! cancellation (explicit or timeout) or with an error. `PendingRequests`
//! indexes outstanding requests by `(endpoint, response command)` so the
//! dispatch task can find them when a datagram arrives.

use crate::error::Error;
use crate::transport::Inbound;
use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use shared::CommandMessage;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub type RequestOutcome = Result<Inbound, Error>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Waiting,
    Completed,
    Canceled,
    Error,
}

impl RequestState {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Canceled | RequestState::Error
        )
    }
}

/// Where the outcome goes once the request resolves
enum Completion {
    Oneshot(oneshot::Sender<RequestOutcome>),
    /// Batch probes share one channel so outcomes arrive in receipt order
    Sink(mpsc::UnboundedSender<(u64, RequestOutcome)>),
}

struct Inner {
    state: RequestState,
    sent_at: Option<Instant>,
    completion: Option<Completion>,
    timer: Option<JoinHandle<()>>,
}

pub struct PendingRequest {
    id: u64,
    endpoint: SocketAddr,
    message: CommandMessage,
    response_command: String,
    created_at: Instant,
    timeout: Duration,
    inner: Mutex<Inner>,
}

/// Resolves with the request's outcome. A dropped request resolves as
/// canceled.
pub struct ResponseFuture {
    rx: oneshot::Receiver<RequestOutcome>,
}

impl Future for ResponseFuture {
    type Output = RequestOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Canceled)))
    }
}

impl PendingRequest {
    pub fn new(
        endpoint: SocketAddr,
        message: CommandMessage,
        response_command: &str,
        timeout: Duration,
    ) -> (Arc<Self>, ResponseFuture) {
        let (tx, rx) = oneshot::channel();
        let request = Self::build(
            endpoint,
            message,
            response_command,
            timeout,
            Completion::Oneshot(tx),
        );
        (request, ResponseFuture { rx })
    }

    /// Builds a request whose outcome is pushed into `sink` tagged with the
    /// request id
    pub fn with_sink(
        endpoint: SocketAddr,
        message: CommandMessage,
        response_command: &str,
        timeout: Duration,
        sink: mpsc::UnboundedSender<(u64, RequestOutcome)>,
    ) -> Arc<Self> {
        Self::build(
            endpoint,
            message,
            response_command,
            timeout,
            Completion::Sink(sink),
        )
    }

    fn build(
        endpoint: SocketAddr,
        message: CommandMessage,
        response_command: &str,
        timeout: Duration,
        completion: Completion,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            message,
            response_command: response_command.to_ascii_lowercase(),
            created_at: Instant::now(),
            timeout,
            inner: Mutex::new(Inner {
                state: RequestState::Created,
                sent_at: None,
                completion: Some(completion),
                timer: None,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn message(&self) -> &CommandMessage {
        &self.message
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> RequestState {
        self.inner.lock().state
    }

    /// When the request went out
    pub fn sent_at(&self) -> Option<Instant> {
        self.inner.lock().sent_at
    }

    /// Records the send time right before the datagram leaves, so a
    /// response racing `activate` still gets an accurate ping
    pub fn mark_sent(&self) {
        self.inner.lock().sent_at.get_or_insert_with(Instant::now);
    }

    /// Same command, data and separator
    pub fn is_duplicate_of(&self, message: &CommandMessage) -> bool {
        self.message == *message
    }

    /// Moves the request to waiting and arms its timeout. Returns false when
    /// the request was already resolved, for example by a fast response.
    pub fn activate(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != RequestState::Created {
            return false;
        }
        inner.state = RequestState::Waiting;
        inner.sent_at.get_or_insert_with(Instant::now);

        let request = Arc::downgrade(self);
        let timeout = self.timeout;
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(request) = request.upgrade() {
                if request.resolve(RequestState::Canceled, Err(Error::Timeout)) {
                    debug!(
                        "Request `{}` to {} timed out",
                        request.message.command(),
                        request.endpoint
                    );
                }
            }
        }));
        true
    }

    pub fn try_complete(&self, inbound: Inbound) -> bool {
        self.resolve(RequestState::Completed, Ok(inbound))
    }

    /// Cancels the request; only the first resolving call returns true
    pub fn try_cancel(&self) -> bool {
        self.resolve(RequestState::Canceled, Err(Error::Canceled))
    }

    pub fn try_fail(&self, error: Error) -> bool {
        self.resolve(RequestState::Error, Err(error))
    }

    fn resolve(&self, state: RequestState, outcome: RequestOutcome) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_final() {
            return false;
        }
        inner.state = state;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        match inner.completion.take() {
            Some(Completion::Oneshot(tx)) => {
                let _ = tx.send(outcome);
            }
            Some(Completion::Sink(sink)) => {
                let _ = sink.send((self.id, outcome));
            }
            None => {}
        }
        true
    }
}

type Key = (SocketAddr, String);

/// Outstanding requests keyed by endpoint and expected response command
#[derive(Default)]
pub struct PendingRequests {
    by_key: DashMap<Key, Vec<Arc<PendingRequest>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes a request, cancelling and dropping earlier identical requests
    /// to the same endpoint. Returns how many were preempted.
    pub fn insert(&self, request: Arc<PendingRequest>) -> usize {
        let key = (request.endpoint, request.response_command.clone());
        let preempted: Vec<Arc<PendingRequest>> = {
            let mut entry = self.by_key.entry(key).or_default();
            let (duplicates, kept): (Vec<_>, Vec<_>) = entry
                .drain(..)
                .partition(|existing| existing.is_duplicate_of(&request.message));
            *entry = kept;
            entry.push(request);
            duplicates
        };

        for old in &preempted {
            old.try_cancel();
        }
        preempted.len()
    }

    /// Hands a response to every request outstanding for its sender and
    /// command, removing them from the index. Requests that have not been
    /// sent yet stay indexed; the response belongs to an earlier probe.
    pub fn complete(&self, inbound: &Inbound) -> usize {
        let key = (inbound.from, inbound.message.command_key());
        let sent: Vec<Arc<PendingRequest>> = {
            let Some(mut entry) = self.by_key.get_mut(&key) else {
                return 0;
            };
            let (sent, unsent) = entry
                .drain(..)
                .partition(|request| request.sent_at().is_some());
            *entry = unsent;
            sent
        };
        self.by_key.remove_if(&key, |_, list| list.is_empty());

        sent.into_iter()
            .filter(|request| request.try_complete(inbound.clone()))
            .count()
    }

    pub fn remove(&self, request: &PendingRequest) {
        let key = (request.endpoint, request.response_command.clone());
        if let Some(mut entry) = self.by_key.get_mut(&key) {
            entry.retain(|r| r.id != request.id);
        }
        self.by_key.remove_if(&key, |_, list| list.is_empty());
    }

    /// Number of indexed requests
    pub fn len(&self) -> usize {
        self.by_key.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ProbeKind;

    fn endpoint() -> SocketAddr {
        "10.1.1.1:28960".parse().unwrap()
    }

    fn info_request(timeout: Duration) -> (Arc<PendingRequest>, ResponseFuture) {
        PendingRequest::new(
            endpoint(),
            ProbeKind::Info.request(),
            ProbeKind::Info.response_command(),
            timeout,
        )
    }

    fn response(from: SocketAddr, command: &str) -> Inbound {
        Inbound {
            from,
            message: CommandMessage::new(command, "\\dedicated\\1", '\n').unwrap(),
            received_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (request, future) = info_request(Duration::from_secs(10));

        assert!(request.try_cancel());
        assert!(!request.try_cancel());
        assert_eq!(request.state(), RequestState::Canceled);
        assert!(matches!(future.await, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn test_canceled_request_never_completes() {
        let (request, future) = info_request(Duration::from_secs(10));
        assert!(request.activate());

        assert!(request.try_cancel());
        assert!(!request.try_complete(response(endpoint(), "infoResponse")));
        assert!(!request.try_fail(Error::Timeout));
        assert_eq!(request.state(), RequestState::Canceled);
        assert!(matches!(future.await, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn test_racing_resolutions_resolve_once() {
        let (request, future) = info_request(Duration::from_millis(1));
        request.activate();

        let mut handles = Vec::new();
        for i in 0..8 {
            let request = Arc::clone(&request);
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    request.try_cancel()
                } else {
                    request.try_complete(response(endpoint(), "inforesponse"))
                }
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        let timed_out = matches!(future.await, Err(Error::Timeout));
        assert_eq!(winners + timed_out as usize, 1);
        assert!(request.state().is_final());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_after_activation() {
        let (request, future) = info_request(Duration::from_secs(10));
        assert_eq!(request.state(), RequestState::Created);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(request.state(), RequestState::Created);

        assert!(request.activate());
        assert!(request.sent_at().is_some());
        assert!(!request.activate());

        assert!(matches!(future.await, Err(Error::Timeout)));
        assert_eq!(request.state(), RequestState::Canceled);
    }

    #[tokio::test]
    async fn test_index_completes_matching_endpoint_and_command() {
        let index = PendingRequests::new();
        let (request, future) = info_request(Duration::from_secs(10));
        index.insert(Arc::clone(&request));
        request.mark_sent();
        request.activate();

        let other: SocketAddr = "10.1.1.2:28960".parse().unwrap();
        assert_eq!(index.complete(&response(other, "infoResponse")), 0);
        assert_eq!(index.complete(&response(endpoint(), "statusResponse")), 0);
        assert_eq!(index.len(), 1);

        assert_eq!(index.complete(&response(endpoint(), "infoResponse")), 1);
        assert!(index.is_empty());

        let inbound = future.await.unwrap();
        assert_eq!(inbound.from, endpoint());
        assert_eq!(request.state(), RequestState::Completed);
    }

    #[tokio::test]
    async fn test_response_racing_activation() {
        let index = PendingRequests::new();
        let (request, future) = info_request(Duration::from_secs(10));
        index.insert(Arc::clone(&request));
        request.mark_sent();

        assert_eq!(index.complete(&response(endpoint(), "inforesponse")), 1);
        assert!(!request.activate());
        assert_eq!(request.state(), RequestState::Completed);
        assert!(request.sent_at().is_some());
        assert!(future.await.is_ok());
    }

    #[tokio::test]
    async fn test_unsent_request_ignores_late_response() {
        let index = PendingRequests::new();
        let (request, _future) = info_request(Duration::from_secs(10));
        index.insert(Arc::clone(&request));

        // Answer to a request made before this one went out
        assert_eq!(index.complete(&response(endpoint(), "inforesponse")), 0);
        assert_eq!(request.state(), RequestState::Created);
        assert_eq!(index.len(), 1);

        request.mark_sent();
        assert!(request.activate());
        assert_eq!(index.complete(&response(endpoint(), "inforesponse")), 1);
        assert_eq!(request.state(), RequestState::Completed);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_sink_receives_outcomes_in_resolution_order() {
        let (sink, mut outcomes) = mpsc::unbounded_channel();
        let first = PendingRequest::with_sink(
            endpoint(),
            ProbeKind::Info.request(),
            "inforesponse",
            Duration::from_secs(10),
            sink.clone(),
        );
        let second = PendingRequest::with_sink(
            endpoint(),
            ProbeKind::Status.request(),
            "statusresponse",
            Duration::from_secs(10),
            sink,
        );

        assert!(second.try_complete(response(endpoint(), "statusresponse")));
        assert!(first.try_cancel());

        let (id, outcome) = outcomes.recv().await.unwrap();
        assert_eq!(id, second.id());
        assert!(outcome.is_ok());
        let (id, outcome) = outcomes.recv().await.unwrap();
        assert_eq!(id, first.id());
        assert!(matches!(outcome, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn test_identical_request_preempts_previous() {
        let index = PendingRequests::new();
        let (first, first_future) = info_request(Duration::from_secs(10));
        let (second, _second_future) = info_request(Duration::from_secs(10));
        let (different, _different_future) = PendingRequest::new(
            endpoint(),
            CommandMessage::new("getinfo", "challenge", ' ').unwrap(),
            "inforesponse",
            Duration::from_secs(10),
        );

        assert_eq!(index.insert(Arc::clone(&first)), 0);
        assert_eq!(index.insert(Arc::clone(&different)), 0);
        assert_eq!(index.insert(Arc::clone(&second)), 1);

        assert_eq!(index.len(), 2);
        assert_eq!(first.state(), RequestState::Canceled);
        assert!(matches!(first_future.await, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn test_remove_drops_empty_keys() {
        let index = PendingRequests::new();
        let (request, _future) = info_request(Duration::from_secs(10));
        index.insert(Arc::clone(&request));

        index.remove(&request);
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
    }
}
