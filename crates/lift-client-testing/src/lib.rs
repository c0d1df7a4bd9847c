//! Testing utilities for lift-client.
//!
//! [`MockTransport`] hands every exchange to a [`MockServer`] held by the
//! test, which answers them one by one:
//!
//! ```ignore
//! let (transport, mut server) = MockTransport::new();
//! let client = ClientBuilder::new(transport).build();
//! client.start(PageIdentity::new("F1", "S1"))?;
//!
//! client.ajax(AjaxRequest::new("a=1"));
//! let post = server.next_post().await?;
//! assert_eq!(post.request.payload, "a=1");
//! post.succeed("");
//! ```
//!
//! [`RecordingHooks`] keeps every hook call for later assertions.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lift_client::{AjaxError, ClientError, Hooks, LongPollRequest, PostRequest, Transport, TransportError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// How long [`MockServer::next_post`] and [`MockServer::next_poll`] wait.
/// Under paused time this elapses instantly once everything is idle.
pub const WAIT_LIMIT: Duration = Duration::from_secs(3_600);

type Reply = oneshot::Sender<Result<String, TransportError>>;

// ============================================================================
// Pending exchanges
// ============================================================================

/// An Ajax post waiting for the test to answer it.
pub struct PendingPost {
    pub request: PostRequest,
    reply: Reply,
}

impl PendingPost {
    pub fn succeed(self, body: impl Into<String>) {
        let _ = self.reply.send(Ok(body.into()));
    }

    pub fn fail(self, error: TransportError) {
        let _ = self.reply.send(Err(error));
    }

    /// Whether the client stopped waiting for this answer.
    pub fn is_aborted(&self) -> bool {
        self.reply.is_closed()
    }
}

/// A long-poll waiting for the test to answer it.
pub struct PendingPoll {
    pub request: LongPollRequest,
    reply: Reply,
}

impl PendingPoll {
    pub fn succeed(self, body: impl Into<String>) {
        let _ = self.reply.send(Ok(body.into()));
    }

    pub fn fail(self, error: TransportError) {
        let _ = self.reply.send(Err(error));
    }

    /// Whether the long-poll was aborted by a restart or shutdown.
    pub fn is_aborted(&self) -> bool {
        self.reply.is_closed()
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Transport half: give it to the client.
#[derive(Clone)]
pub struct MockTransport {
    posts: mpsc::UnboundedSender<PendingPost>,
    polls: mpsc::UnboundedSender<PendingPoll>,
}

/// Server half: keep it in the test.
pub struct MockServer {
    posts: mpsc::UnboundedReceiver<PendingPost>,
    polls: mpsc::UnboundedReceiver<PendingPoll>,
}

impl MockTransport {
    pub fn new() -> (MockTransport, MockServer) {
        let (post_tx, post_rx) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        (
            MockTransport {
                posts: post_tx,
                polls: poll_tx,
            },
            MockServer {
                posts: post_rx,
                polls: poll_rx,
            },
        )
    }
}

async fn answer(rx: oneshot::Receiver<Result<String, TransportError>>) -> Result<String, TransportError> {
    // A pending exchange dropped without an answer reads as an abort.
    rx.await.unwrap_or(Err(TransportError::Aborted))
}

#[async_trait]
impl Transport for MockTransport {
    async fn post(&self, request: PostRequest) -> Result<String, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.posts
            .send(PendingPost { request, reply })
            .map_err(|_| TransportError::Network("mock server dropped".into()))?;
        answer(rx).await
    }

    async fn long_poll(&self, request: LongPollRequest) -> Result<String, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.polls
            .send(PendingPoll { request, reply })
            .map_err(|_| TransportError::Network("mock server dropped".into()))?;
        answer(rx).await
    }
}

impl MockServer {
    /// Wait for the next Ajax post.
    pub async fn next_post(&mut self) -> Result<PendingPost> {
        tokio::time::timeout(WAIT_LIMIT, self.posts.recv())
            .await
            .map_err(|_| anyhow!("no ajax post within {WAIT_LIMIT:?}"))?
            .ok_or_else(|| anyhow!("client dropped its transport"))
    }

    /// Wait for the next long-poll.
    pub async fn next_poll(&mut self) -> Result<PendingPoll> {
        tokio::time::timeout(WAIT_LIMIT, self.polls.recv())
            .await
            .map_err(|_| anyhow!("no long-poll within {WAIT_LIMIT:?}"))?
            .ok_or_else(|| anyhow!("client dropped its transport"))
    }

    pub fn try_next_post(&mut self) -> Option<PendingPost> {
        self.posts.try_recv().ok()
    }

    pub fn try_next_poll(&mut self) -> Option<PendingPoll> {
        self.polls.try_recv().ok()
    }
}

// ============================================================================
// Hooks
// ============================================================================

/// One call into [`Hooks`].
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    LogError(String),
    AjaxStart,
    AjaxEnd,
    AjaxFailure(AjaxError),
    AjaxSessionLost,
    CometSessionLost,
    CometError(String),
}

/// Hooks that remember every call. Clones share the record.
#[derive(Clone, Default)]
pub struct RecordingHooks {
    events: Arc<Mutex<Vec<HookEvent>>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &HookEvent) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    /// Only the busy/idle edges, in order.
    pub fn busy_edges(&self) -> Vec<HookEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, HookEvent::AjaxStart | HookEvent::AjaxEnd))
            .collect()
    }

    pub fn logged_errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HookEvent::LogError(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn record(&self, event: HookEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl Hooks for RecordingHooks {
    fn log_error(&self, message: &str) {
        self.record(HookEvent::LogError(message.to_string()));
    }

    fn ajax_on_start(&self) {
        self.record(HookEvent::AjaxStart);
    }

    fn ajax_on_end(&self) {
        self.record(HookEvent::AjaxEnd);
    }

    fn ajax_on_failure(&self, error: &AjaxError) {
        self.record(HookEvent::AjaxFailure(error.clone()));
    }

    fn ajax_on_session_lost(&self) {
        self.record(HookEvent::AjaxSessionLost);
    }

    fn comet_on_session_lost(&self) {
        self.record(HookEvent::CometSessionLost);
    }

    fn comet_on_error(&self, error: &ClientError) {
        self.record(HookEvent::CometError(error.to_string()));
    }
}
