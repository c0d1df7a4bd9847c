//! The Ajax cycle: one driver task that dispatches queued requests in
//! due-time order, one at a time.
//!
//! ```text
//! enqueue() ──► AjaxQueue (sorted by due time) ──► driver tick
//!                    ▲                                 │ take_due()
//!                    │ requeue (1s, 2s, 4s ...)        ▼
//!                    └──────────── failure ◄──── Transport::post
//!                                                      │ success
//!                                                      ▼
//!                                          directives applied, on_success
//! ```
//!
//! The driver wakes on every enqueue, right after every completion, when the
//! earliest retry becomes due, and otherwise at least once per tick interval.

use super::queue::{AjaxQueue, AjaxVersion, BusyTransition, Requeue};
use super::request::{AjaxRequest, AjaxResponse, Enqueued, FailureFn, QueuedRequest};
use super::url::calc_ajax_url;
use crate::comet::CometCycle;
use crate::config::{ClientConfig, PageContext};
use crate::directives::Directives;
use crate::error::{AjaxError, TransportError};
use crate::hooks::Hooks;
use crate::transport::{PostRequest, ResponseKind, Transport};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

pub(super) struct AjaxShared {
    pub(super) queue: Mutex<AjaxQueue>,
    wake: Notify,
    started: AtomicBool,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) hooks: Arc<dyn Hooks>,
    pub(super) config: Arc<ClientConfig>,
    pub(super) page: Arc<PageContext>,
    pub(super) comet: CometCycle,
}

/// Handle to the Ajax cycle. Clones share one queue.
#[derive(Clone)]
pub struct AjaxCycle {
    pub(super) shared: Arc<AjaxShared>,
}

impl AjaxCycle {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        hooks: Arc<dyn Hooks>,
        config: Arc<ClientConfig>,
        page: Arc<PageContext>,
        comet: CometCycle,
    ) -> Self {
        Self {
            shared: Arc::new(AjaxShared {
                queue: Mutex::new(AjaxQueue::new()),
                wake: Notify::new(),
                started: AtomicBool::new(false),
                transport,
                hooks,
                config,
                page,
                comet,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AjaxQueue> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// Queue a request, due now. Wakes the driver if the cycle is running.
    pub fn enqueue(&self, mut request: AjaxRequest) -> Enqueued {
        if let Some(suffix) = self.shared.page.take_uri_suffix() {
            request.payload.push('&');
            request.payload.push_str(&suffix);
        }

        let version = self.lock().push(request, Instant::now());
        debug!(%version, "ajax request queued");

        if self.is_started() {
            self.shared.wake.notify_one();
        }
        Enqueued { version }
    }

    /// Queue a request and wait for its final outcome.
    pub async fn request(
        &self,
        payload: impl Into<String>,
        kind: ResponseKind,
    ) -> Result<AjaxResponse, AjaxError> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let failure_slot = Arc::clone(&slot);

        self.enqueue(
            AjaxRequest::new(payload)
                .kind(kind)
                .on_success(move |response| resolve(&slot, Ok(response)))
                .on_failure(move |error| resolve(&failure_slot, Err(error))),
        );

        rx.await.unwrap_or(Err(AjaxError::Cancelled))
    }

    /// Append `suffix` to the payload of the next enqueued request only. The
    /// next long-poll discards it if no request claimed it first.
    pub fn set_uri_suffix(&self, suffix: impl Into<String>) {
        self.shared.page.set_uri_suffix(suffix);
    }

    /// Rewrite `url` for the server's GC bookkeeping using the current page
    /// id and queue depth.
    pub fn calc_ajax_url(&self, url: &str, version: Option<AjaxVersion>) -> String {
        let queued = self.lock().reported_depth();
        let config = &self.shared.config;
        calc_ajax_url(
            url,
            &config.ajax_path(),
            &self.shared.page.page_id(),
            version,
            queued,
            config.gc_enabled,
        )
    }

    pub(super) fn endpoint(&self) -> String {
        format!("{}/", self.shared.config.ajax_path())
    }

    pub fn queue_len(&self) -> usize {
        self.lock().len()
    }

    pub fn in_flight(&self) -> Option<AjaxVersion> {
        self.lock().in_flight()
    }

    pub fn is_busy(&self) -> bool {
        self.lock().is_busy()
    }

    /// Start the driver task. Only the first call spawns it.
    pub(crate) fn spawn(&self) -> Option<JoinHandle<()>> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let cycle = self.clone();
        Some(tokio::spawn(cycle.run()))
    }

    /// Stop accepting work: fail the in-flight request and everything queued
    /// with [`AjaxError::Cancelled`]. The driver task must already be aborted;
    /// a later [`spawn`](Self::spawn) starts a fresh one.
    pub(crate) fn stop(&self) {
        self.shared.started.store(false, Ordering::SeqCst);

        let (cancelled, transition) = {
            let mut queue = self.lock();
            let cancelled = queue.drain();
            (cancelled, queue.refresh_busy())
        };
        debug!(cancelled = cancelled.len(), "ajax cycle stopped");

        for on_failure in cancelled {
            self.fail_with(on_failure, AjaxError::Cancelled);
        }
        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    async fn run(self) {
        info!("ajax cycle running");
        let tick = self.shared.config.tick_interval;

        loop {
            let now = Instant::now();
            let (next, transition, wake_at) = {
                let mut queue = self.lock();
                let next = queue.take_due(now);
                let transition = queue.refresh_busy();
                let idle_until = now + tick;
                let wake_at = queue
                    .next_due()
                    .map_or(idle_until, |due| due.min(idle_until));
                (next, transition, wake_at)
            };

            if let Some(transition) = transition {
                self.announce(transition);
            }

            match next {
                Some(request) => self.dispatch(request).await,
                None => {
                    tokio::select! {
                        _ = self.shared.wake.notified() => {}
                        _ = sleep_until(wake_at) => {}
                    }
                }
            }
        }
    }

    fn announce(&self, transition: BusyTransition) {
        match transition {
            BusyTransition::Started => self.shared.hooks.ajax_on_start(),
            BusyTransition::Ended => self.shared.hooks.ajax_on_end(),
        }
    }

    async fn dispatch(&self, mut request: QueuedRequest) {
        let version = match request.kind {
            ResponseKind::Script => Some(request.version),
            ResponseKind::Json => None,
        };
        let url = self.calc_ajax_url(&self.endpoint(), version);
        debug!(
            version = %request.version,
            %url,
            attempt = request.retry_count + 1,
            "ajax dispatch"
        );

        let post = PostRequest {
            url,
            payload: request.payload.clone(),
            kind: request.kind,
            timeout: self.shared.config.request_timeout,
            on_progress: request.on_progress.clone(),
        };
        let outcome = match self.shared.transport.post(post).await {
            Ok(body) => self.decode(request.kind, body),
            Err(error) => Err(error),
        };

        let Some(settled) = self.lock().finish() else {
            debug!(version = %request.version, "ajax request cancelled while in flight");
            return;
        };
        request.on_failure = settled.on_failure;

        match outcome {
            Ok(response) => {
                if let Some(on_success) = request.on_success.take() {
                    self.guard("success", || on_success(response));
                }
            }
            Err(TransportError::SessionLost) => {
                self.shared.hooks.ajax_on_session_lost();
                self.fail(request, AjaxError::SessionLost);
            }
            Err(error) => {
                if error.is_parse_error() {
                    self.shared.hooks.log_error(&format!(
                        "The server call succeeded, but the returned response contains an error: {error}"
                    ));
                }

                let version = request.version;
                let attempts = request.retry_count + 1;
                let budget = self.shared.config.retry_budget;
                let now = Instant::now();
                let requeue = self.lock().requeue(request, now, budget);

                match requeue {
                    Requeue::Scheduled {
                        due_at,
                        retry_count,
                    } => {
                        warn!(
                            %version,
                            retry_count,
                            retry_in = ?due_at.saturating_duration_since(now),
                            %error,
                            "ajax request failed, retrying"
                        );
                    }
                    Requeue::Exhausted(request) => {
                        warn!(%version, attempts, %error, "ajax request failed for good");
                        self.fail(
                            request,
                            AjaxError::Exhausted {
                                attempts,
                                last: error,
                            },
                        );
                    }
                }
            }
        }
    }

    /// Turn a raw body into the caller's response, applying directives from
    /// script responses on the way.
    fn decode(&self, kind: ResponseKind, body: String) -> Result<AjaxResponse, TransportError> {
        match kind {
            ResponseKind::Json => serde_json::from_str(&body)
                .map(AjaxResponse::Json)
                .map_err(|error| TransportError::Parse(error.to_string())),
            ResponseKind::Script => {
                let directives = Directives::parse(&body)
                    .map_err(|error| TransportError::Parse(error.to_string()))?;
                if directives.session_lost {
                    return Err(TransportError::SessionLost);
                }
                self.shared.comet.apply(directives);
                Ok(AjaxResponse::Script(body))
            }
        }
    }

    fn fail(&self, request: QueuedRequest, error: AjaxError) {
        self.fail_with(request.on_failure, error);
    }

    fn fail_with(&self, on_failure: Option<FailureFn>, error: AjaxError) {
        match on_failure {
            Some(on_failure) => self.guard("failure", || on_failure(error)),
            None => self.shared.hooks.ajax_on_failure(&error),
        }
    }

    /// Run a caller callback; a panic is logged and the cycle carries on.
    fn guard(&self, kind: &str, call: impl FnOnce()) {
        if panic::catch_unwind(AssertUnwindSafe(call)).is_err() {
            self.shared
                .hooks
                .log_error(&format!("ajax {kind} callback panicked"));
        }
    }
}

fn resolve(
    slot: &Mutex<Option<oneshot::Sender<Result<AjaxResponse, AjaxError>>>>,
    outcome: Result<AjaxResponse, AjaxError>,
) {
    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(sender) = sender {
        let _ = sender.send(outcome);
    }
}
