//! Deferred values: multi-listener broadcasters fed by server push.
//!
//! A [`Deferred`] buffers everything it is told. Listeners attached late get
//! the full history replayed synchronously, so attaching is safe at any time
//! relative to delivery.
//!
//! ```text
//!            deliver(envelope)
//!                  │
//!                  ▼
//!   pending ── event listeners ──┬─ Success(v) ─► value listeners (stay pending)
//!                                ├─ Done ───────► fulfilled ─► done listeners
//!                                └─ Failure(r) ─► failed ────► failure listeners
//! ```
//!
//! Once fulfilled or failed, further deliveries are ignored. Listener
//! registration and replay stay legal forever.

use crate::envelope::{Envelope, FailureReason};
use crate::hooks::{Hooks, TracingHooks};
use futures::channel::{mpsc, oneshot};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;
use uuid::Uuid;

/// Identity of a deferred value, unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeferredId(Uuid);

impl DeferredId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DeferredId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeferredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DeferredId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a deferred value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredState {
    Pending,
    Fulfilled,
    Failed,
}

impl DeferredState {
    pub fn is_settled(self) -> bool {
        !matches!(self, DeferredState::Pending)
    }
}

type ValueListener<V> = Arc<dyn Fn(&V) + Send + Sync>;
type EventListener<V> = Arc<dyn Fn(&Envelope<V>) + Send + Sync>;
type FailureListener = Arc<dyn Fn(&str) + Send + Sync>;
type DoneListener = Arc<dyn Fn() + Send + Sync>;

struct Inner<V> {
    state: DeferredState,
    values: Vec<V>,
    events: Vec<Envelope<V>>,
    failure: Option<FailureReason>,
    value_listeners: Vec<ValueListener<V>>,
    event_listeners: Vec<EventListener<V>>,
    failure_listeners: Vec<FailureListener>,
    done_listeners: Vec<DoneListener>,
}

impl<V> Default for Inner<V> {
    fn default() -> Self {
        Self {
            state: DeferredState::Pending,
            values: Vec::new(),
            events: Vec::new(),
            failure: None,
            value_listeners: Vec::new(),
            event_listeners: Vec::new(),
            failure_listeners: Vec::new(),
            done_listeners: Vec::new(),
        }
    }
}

/// A stream of values that completes exactly once.
///
/// Cloning yields another handle to the same value.
pub struct Deferred<V = serde_json::Value> {
    id: DeferredId,
    inner: Arc<Mutex<Inner<V>>>,
    hooks: Arc<dyn Hooks>,
}

impl<V> Clone for Deferred<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Arc::clone(&self.inner),
            hooks: Arc::clone(&self.hooks),
        }
    }
}

impl<V> fmt::Debug for Deferred<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.id)
            .field("state", &self.lock().state)
            .finish()
    }
}

impl<V> Deferred<V> {
    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        // Listeners never run under the lock, so poisoning can only come from
        // a panic inside this module; the data is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> DeferredId {
        self.id
    }

    pub fn state(&self) -> DeferredState {
        self.lock().state
    }

    pub fn is_settled(&self) -> bool {
        self.state().is_settled()
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.lock().failure.clone()
    }

    /// Run one listener, reporting a panic instead of unwinding into the caller.
    fn guard(&self, kind: &str, call: impl FnOnce()) {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(call)) {
            self.hooks.log_error(&format!(
                "{kind} listener of {} panicked: {}",
                self.id,
                panic_message(panic.as_ref())
            ));
        }
    }
}

impl<V> Deferred<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// A pending value that reports listener panics through `tracing`.
    pub fn new() -> Self {
        Self::with_hooks(Arc::new(TracingHooks))
    }

    /// A pending value that reports listener panics to `hooks`.
    pub fn with_hooks(hooks: Arc<dyn Hooks>) -> Self {
        Self {
            id: DeferredId::new(),
            inner: Arc::new(Mutex::new(Inner::default())),
            hooks,
        }
    }

    /// Values received so far, in order.
    pub fn buffered_values(&self) -> Vec<V> {
        self.lock().values.clone()
    }

    /// Every envelope accepted so far, in order.
    pub fn buffered_events(&self) -> Vec<Envelope<V>> {
        self.lock().events.clone()
    }

    /// Apply one envelope. Ignored once settled.
    pub fn deliver(&self, envelope: Envelope<V>) {
        let listeners = {
            let mut inner = self.lock();
            if inner.state.is_settled() {
                trace!(id = %self.id, kind = envelope.kind(), "ignoring envelope for settled deferred");
                return;
            }
            inner.events.push(envelope.clone());
            inner.event_listeners.clone()
        };

        for listener in &listeners {
            self.guard("event", || listener(&envelope));
        }

        match envelope {
            Envelope::Done => self.complete(),
            Envelope::Success(value) => self.emit(value),
            Envelope::Failure(reason) => self.fail(reason),
        }
    }

    fn emit(&self, value: V) {
        let listeners = {
            let mut inner = self.lock();
            if inner.state.is_settled() {
                return;
            }
            inner.values.push(value.clone());
            inner.value_listeners.clone()
        };

        for listener in &listeners {
            self.guard("value", || listener(&value));
        }
    }

    fn complete(&self) {
        let listeners = {
            let mut inner = self.lock();
            if inner.state.is_settled() {
                return;
            }
            inner.state = DeferredState::Fulfilled;
            inner.done_listeners.clone()
        };

        for listener in &listeners {
            self.guard("done", || listener());
        }
    }

    fn fail(&self, reason: FailureReason) {
        let listeners = {
            let mut inner = self.lock();
            if inner.state.is_settled() {
                return;
            }
            inner.state = DeferredState::Failed;
            inner.failure = Some(reason.clone());
            inner.failure_listeners.clone()
        };

        for listener in &listeners {
            self.guard("failure", || listener(&reason));
        }
    }

    /// Listen for values. Values already received are replayed first.
    pub fn on_value<F>(&self, f: F) -> &Self
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        let listener: ValueListener<V> = Arc::new(f);
        let replay = {
            let mut inner = self.lock();
            inner.value_listeners.push(Arc::clone(&listener));
            inner.values.clone()
        };

        for value in &replay {
            self.guard("value", || listener(value));
        }
        self
    }

    /// Listen for failure. Fires immediately if already failed.
    pub fn on_failure<F>(&self, f: F) -> &Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let listener: FailureListener = Arc::new(f);
        let replay = {
            let mut inner = self.lock();
            inner.failure_listeners.push(Arc::clone(&listener));
            inner.failure.clone()
        };

        if let Some(reason) = replay {
            self.guard("failure", || listener(&reason));
        }
        self
    }

    /// Listen for completion. Fires immediately if already fulfilled.
    pub fn on_done<F>(&self, f: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let listener: DoneListener = Arc::new(f);
        let fulfilled = {
            let mut inner = self.lock();
            inner.done_listeners.push(Arc::clone(&listener));
            inner.state == DeferredState::Fulfilled
        };

        if fulfilled {
            self.guard("done", || listener());
        }
        self
    }

    /// Listen for raw envelopes. Envelopes already accepted are replayed first.
    pub fn on_event<F>(&self, f: F) -> &Self
    where
        F: Fn(&Envelope<V>) + Send + Sync + 'static,
    {
        let listener: EventListener<V> = Arc::new(f);
        let replay = {
            let mut inner = self.lock();
            inner.event_listeners.push(Arc::clone(&listener));
            inner.events.clone()
        };

        for event in &replay {
            self.guard("event", || listener(event));
        }
        self
    }

    /// A new deferred carrying `f` of every value, settling when this one does.
    ///
    /// The result is not registered anywhere; it is fed only by `self`.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&V) -> U + Send + Sync + 'static,
    {
        let mapped = Deferred::with_hooks(Arc::clone(&self.hooks));

        // Values first: a source that is already done must still replay its
        // values before the mapped side settles.
        let target = mapped.clone();
        self.on_value(move |value| target.deliver(Envelope::Success(f(value))));

        let target = mapped.clone();
        self.on_done(move || target.deliver(Envelope::Done));

        let target = mapped.clone();
        self.on_failure(move |reason| target.deliver(Envelope::Failure(reason.to_string())));

        mapped
    }

    /// Values as a stream that ends when this value settles.
    pub fn values(&self) -> mpsc::UnboundedReceiver<V> {
        let (tx, rx) = mpsc::unbounded();

        let sender = tx.clone();
        self.on_value(move |value| {
            let _ = sender.unbounded_send(value.clone());
        });

        let sender = tx.clone();
        self.on_done(move || sender.close_channel());
        self.on_failure(move |_| tx.close_channel());

        rx
    }

    /// Resolves once this value settles: `Ok` when fulfilled, `Err` with the
    /// reason when failed.
    pub fn settled(&self) -> impl Future<Output = Result<(), FailureReason>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let done_slot = Arc::clone(&slot);
        self.on_done(move || settle(&done_slot, Ok(())));
        self.on_failure(move |reason| settle(&slot, Err(reason.to_string())));

        async move {
            rx.await
                .unwrap_or_else(|_| Err("deferred dropped before settling".to_string()))
        }
    }
}

impl<V> Default for Deferred<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

type SettleSlot = Mutex<Option<oneshot::Sender<Result<(), FailureReason>>>>;

fn settle(slot: &SettleSlot, outcome: Result<(), FailureReason>) {
    let sender = slot
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(outcome);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CollectingHooks {
        errors: Mutex<Vec<String>>,
    }

    impl Hooks for CollectingHooks {
        fn log_error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |value: &T| sink.lock().unwrap().push(value.clone()))
    }

    #[test]
    fn early_and_late_value_listeners_see_all_values() {
        let deferred: Deferred<i32> = Deferred::new();
        let (early, listener) = recorder();
        deferred.on_value(listener);

        deferred.deliver(Envelope::Success(1));
        deferred.deliver(Envelope::Success(2));

        let (late, listener) = recorder();
        deferred.on_value(listener);

        assert_eq!(*early.lock().unwrap(), vec![1, 2]);
        assert_eq!(*late.lock().unwrap(), vec![1, 2]);
        assert_eq!(deferred.state(), DeferredState::Pending);
    }

    #[test]
    fn done_listener_after_completion_fires_once() {
        let deferred: Deferred<i32> = Deferred::new();
        deferred.deliver(Envelope::Success(1));
        deferred.deliver(Envelope::Done);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        deferred.on_done(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        deferred.deliver(Envelope::Done);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(deferred.state(), DeferredState::Fulfilled);
    }

    #[test]
    fn failure_is_terminal_and_replayed() {
        let deferred: Deferred<i32> = Deferred::new();
        deferred.deliver(Envelope::Failure("x".into()));
        deferred.deliver(Envelope::Success(5));
        deferred.deliver(Envelope::Done);

        assert_eq!(deferred.state(), DeferredState::Failed);
        assert!(deferred.buffered_values().is_empty());
        assert_eq!(deferred.buffered_events().len(), 1);

        let (reasons, _) = recorder::<String>();
        let sink = Arc::clone(&reasons);
        deferred.on_failure(move |reason| sink.lock().unwrap().push(reason.to_string()));
        assert_eq!(*reasons.lock().unwrap(), vec!["x".to_string()]);
    }

    #[test]
    fn event_listeners_replay_history_in_order() {
        let deferred: Deferred<i32> = Deferred::new();
        deferred.deliver(Envelope::Success(1));
        deferred.deliver(Envelope::Done);

        let (events, listener) = recorder::<Envelope<i32>>();
        deferred.on_event(listener);

        assert_eq!(
            *events.lock().unwrap(),
            vec![Envelope::Success(1), Envelope::Done]
        );
    }

    #[test]
    fn panicking_listener_is_logged_and_others_still_run() {
        let hooks = Arc::new(CollectingHooks::default());
        let deferred: Deferred<i32> = Deferred::with_hooks(hooks.clone());

        deferred.on_value(|_| panic!("boom"));
        let (seen, listener) = recorder();
        deferred.on_value(listener);
        deferred.on_event(|_| panic!("event boom"));

        deferred.deliver(Envelope::Success(3));

        assert_eq!(*seen.lock().unwrap(), vec![3]);
        let errors = hooks.errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("boom")));
    }

    #[test]
    fn listener_registered_during_delivery_sees_value_once() {
        let deferred: Deferred<i32> = Deferred::new();
        let (seen, _) = recorder::<i32>();

        let handle = deferred.clone();
        let sink = Arc::clone(&seen);
        deferred.on_value(move |value| {
            if *value == 1 {
                let sink = Arc::clone(&sink);
                handle.on_value(move |v| sink.lock().unwrap().push(*v));
            }
        });

        deferred.deliver(Envelope::Success(1));
        deferred.deliver(Envelope::Success(2));

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn map_transforms_values_and_mirrors_completion() {
        let source: Deferred<i32> = Deferred::new();
        let doubled = source.map(|v| v * 2);

        source.deliver(Envelope::Success(1));
        source.deliver(Envelope::Success(4));
        source.deliver(Envelope::Done);

        assert_eq!(doubled.buffered_values(), vec![2, 8]);
        assert_eq!(doubled.state(), DeferredState::Fulfilled);
    }

    #[test]
    fn map_of_completed_source_keeps_values() {
        let source: Deferred<i32> = Deferred::new();
        source.deliver(Envelope::Success(3));
        source.deliver(Envelope::Done);

        let text = source.map(|v| v.to_string());
        assert_eq!(text.buffered_values(), vec!["3".to_string()]);
        assert_eq!(text.state(), DeferredState::Fulfilled);
    }

    #[test]
    fn map_mirrors_failure() {
        let source: Deferred<i32> = Deferred::new();
        let mapped = source.map(|v| *v);
        source.deliver(Envelope::Failure("gone".into()));

        assert_eq!(mapped.state(), DeferredState::Failed);
        assert_eq!(mapped.failure_reason().as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn values_stream_ends_on_done() {
        let deferred: Deferred<i32> = Deferred::new();
        deferred.deliver(Envelope::Success(1));
        let stream = deferred.values();
        deferred.deliver(Envelope::Success(2));
        deferred.deliver(Envelope::Done);

        let collected: Vec<i32> = stream.collect().await;
        assert_eq!(collected, vec![1, 2]);
    }

    #[tokio::test]
    async fn settled_reports_outcome() {
        let ok: Deferred<i32> = Deferred::new();
        let waiting = ok.settled();
        ok.deliver(Envelope::Done);
        assert_eq!(waiting.await, Ok(()));

        let failed: Deferred<i32> = Deferred::new();
        failed.deliver(Envelope::Failure("nope".into()));
        assert_eq!(failed.settled().await, Err("nope".to_string()));
    }

    #[test]
    fn ids_are_unique_and_parse_back() {
        let a: Deferred<i32> = Deferred::new();
        let b: Deferred<i32> = Deferred::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().to_string().parse::<DeferredId>().unwrap(), a.id());
    }
}
