//! The pending-request queue behind the Ajax cycle.
//!
//! Pure state: no timers, no I/O. The cycle asks it what is due, tells it
//! when the in-flight request settles, and reads busy transitions back.

use super::request::{AjaxRequest, FailureFn, QueuedRequest};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Largest version before the counter wraps back to zero.
///
/// Versions travel to the server in base 36 and must stay within the range
/// a double-precision integer represents exactly.
pub const MAX_VERSION: u64 = (1 << 53) - 1;

/// Queue-depth value embedded in request URLs saturates here.
pub const MAX_REPORTED_DEPTH: usize = 35;

/// Monotonic request version, wrapping to zero after [`MAX_VERSION`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AjaxVersion(u64);

impl AjaxVersion {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    fn successor(self) -> Self {
        if self.0 >= MAX_VERSION {
            Self(0)
        } else {
            Self(self.0 + 1)
        }
    }
}

impl fmt::Display for AjaxVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// Stand-in for backoff delays too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Edge of the derived busy indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyTransition {
    Started,
    Ended,
}

/// Delay before retry number `retries_so_far + 1`: 1s, 2s, 4s, ...
pub fn backoff_delay(retries_so_far: u32) -> Duration {
    let factor = 2u64.saturating_pow(retries_so_far);
    Duration::from_millis(1_000u64.saturating_mul(factor))
}

/// What to do with a request whose attempt just failed.
pub(crate) enum Requeue {
    /// Re-inserted; will be retried at `due_at`.
    Scheduled { due_at: Instant, retry_count: u32 },
    /// Budget spent; the caller must surface the failure.
    Exhausted(QueuedRequest),
}

/// The request currently on the wire. Its failure callback stays here so a
/// shutdown can still report it.
pub(crate) struct InFlight {
    version: AjaxVersion,
    pub(crate) on_failure: Option<FailureFn>,
}

pub(crate) struct AjaxQueue {
    pending: VecDeque<QueuedRequest>,
    in_flight: Option<InFlight>,
    next_version: AjaxVersion,
    busy: bool,
}

impl AjaxQueue {
    pub(crate) fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            next_version: AjaxVersion::default(),
            busy: false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn in_flight(&self) -> Option<AjaxVersion> {
        self.in_flight.as_ref().map(|f| f.version)
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy
    }

    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.pending.front().map(|request| request.due_at)
    }

    /// Depth reported to the server, saturating at [`MAX_REPORTED_DEPTH`].
    pub(crate) fn reported_depth(&self) -> usize {
        self.pending.len().min(MAX_REPORTED_DEPTH)
    }

    /// Queue a new request due at `now`.
    pub(crate) fn push(&mut self, request: AjaxRequest, now: Instant) -> AjaxVersion {
        let version = self.next_version;
        self.next_version = version.successor();

        self.insert(QueuedRequest {
            version,
            payload: request.payload,
            kind: request.kind,
            retry_count: 0,
            due_at: now,
            on_success: request.on_success,
            on_failure: request.on_failure,
            on_progress: request.on_progress,
        });
        version
    }

    /// Sorted insert after every entry due at or before this one, keeping
    /// FIFO order among equal due times.
    fn insert(&mut self, request: QueuedRequest) {
        let at = self
            .pending
            .partition_point(|queued| queued.due_at <= request.due_at);
        self.pending.insert(at, request);
    }

    /// Dequeue the earliest request if nothing is in flight and it is due.
    pub(crate) fn take_due(&mut self, now: Instant) -> Option<QueuedRequest> {
        if self.in_flight.is_some() {
            return None;
        }
        if self.pending.front()?.due_at > now {
            return None;
        }

        let mut request = self.pending.pop_front()?;
        self.in_flight = Some(InFlight {
            version: request.version,
            on_failure: request.on_failure.take(),
        });
        Some(request)
    }

    /// The in-flight request settled. `None` means it was cancelled while on
    /// the wire and its outcome must be discarded.
    pub(crate) fn finish(&mut self) -> Option<InFlight> {
        self.in_flight.take()
    }

    /// Schedule another attempt with exponential backoff, or hand the request
    /// back once `retry_budget` retries have been used.
    pub(crate) fn requeue(
        &mut self,
        mut request: QueuedRequest,
        now: Instant,
        retry_budget: u32,
    ) -> Requeue {
        if request.retry_count >= retry_budget {
            return Requeue::Exhausted(request);
        }

        let delay = backoff_delay(request.retry_count);
        request.retry_count += 1;
        request.due_at = now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE);

        let due_at = request.due_at;
        let retry_count = request.retry_count;
        self.insert(request);
        Requeue::Scheduled {
            due_at,
            retry_count,
        }
    }

    /// Recompute the busy indicator, reporting an edge if it changed.
    pub(crate) fn refresh_busy(&mut self) -> Option<BusyTransition> {
        let busy = !self.pending.is_empty() || self.in_flight.is_some();
        if busy == self.busy {
            return None;
        }

        self.busy = busy;
        Some(if busy {
            BusyTransition::Started
        } else {
            BusyTransition::Ended
        })
    }

    /// Remove the in-flight request and everything queued, returning their
    /// failure callbacks in dispatch order.
    pub(crate) fn drain(&mut self) -> Vec<Option<FailureFn>> {
        let in_flight = self.in_flight.take().map(|f| f.on_failure);
        in_flight
            .into_iter()
            .chain(self.pending.drain(..).map(|r| r.on_failure))
            .collect()
    }
}
