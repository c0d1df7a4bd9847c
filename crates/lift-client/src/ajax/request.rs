//! Requests as the caller builds them and as the queue holds them.

use super::queue::AjaxVersion;
use crate::error::AjaxError;
use crate::transport::{Progress, ProgressFn, ResponseKind};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

pub type SuccessFn = Box<dyn FnOnce(AjaxResponse) + Send>;
pub type FailureFn = Box<dyn FnOnce(AjaxError) + Send>;

/// A successful Ajax answer.
#[derive(Debug, Clone, PartialEq)]
pub enum AjaxResponse {
    /// Raw body of a script response, after its directives were applied.
    Script(String),
    /// Parsed body of a JSON response.
    Json(Value),
}

/// An Ajax call waiting to be enqueued.
///
/// ```
/// use lift_client::{AjaxRequest, ResponseKind};
///
/// let request = AjaxRequest::new("F123=clicked")
///     .kind(ResponseKind::Json)
///     .on_success(|response| println!("{response:?}"))
///     .on_failure(|error| eprintln!("{error}"));
/// ```
pub struct AjaxRequest {
    pub(crate) payload: String,
    pub(crate) kind: ResponseKind,
    pub(crate) on_success: Option<SuccessFn>,
    pub(crate) on_failure: Option<FailureFn>,
    pub(crate) on_progress: Option<ProgressFn>,
}

impl AjaxRequest {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            kind: ResponseKind::Script,
            on_success: None,
            on_failure: None,
            on_progress: None,
        }
    }

    pub fn kind(mut self, kind: ResponseKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: FnOnce(AjaxResponse) + Send + 'static,
    {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Called once if the request fails for good. Without it, the host's
    /// [`Hooks::ajax_on_failure`](crate::Hooks::ajax_on_failure) is used.
    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: FnOnce(AjaxError) + Send + 'static,
    {
        self.on_failure = Some(Box::new(f));
        self
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl fmt::Debug for AjaxRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AjaxRequest")
            .field("payload", &self.payload)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Receipt for an enqueued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub version: AjaxVersion,
}

impl Enqueued {
    /// Whether the UI action that triggered the request should be suppressed
    /// (a form submit, a link navigation). Always `true`: the request is
    /// handled asynchronously instead.
    pub fn prevents_default(&self) -> bool {
        true
    }
}

/// A request owned by the queue.
pub(crate) struct QueuedRequest {
    pub(crate) version: AjaxVersion,
    pub(crate) payload: String,
    pub(crate) kind: ResponseKind,
    pub(crate) retry_count: u32,
    pub(crate) due_at: Instant,
    pub(crate) on_success: Option<SuccessFn>,
    pub(crate) on_failure: Option<FailureFn>,
    pub(crate) on_progress: Option<ProgressFn>,
}
