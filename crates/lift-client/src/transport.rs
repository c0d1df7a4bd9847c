//! The network collaborator.
//!
//! The client never speaks HTTP itself. It builds URLs and payloads and hands
//! them to a [`Transport`], which performs exactly one exchange per call and
//! reports the raw body or a [`TransportError`].
//!
//! Cancelling a long-poll is done by dropping its future; the client runs
//! each long-poll in its own task and aborts that task on a forced restart.

use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How the server is expected to answer an Ajax post.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// A batch of server directives (see [`Directives`](crate::Directives)).
    #[default]
    Script,
    /// An opaque JSON document for the caller.
    Json,
}

impl ResponseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseKind::Script => "script",
            ResponseKind::Json => "json",
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload progress of a post body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub loaded: u64,
    pub total: Option<u64>,
}

/// Callback receiving upload progress.
pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// One Ajax post.
#[derive(Clone)]
pub struct PostRequest {
    pub url: String,
    pub payload: String,
    pub kind: ResponseKind,
    pub timeout: Duration,
    pub on_progress: Option<ProgressFn>,
}

impl fmt::Debug for PostRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostRequest")
            .field("url", &self.url)
            .field("payload", &self.payload)
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// One long-poll for the whole watch set.
#[derive(Debug, Clone)]
pub struct LongPollRequest {
    pub url: String,
    /// Channel id to last-known version.
    pub watch: BTreeMap<String, i64>,
    pub timeout: Duration,
}

/// Performs request/response exchanges on behalf of the client.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// POST `payload` and return the response body.
    async fn post(&self, request: PostRequest) -> Result<String, TransportError>;

    /// GET a long-poll and return the response body once the server answers.
    async fn long_poll(&self, request: LongPollRequest) -> Result<String, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn post(&self, request: PostRequest) -> Result<String, TransportError> {
        (**self).post(request).await
    }

    async fn long_poll(&self, request: LongPollRequest) -> Result<String, TransportError> {
        (**self).long_poll(request).await
    }
}
