//! Error types for lift-client.
//!
//! Three layers:
//! - [`TransportError`] is what a [`Transport`](crate::Transport) reports for a
//!   single exchange.
//! - [`AjaxError`] is the terminal outcome handed to a request's failure
//!   callback once the scheduler gives up on it.
//! - [`ClientError`] covers everything else the client surfaces to the host.

use thiserror::Error;

/// Failure of one request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Server answered with a non-success status.
    #[error("server responded with HTTP {0}")]
    Status(u16),

    /// Connection-level failure (DNS, refused, reset, TLS...).
    #[error("network error: {0}")]
    Network(String),

    /// The exchange exceeded its timeout.
    #[error("request timed out")]
    Timeout,

    /// The exchange succeeded but the body could not be parsed.
    #[error("response could not be parsed: {0}")]
    Parse(String),

    /// Server reports that the client session no longer exists.
    #[error("session lost")]
    SessionLost,

    /// The exchange was aborted before it completed.
    #[error("request aborted")]
    Aborted,
}

impl TransportError {
    /// Whether this failure carries the parse-error signal.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, TransportError::Parse(_))
    }
}

/// Terminal failure of a queued Ajax request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AjaxError {
    /// Every attempt failed and the retry budget is spent.
    #[error("request failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: TransportError },

    /// The server no longer knows this session.
    #[error("session lost")]
    SessionLost,

    /// The client shut down before the request settled.
    #[error("request cancelled")]
    Cancelled,
}

/// Errors surfaced by the client itself.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A server payload did not decode.
    #[error("failed to decode server payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// A transport exchange failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The operation needs a running client inside a tokio runtime.
    #[error("client is not running")]
    NotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_signal_is_detected() {
        assert!(TransportError::Parse("bad".into()).is_parse_error());
        assert!(!TransportError::Timeout.is_parse_error());
    }

    #[test]
    fn exhausted_mentions_last_error() {
        let err = AjaxError::Exhausted {
            attempts: 4,
            last: TransportError::Status(503),
        };
        assert_eq!(
            err.to_string(),
            "request failed after 4 attempts: server responded with HTTP 503"
        );
    }
}
