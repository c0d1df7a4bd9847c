//! Messages delivered to a [`Deferred`](crate::Deferred).

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::fmt;

/// Why a deferred value failed.
pub type FailureReason = String;

/// One message for a deferred value: completion, a value, or a failure.
///
/// On the wire an envelope is an object with exactly one meaningful key:
/// `{"done": true}`, `{"success": <value>}` or `{"failure": <reason>}`. A key
/// whose value is `null` counts as absent. When several keys are present,
/// `done` wins over `success`, which wins over `failure`.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope<V> {
    Done,
    Success(V),
    Failure(FailureReason),
}

impl<V> Envelope<V> {
    /// Whether delivering this envelope settles the receiver.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Envelope::Success(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Done => "done",
            Envelope::Success(_) => "success",
            Envelope::Failure(_) => "failure",
        }
    }
}

#[derive(Deserialize)]
struct RawEnvelope<V> {
    done: Option<serde_json::Value>,
    success: Option<V>,
    failure: Option<serde_json::Value>,
}

impl<'de, V> Deserialize<'de> for Envelope<V>
where
    V: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawEnvelope::<V>::deserialize(deserializer)?;

        if raw.done.is_some() {
            Ok(Envelope::Done)
        } else if let Some(value) = raw.success {
            Ok(Envelope::Success(value))
        } else if let Some(reason) = raw.failure {
            Ok(Envelope::Failure(reason_text(reason)))
        } else {
            Err(D::Error::custom(
                "envelope needs one of `done`, `success` or `failure`",
            ))
        }
    }
}

fn reason_text(reason: serde_json::Value) -> FailureReason {
    match reason {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    }
}

impl<V: fmt::Debug> fmt::Display for Envelope<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::Done => f.write_str("done"),
            Envelope::Success(value) => write!(f, "success({value:?})"),
            Envelope::Failure(reason) => write!(f, "failure({reason})"),
        }
    }
}
