//! Instructions the server sends back in script and long-poll responses.
//!
//! ```json
//! {
//!   "events":   [{"target": "<deferred id>", "event": {"success": 1}}],
//!   "versions": {"CHAT": 17},
//!   "comets":   {"ROSTER": 3},
//!   "sessionLost": false
//! }
//! ```
//!
//! Every field is optional and an empty body means "nothing to do".

use crate::deferred::DeferredId;
use crate::envelope::Envelope;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// An envelope addressed to a registered deferred value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PushedEvent {
    pub target: DeferredId,
    pub event: Envelope<Value>,
}

/// A decoded server response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Directives {
    /// Envelopes to route through the registry, in order.
    pub events: Vec<PushedEvent>,
    /// New versions for channels already being watched.
    pub versions: BTreeMap<String, i64>,
    /// Channels to start watching; triggers a long-poll restart.
    pub comets: BTreeMap<String, i64>,
    /// The server no longer knows this session.
    pub session_lost: bool,
}

impl Directives {
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(body)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.versions.is_empty()
            && self.comets.is_empty()
            && !self.session_lost
    }
}
