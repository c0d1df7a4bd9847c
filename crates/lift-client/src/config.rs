//! Client settings and page identity.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::warn;

/// Tunables recognised by the client.
///
/// Every field has a default, so a partial options object is enough:
///
/// ```
/// use lift_client::ClientConfig;
///
/// let config = ClientConfig::from_json(r#"{"retry_budget": 5, "gc_enabled": false}"#).unwrap();
/// assert_eq!(config.retry_budget, 5);
/// assert_eq!(config.base_path, "/lift");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Path prefix under which the server mounts its ajax and comet endpoints.
    pub base_path: String,
    /// How many times a failed Ajax request is re-queued before it fails.
    pub retry_budget: u32,
    /// Timeout handed to the transport for Ajax posts.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Whether the keep-alive heartbeat and the GC-aware URLs are used.
    pub gc_enabled: bool,
    #[serde(with = "millis")]
    pub gc_interval: Duration,
    #[serde(with = "millis")]
    pub gc_retry_interval: Duration,
    /// Timeout handed to the transport for long-poll requests.
    #[serde(with = "millis")]
    pub long_poll_timeout: Duration,
    /// Delay before re-polling after a failed long-poll.
    #[serde(with = "millis")]
    pub long_poll_retry_interval: Duration,
    /// Delay before re-polling after a successful long-poll.
    #[serde(with = "millis")]
    pub long_poll_settle_delay: Duration,
    /// Longest the Ajax cycle sleeps while idle.
    #[serde(with = "millis")]
    pub tick_interval: Duration,
    /// Origin prepended to long-poll URLs when comet is served elsewhere.
    pub alternate_server_origin: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_path: "/lift".to_string(),
            retry_budget: 3,
            request_timeout: Duration::from_millis(5_000),
            gc_enabled: true,
            gc_interval: Duration::from_millis(75_000),
            gc_retry_interval: Duration::from_millis(15_000),
            long_poll_timeout: Duration::from_millis(140_000),
            long_poll_retry_interval: Duration::from_millis(10_000),
            long_poll_settle_delay: Duration::from_millis(100),
            tick_interval: Duration::from_millis(200),
            alternate_server_origin: None,
        }
    }
}

impl ClientConfig {
    /// Parse an options object. Missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn ajax_path(&self) -> String {
        format!("{}/ajax", self.base_path)
    }

    pub fn comet_path(&self) -> String {
        format!("{}/comet", self.base_path)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Identity inputs supplied once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageIdentity {
    pub page_id: String,
    pub session_id: String,
    /// Channels to watch from the start, keyed by channel id.
    pub channels: BTreeMap<String, i64>,
}

const GC_ATTRIBUTE: &str = "data-lift-gc";
const SESSION_ATTRIBUTE: &str = "data-lift-session-id";
const COMET_ATTRIBUTE_PREFIX: &str = "data-lift-comet-";

impl PageIdentity {
    pub fn new(page_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            page_id: page_id.into(),
            session_id: session_id.into(),
            channels: BTreeMap::new(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>, version: i64) -> Self {
        self.channels.insert(channel.into(), version);
        self
    }

    /// Read identity from the attributes the server renders onto the page body.
    ///
    /// Channel ids are upper-cased; a channel whose version is not an integer
    /// is skipped.
    pub fn from_attributes<'a, I>(attributes: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut identity = Self::default();

        for (name, value) in attributes {
            if name == GC_ATTRIBUTE {
                identity.page_id = value.to_string();
            } else if name == SESSION_ATTRIBUTE {
                identity.session_id = value.to_string();
            } else if let Some(guid) = name.strip_prefix(COMET_ATTRIBUTE_PREFIX) {
                match value.trim().parse::<i64>() {
                    Ok(version) => {
                        identity.channels.insert(guid.to_uppercase(), version);
                    }
                    Err(_) => warn!(attribute = name, value, "ignoring comet with bad version"),
                }
            }
        }

        identity
    }
}

/// Page-level state shared by both cycles: the ids, of which the page id may
/// change at runtime, and the one-shot payload suffix.
#[derive(Debug, Default)]
pub(crate) struct PageContext {
    page_id: RwLock<String>,
    session_id: RwLock<String>,
    uri_suffix: Mutex<Option<String>>,
}

impl PageContext {
    pub(crate) fn page_id(&self) -> String {
        self.page_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_page_id(&self, page_id: impl Into<String>) {
        *self.page_id.write().unwrap_or_else(PoisonError::into_inner) = page_id.into();
    }

    pub(crate) fn session_id(&self) -> String {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_session_id(&self, session_id: impl Into<String>) {
        *self.session_id.write().unwrap_or_else(PoisonError::into_inner) = session_id.into();
    }

    pub(crate) fn set_uri_suffix(&self, suffix: impl Into<String>) {
        *self.suffix_slot() = Some(suffix.into());
    }

    pub(crate) fn take_uri_suffix(&self) -> Option<String> {
        self.suffix_slot().take()
    }

    fn suffix_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.uri_suffix.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
