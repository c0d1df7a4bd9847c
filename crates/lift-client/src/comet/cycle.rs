//! The long-poll reconnector.
//!
//! ```text
//!          schedule(delay) ── captures epoch
//!                │
//!                ▼  (timer fires)
//!   idle ── enter(captured): watch set non-empty && captured == epoch ──► awaiting-response
//!    ▲                          epoch += 1, spawn long-poll task              │
//!    │                                                                        │
//!    └──── success: schedule(settle delay) / failure: schedule(retry) ◄───────┘
//! ```
//!
//! A forced restart aborts the in-flight task and schedules an entry with no
//! delay. Entries armed before the restart carry an old epoch and do nothing
//! when they fire.

use super::watch::{CometState, WatchSet};
use crate::config::{ClientConfig, PageContext};
use crate::directives::Directives;
use crate::error::{ClientError, TransportError};
use crate::hooks::Hooks;
use crate::registry::Registry;
use crate::transport::{LongPollRequest, Transport};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

/// Exclusive upper bound of the cache-busting nonce in long-poll URLs.
const NONCE_RANGE: u64 = 100_000_000_000;

struct CometShared {
    state: Mutex<CometState>,
    running: AtomicBool,
    transport: Arc<dyn Transport>,
    hooks: Arc<dyn Hooks>,
    config: Arc<ClientConfig>,
    page: Arc<PageContext>,
    registry: Registry,
}

/// Handle to the comet cycle. Clones share one cycle.
#[derive(Clone)]
pub struct CometCycle {
    shared: Arc<CometShared>,
}

impl CometCycle {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        hooks: Arc<dyn Hooks>,
        config: Arc<ClientConfig>,
        page: Arc<PageContext>,
        registry: Registry,
    ) -> Self {
        Self {
            shared: Arc::new(CometShared {
                state: Mutex::new(CometState::default()),
                running: AtomicBool::new(false),
                transport,
                hooks,
                config,
                page,
                registry,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CometState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Merge `channels` into the watch set, overwriting known versions.
    /// With `restart`, abort the current long-poll and issue a new one.
    pub fn register(&self, channels: BTreeMap<String, i64>, restart: bool) {
        debug!(channels = ?channels.keys().collect::<Vec<_>>(), restart, "registering comets");
        self.lock().watch.merge(channels);

        if restart {
            self.restart();
        }
    }

    /// Stop watching one channel. The in-flight poll is left alone.
    pub fn unregister(&self, channel: &str) -> bool {
        self.lock().watch.remove(channel).is_some()
    }

    /// Record a newer version for a channel that is already watched.
    pub fn update_version(&self, channel: &str, version: i64) -> bool {
        self.lock().watch.update(channel, version)
    }

    /// Replace the whole watch set.
    pub fn replace_watch_set(&self, watch: WatchSet) {
        self.lock().watch = watch;
    }

    pub fn watch_set(&self) -> WatchSet {
        self.lock().watch.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch()
    }

    /// Whether a long-poll is outstanding.
    pub fn is_polling(&self) -> bool {
        self.lock().is_polling()
    }

    /// Abort the outstanding long-poll, if any, and poll again right away.
    ///
    /// Before the client starts this only leaves the watch set in place; the
    /// first poll goes out on start.
    pub fn restart(&self) {
        if !self.is_running() {
            trace!("comet not running, restart deferred to start");
            return;
        }

        let in_flight = self.lock().take_in_flight();
        if let Some(abort) = in_flight {
            debug!("aborting in-flight long-poll");
            abort.abort();
        }
        self.schedule(Duration::ZERO);
    }

    pub(crate) fn start(&self) {
        self.shared.running.store(true, Ordering::SeqCst);
        if !self.lock().watch.is_empty() {
            self.restart();
        }
    }

    pub(crate) fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let in_flight = {
            let mut state = self.lock();
            state.invalidate();
            state.take_in_flight()
        };
        if let Some(abort) = in_flight {
            abort.abort();
        }
    }

    /// Arm an entry `delay` from now, bound to the current epoch.
    fn schedule(&self, delay: Duration) {
        let captured = self.lock().epoch();

        let Ok(runtime) = Handle::try_current() else {
            warn!("no tokio runtime, long-poll not scheduled");
            return;
        };

        let cycle = self.clone();
        runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            cycle.enter(captured);
        });
    }

    fn enter(&self, captured: u64) {
        if !self.is_running() {
            return;
        }

        let mut state = self.lock();
        let Some(issue) = state.begin(captured) else {
            trace!(captured, epoch = state.epoch(), "comet entry skipped");
            return;
        };

        let request = LongPollRequest {
            url: self.poll_url(),
            watch: issue.watch,
            timeout: self.shared.config.long_poll_timeout,
        };
        debug!(epoch = issue.epoch, url = %request.url, channels = request.watch.len(), "long-poll issued");
        // An unclaimed payload suffix does not outlive a long-poll.
        self.shared.page.take_uri_suffix();

        let cycle = self.clone();
        let epoch = issue.epoch;
        let task = tokio::spawn(async move {
            let outcome = cycle.shared.transport.long_poll(request).await;
            cycle.complete(epoch, outcome);
        });
        state.attach(epoch, task.abort_handle());
    }

    fn complete(&self, epoch: u64, outcome: Result<String, TransportError>) {
        let current = self.lock().settle(epoch);

        let config = &self.shared.config;
        let hooks = &self.shared.hooks;

        let delay = match outcome {
            Ok(body) => match Directives::parse(&body) {
                Ok(directives) if directives.session_lost => {
                    hooks.comet_on_session_lost();
                    config.long_poll_retry_interval
                }
                Ok(directives) => {
                    self.apply(directives);
                    config.long_poll_settle_delay
                }
                Err(error) => {
                    hooks.comet_on_error(&ClientError::Decode(error));
                    config.long_poll_retry_interval
                }
            },
            Err(TransportError::SessionLost) => {
                hooks.comet_on_session_lost();
                config.long_poll_retry_interval
            }
            Err(error) => {
                warn!(epoch, %error, "long-poll failed");
                config.long_poll_retry_interval
            }
        };

        if !current {
            // Whoever replaced this poll already armed the next entry.
            trace!(epoch, "superseded long-poll completed, not re-arming");
            return;
        }

        trace!(epoch, ?delay, "re-arming long-poll");
        self.schedule(delay);
    }

    /// Apply server directives: watch versions, new comets, then events.
    pub(crate) fn apply(&self, directives: Directives) {
        for (channel, version) in &directives.versions {
            self.update_version(channel, *version);
        }

        if !directives.comets.is_empty() {
            self.register(directives.comets, true);
        }

        for event in directives.events {
            self.shared.registry.send_event(event.target, event.event);
        }
    }

    fn poll_url(&self) -> String {
        let path = format!(
            "{}/{}/{}/{}",
            self.shared.config.comet_path(),
            fastrand::u64(..NONCE_RANGE),
            self.shared.page.session_id(),
            self.shared.page.page_id()
        );

        match &self.shared.config.alternate_server_origin {
            Some(origin) => format!("{origin}{path}"),
            None => path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::TracingHooks;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn post(&self, _: crate::transport::PostRequest) -> Result<String, TransportError> {
            Err(TransportError::Network("unreachable".into()))
        }

        async fn long_poll(&self, _: LongPollRequest) -> Result<String, TransportError> {
            Err(TransportError::Network("unreachable".into()))
        }
    }

    fn cycle(config: ClientConfig) -> CometCycle {
        let hooks: Arc<dyn Hooks> = Arc::new(TracingHooks);
        let page = Arc::new(PageContext::default());
        page.set_page_id("F1");
        page.set_session_id("S1");
        CometCycle::new(
            Arc::new(Unreachable),
            Arc::clone(&hooks),
            Arc::new(config),
            page,
            Registry::new(hooks),
        )
    }

    #[test]
    fn poll_url_carries_nonce_session_and_page() {
        let url = cycle(ClientConfig::default()).poll_url();
        let parts: Vec<&str> = url.split('/').collect();

        assert_eq!(parts[..3], ["", "lift", "comet"]);
        assert!(parts[3].parse::<u64>().unwrap() < NONCE_RANGE);
        assert_eq!(parts[4..], ["S1", "F1"]);
    }

    #[test]
    fn poll_url_uses_alternate_origin() {
        let config = ClientConfig {
            alternate_server_origin: Some("https://push.example.com".into()),
            ..ClientConfig::default()
        };
        let url = cycle(config).poll_url();
        assert!(url.starts_with("https://push.example.com/lift/comet/"));
        assert!(url.ends_with("/S1/F1"));
    }

    #[test]
    fn registration_before_start_does_not_poll() {
        let comet = cycle(ClientConfig::default());
        comet.register(BTreeMap::from([("A".to_string(), 1)]), true);

        assert_eq!(comet.watch_set().get("A"), Some(1));
        assert_eq!(comet.epoch(), 0);
        assert!(!comet.is_polling());
    }

    #[test]
    fn version_updates_only_touch_watched_channels() {
        let comet = cycle(ClientConfig::default());
        comet.register(BTreeMap::from([("A".to_string(), 1)]), false);

        assert!(comet.update_version("A", 4));
        assert!(!comet.update_version("B", 4));
        assert!(comet.unregister("A"));
        assert!(comet.watch_set().is_empty());
    }
}
