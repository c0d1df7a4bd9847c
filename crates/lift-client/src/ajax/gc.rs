//! Keep-alive heartbeat.
//!
//! The server reclaims per-page resources it has not heard about for a
//! while. A no-op post at a fixed interval keeps them alive. It bypasses the
//! retry queue; a failed beat is simply retried sooner.

use super::cycle::AjaxCycle;
use crate::directives::Directives;
use crate::error::TransportError;
use crate::transport::{PostRequest, ResponseKind};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Body of every keep-alive post.
pub const GC_PAYLOAD: &str = "__lift__GC=_";

impl AjaxCycle {
    /// Spawn the heartbeat. The first beat goes out one interval from now.
    pub(crate) fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let cycle = self.clone();
        tokio::spawn(async move { cycle.heartbeat().await })
    }

    async fn heartbeat(self) {
        let config = &self.shared.config;
        let mut delay = config.gc_interval;

        loop {
            sleep(delay).await;

            delay = match self.keep_alive().await {
                Ok(()) => {
                    debug!("keep-alive acknowledged");
                    config.gc_interval
                }
                Err(error) => {
                    warn!(%error, retry_in = ?config.gc_retry_interval, "keep-alive failed");
                    config.gc_retry_interval
                }
            };
        }
    }

    /// Send one keep-alive and apply whatever the server answers with.
    async fn keep_alive(&self) -> Result<(), TransportError> {
        let post = PostRequest {
            url: self.calc_ajax_url(&self.endpoint(), None),
            payload: GC_PAYLOAD.to_string(),
            kind: ResponseKind::Script,
            timeout: self.shared.config.request_timeout,
            on_progress: None,
        };

        let outcome = self.shared.transport.post(post).await;
        let body = match outcome {
            Err(TransportError::SessionLost) => {
                self.shared.hooks.ajax_on_session_lost();
                return Err(TransportError::SessionLost);
            }
            other => other?,
        };

        let directives = Directives::parse(&body).map_err(|error| {
            self.shared
                .hooks
                .log_error(&format!("keep-alive response could not be parsed: {error}"));
            TransportError::Parse(error.to_string())
        })?;

        if directives.session_lost {
            self.shared.hooks.ajax_on_session_lost();
            return Err(TransportError::SessionLost);
        }

        self.shared.comet.apply(directives);
        Ok(())
    }
}
