//! The client facade: one Ajax cycle, one Comet cycle and one registry
//! sharing a transport, hooks and page identity.

use crate::ajax::{AjaxCycle, AjaxRequest, AjaxResponse, AjaxVersion, Enqueued};
use crate::comet::{CometCycle, WatchSet};
use crate::config::{ClientConfig, PageContext, PageIdentity};
use crate::deferred::{Deferred, DeferredId};
use crate::envelope::Envelope;
use crate::error::{AjaxError, ClientError};
use crate::hooks::{Hooks, TracingHooks};
use crate::registry::Registry;
use crate::transport::{ResponseKind, Transport};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Builder for [`Client`].
///
/// ```no_run
/// # use lift_client::{ClientBuilder, ClientConfig, Transport};
/// # fn wire(transport: impl Transport) {
/// let client = ClientBuilder::new(transport)
///     .with_config(ClientConfig {
///         retry_budget: 5,
///         ..ClientConfig::default()
///     })
///     .build();
/// # }
/// ```
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    hooks: Arc<dyn Hooks>,
}

impl ClientBuilder {
    pub fn new(transport: impl Transport) -> Self {
        Self {
            transport: Arc::new(transport),
            config: ClientConfig::default(),
            hooks: Arc::new(TracingHooks),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default logging-only hooks.
    pub fn with_hooks(mut self, hooks: impl Hooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn build(self) -> Client {
        let config = Arc::new(self.config);
        let page = Arc::new(PageContext::default());
        let registry = Registry::new(Arc::clone(&self.hooks));

        let comet = CometCycle::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.hooks),
            Arc::clone(&config),
            Arc::clone(&page),
            registry.clone(),
        );
        let ajax = AjaxCycle::new(
            self.transport,
            Arc::clone(&self.hooks),
            Arc::clone(&config),
            Arc::clone(&page),
            comet.clone(),
        );

        Client {
            inner: Arc::new(ClientInner {
                config,
                hooks: self.hooks,
                page,
                registry,
                comet,
                ajax,
                gc_started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

struct ClientInner {
    config: Arc<ClientConfig>,
    hooks: Arc<dyn Hooks>,
    page: Arc<PageContext>,
    registry: Registry,
    comet: CometCycle,
    ajax: AjaxCycle,
    gc_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running client. Clones share everything.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(transport: impl Transport) -> ClientBuilder {
        ClientBuilder::new(transport)
    }

    /// Adopt the page identity and start both cycles.
    ///
    /// Must be called from within a tokio runtime. The keep-alive starts too
    /// when GC is enabled and the page id is known; initial channels trigger
    /// an immediate long-poll.
    pub fn start(&self, identity: PageIdentity) -> Result<(), ClientError> {
        Handle::try_current().map_err(|_| ClientError::NotRunning)?;

        let PageIdentity {
            page_id,
            session_id,
            channels,
        } = identity;
        info!(%page_id, channels = channels.len(), "starting lift client");

        self.inner.page.set_page_id(page_id);
        self.inner.page.set_session_id(session_id);

        if let Some(driver) = self.inner.ajax.spawn() {
            self.track(driver);
        }
        if self.inner.config.gc_enabled && !self.inner.page.page_id().is_empty() {
            self.start_gc()?;
        }

        self.inner.comet.register(channels, false);
        self.inner.comet.start();
        Ok(())
    }

    /// Stop every task. The request on the wire and those still queued fail
    /// with [`AjaxError::Cancelled`]. The client may be started again.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }

        self.inner.gc_started.store(false, Ordering::SeqCst);
        self.inner.comet.stop();
        self.inner.ajax.stop();
        info!("lift client shut down");
    }

    fn track(&self, task: JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    // ------------------------------------------------------------------
    // Ajax
    // ------------------------------------------------------------------

    /// Queue a request. See [`AjaxRequest`] for the callbacks.
    pub fn ajax(&self, request: AjaxRequest) -> Enqueued {
        self.inner.ajax.enqueue(request)
    }

    /// Queue a request and wait for its final outcome.
    pub async fn request(
        &self,
        payload: impl Into<String>,
        kind: ResponseKind,
    ) -> Result<AjaxResponse, AjaxError> {
        self.inner.ajax.request(payload, kind).await
    }

    /// Start the keep-alive heartbeat. Later calls do nothing.
    pub fn start_gc(&self) -> Result<(), ClientError> {
        Handle::try_current().map_err(|_| ClientError::NotRunning)?;
        if self.inner.gc_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!(interval = ?self.inner.config.gc_interval, "keep-alive started");
        let heartbeat = self.inner.ajax.spawn_heartbeat();
        self.track(heartbeat);
        Ok(())
    }

    pub fn calc_ajax_url(&self, url: &str, version: Option<AjaxVersion>) -> String {
        self.inner.ajax.calc_ajax_url(url, version)
    }

    pub fn set_uri_suffix(&self, suffix: impl Into<String>) {
        self.inner.ajax.set_uri_suffix(suffix);
    }

    pub fn set_page_id(&self, page_id: impl Into<String>) {
        self.inner.page.set_page_id(page_id);
    }

    pub fn page_id(&self) -> String {
        self.inner.page.page_id()
    }

    // ------------------------------------------------------------------
    // Comet
    // ------------------------------------------------------------------

    pub fn register_channels(&self, channels: BTreeMap<String, i64>, restart: bool) {
        self.inner.comet.register(channels, restart);
    }

    pub fn unregister_channel(&self, channel: &str) -> bool {
        self.inner.comet.unregister(channel)
    }

    pub fn update_channel_version(&self, channel: &str, version: i64) -> bool {
        self.inner.comet.update_version(channel, version)
    }

    pub fn replace_watch_set(&self, watch: WatchSet) {
        self.inner.comet.replace_watch_set(watch);
    }

    // ------------------------------------------------------------------
    // Deferred values
    // ------------------------------------------------------------------

    /// Create a deferred value the server can address by its id.
    pub fn create_deferred(&self) -> Deferred<Value> {
        self.inner.registry.create()
    }

    pub fn send_event(&self, id: DeferredId, envelope: Envelope<Value>) -> bool {
        self.inner.registry.send_event(id, envelope)
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    // ------------------------------------------------------------------
    // Host pass-throughs
    // ------------------------------------------------------------------

    pub fn log_error(&self, message: &str) {
        self.inner.hooks.log_error(message);
    }

    pub fn ajax_on_session_lost(&self) {
        self.inner.hooks.ajax_on_session_lost();
    }

    pub fn comet_on_session_lost(&self) {
        self.inner.hooks.comet_on_session_lost();
    }

    pub fn comet_on_error(&self, error: &ClientError) {
        self.inner.hooks.comet_on_error(error);
    }

    pub fn ajax_cycle(&self) -> &AjaxCycle {
        &self.inner.ajax
    }

    pub fn comet_cycle(&self) -> &CometCycle {
        &self.inner.comet
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::{LongPollRequest, PostRequest};
    use async_trait::async_trait;

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn post(&self, _: PostRequest) -> Result<String, TransportError> {
            Err(TransportError::Network("offline".into()))
        }

        async fn long_poll(&self, _: LongPollRequest) -> Result<String, TransportError> {
            Err(TransportError::Network("offline".into()))
        }
    }

    #[test]
    fn start_outside_runtime_is_refused() {
        let client = ClientBuilder::new(Offline).build();
        let err = client.start(PageIdentity::new("F1", "S1")).unwrap_err();
        assert!(matches!(err, ClientError::NotRunning));
    }

    #[test]
    fn page_id_can_change_before_start() {
        let client = Client::builder(Offline).build();
        client.set_page_id("F9");
        assert_eq!(client.page_id(), "F9");
        assert_eq!(client.calc_ajax_url("/lift/ajax/", None), "/lift/ajax/F9/");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_queued_requests() {
        let config = ClientConfig {
            gc_enabled: false,
            ..ClientConfig::default()
        };
        let client = Client::builder(Offline).with_config(config).build();

        // Not started, so the request stays queued until shutdown.
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.request("a=1", ResponseKind::Json).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(client.ajax_cycle().queue_len(), 1);

        client.shutdown();
        assert_eq!(pending.await.unwrap().unwrap_err(), AjaxError::Cancelled);
    }
}
