//! # lift-client
//!
//! Client-side request scheduling for a Lift page: talks to the server over
//! two independent channels and routes server-pushed values to listeners.
//!
//! ## Core Concepts
//!
//! - **Ajax** ([`AjaxCycle`]): fire-and-retry posts. Requests go out one at a
//!   time in due-time order; failures come back after 1s, 2s, 4s ... until the
//!   retry budget is spent.
//! - **Comet** ([`CometCycle`]): a single long-poll watching a set of channels,
//!   re-issued after every answer and restarted when the set grows.
//! - **Deferred values** ([`Deferred`], [`Registry`]): broadcasters that buffer
//!   everything they receive and replay it to late listeners. The server
//!   addresses them by [`DeferredId`].
//!
//! ## Architecture
//!
//! ```text
//! host ── ajax()/request() ──► AjaxCycle ──── Transport::post ─────┐
//!   │                              ▲                                │
//!   │                              └── keep-alive (every 75s)       │
//!   │                                                               ▼
//!   ├─ register_channels() ──► CometCycle ── Transport::long_poll ─► Directives
//!   │                                                               │
//!   └─ create_deferred() ────► Registry ◄──── events ───────────────┤
//!                                              versions / comets ───┘
//! ```
//!
//! Both cycles share a [`Transport`] and a [`Hooks`] implementation supplied
//! by the host. Only one Ajax post and one long-poll are ever in flight.
//!
//! ## Example
//!
//! ```no_run
//! use lift_client::{ClientBuilder, PageIdentity, ResponseKind, Transport};
//!
//! async fn run(transport: impl Transport) -> anyhow::Result<()> {
//!     let client = ClientBuilder::new(transport).build();
//!     client.start(PageIdentity::new("F1234", "S99").with_channel("CHAT", 0))?;
//!
//!     let deferred = client.create_deferred();
//!     deferred.on_value(|value| println!("pushed: {value}"));
//!
//!     let response = client
//!         .request(format!("F42={}", deferred.id()), ResponseKind::Json)
//!         .await?;
//!     println!("{response:?}");
//!     Ok(())
//! }
//! ```

pub mod ajax;
mod client;
pub mod comet;
mod config;
mod deferred;
mod directives;
mod envelope;
mod error;
mod hooks;
mod registry;
mod transport;

pub use ajax::{
    backoff_delay, calc_ajax_url, AjaxCycle, AjaxRequest, AjaxResponse, AjaxVersion,
    BusyTransition, Enqueued,
};
pub use client::{Client, ClientBuilder};
pub use comet::{CometCycle, WatchSet};
pub use config::{ClientConfig, PageIdentity};
pub use deferred::{Deferred, DeferredId, DeferredState};
pub use directives::{Directives, PushedEvent};
pub use envelope::{Envelope, FailureReason};
pub use error::{AjaxError, ClientError, TransportError};
pub use hooks::{Hooks, TracingHooks};
pub use registry::Registry;
pub use transport::{LongPollRequest, PostRequest, Progress, ProgressFn, ResponseKind, Transport};

// Re-export for implementing Transport and Hooks downstream.
pub use async_trait::async_trait;
