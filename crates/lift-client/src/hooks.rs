//! Host-supplied collaborators for logging and UI feedback.

use crate::error::{AjaxError, ClientError};
use tracing::{debug, error, warn};

/// Callbacks the client makes into its host.
///
/// Every method has a default that only logs, so hosts override what they
/// care about:
///
/// ```
/// use lift_client::Hooks;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// #[derive(Default)]
/// struct Spinner(AtomicBool);
///
/// impl Hooks for Spinner {
///     fn ajax_on_start(&self) {
///         self.0.store(true, Ordering::SeqCst);
///     }
///     fn ajax_on_end(&self) {
///         self.0.store(false, Ordering::SeqCst);
///     }
/// }
/// ```
pub trait Hooks: Send + Sync + 'static {
    /// Report a non-fatal problem (listener panics, unparsable responses).
    fn log_error(&self, message: &str) {
        error!(message, "lift client error");
    }

    /// The Ajax queue went from idle to busy.
    fn ajax_on_start(&self) {}

    /// The Ajax queue went from busy to idle.
    fn ajax_on_end(&self) {}

    /// A request failed for good and carried no failure callback of its own.
    fn ajax_on_failure(&self, error: &AjaxError) {
        warn!(%error, "the server cannot be contacted at this time");
    }

    /// The server no longer knows the session used for Ajax.
    fn ajax_on_session_lost(&self) {
        warn!("ajax session lost");
    }

    /// The server no longer knows the session used for Comet.
    fn comet_on_session_lost(&self) {
        warn!("comet session lost");
    }

    /// A long-poll response could not be processed.
    fn comet_on_error(&self, error: &ClientError) {
        error!(%error, "comet error");
    }
}

/// Hooks that only log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHooks;

impl Hooks for TracingHooks {
    fn ajax_on_start(&self) {
        debug!("ajax busy");
    }

    fn ajax_on_end(&self) {
        debug!("ajax idle");
    }
}
