//! Ajax: the ordered, retrying request queue and its keep-alive.

mod cycle;
mod gc;
mod queue;
mod request;
mod url;

pub use cycle::AjaxCycle;
pub use gc::GC_PAYLOAD;
pub use queue::{backoff_delay, AjaxVersion, BusyTransition, MAX_REPORTED_DEPTH, MAX_VERSION};
pub use request::{AjaxRequest, AjaxResponse, Enqueued, FailureFn, SuccessFn};
pub use url::{calc_ajax_url, to_base36};
