//! Comet: one long-poll at a time for every watched channel.

mod cycle;
mod watch;

pub use cycle::CometCycle;
pub use watch::WatchSet;
