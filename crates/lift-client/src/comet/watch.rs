//! Watched channels and the epoch guard of the long-poll loop.

use std::collections::btree_map::{self, BTreeMap};
use tokio::task::AbortHandle;

/// Channel id to the last version the client has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSet {
    channels: BTreeMap<String, i64>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, channel: &str) -> Option<i64> {
        self.channels.get(channel).copied()
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Add or overwrite channels.
    pub fn merge<I>(&mut self, channels: I)
    where
        I: IntoIterator<Item = (String, i64)>,
    {
        self.channels.extend(channels);
    }

    pub fn remove(&mut self, channel: &str) -> Option<i64> {
        self.channels.remove(channel)
    }

    /// Set the version of a channel that is already watched.
    pub fn update(&mut self, channel: &str, version: i64) -> bool {
        match self.channels.get_mut(channel) {
            Some(current) => {
                *current = version;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, i64> {
        self.channels.iter()
    }

    pub fn to_map(&self) -> BTreeMap<String, i64> {
        self.channels.clone()
    }
}

impl From<BTreeMap<String, i64>> for WatchSet {
    fn from(channels: BTreeMap<String, i64>) -> Self {
        Self { channels }
    }
}

impl FromIterator<(String, i64)> for WatchSet {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        Self {
            channels: iter.into_iter().collect(),
        }
    }
}

/// Long-poll that was just authorised by [`CometState::begin`].
#[derive(Debug)]
pub(crate) struct Issue {
    pub(crate) epoch: u64,
    pub(crate) watch: BTreeMap<String, i64>,
}

struct InFlight {
    epoch: u64,
    abort: AbortHandle,
}

/// Everything the comet cycle mutates.
#[derive(Default)]
pub(crate) struct CometState {
    pub(crate) watch: WatchSet,
    epoch: u64,
    in_flight: Option<InFlight>,
}

impl CometState {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn is_polling(&self) -> bool {
        self.in_flight.is_some()
    }

    /// A scheduled entry fired with the epoch it captured. Issue a poll only
    /// if there is something to watch and no newer poll has been issued
    /// since the entry was armed.
    pub(crate) fn begin(&mut self, captured: u64) -> Option<Issue> {
        if self.watch.is_empty() || captured != self.epoch {
            return None;
        }

        self.epoch = self.epoch.wrapping_add(1);
        Some(Issue {
            epoch: self.epoch,
            watch: self.watch.to_map(),
        })
    }

    pub(crate) fn attach(&mut self, epoch: u64, abort: AbortHandle) {
        self.in_flight = Some(InFlight { epoch, abort });
    }

    /// The poll issued at `epoch` came back. Returns `false` when that poll
    /// is no longer the current one (restarted, superseded or stopped); its
    /// completion must not re-arm the cycle.
    pub(crate) fn settle(&mut self, epoch: u64) -> bool {
        if self.in_flight.as_ref().is_some_and(|f| f.epoch == epoch) {
            self.in_flight = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn take_in_flight(&mut self) -> Option<AbortHandle> {
        self.in_flight.take().map(|f| f.abort)
    }

    /// Make every armed entry stale.
    pub(crate) fn invalidate(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
    }
}
