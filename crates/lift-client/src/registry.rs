//! Routes server-pushed envelopes to live deferred values.

use crate::deferred::{Deferred, DeferredId};
use crate::envelope::Envelope;
use crate::hooks::Hooks;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Deferred values the server may still address, keyed by id.
///
/// Entries are added by [`Registry::create`] and removed as soon as the value
/// settles. A removed id is never re-added, so late events for it are dropped.
#[derive(Clone)]
pub struct Registry {
    entries: Arc<DashMap<DeferredId, Deferred<Value>>>,
    hooks: Arc<dyn Hooks>,
}

impl Registry {
    pub fn new(hooks: Arc<dyn Hooks>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            hooks,
        }
    }

    /// Create a pending deferred value and make it addressable.
    pub fn create(&self) -> Deferred<Value> {
        let deferred = Deferred::with_hooks(Arc::clone(&self.hooks));
        let id = deferred.id();
        self.entries.insert(id, deferred.clone());

        // Registered before any caller listener, so the entry is gone by the
        // time user code observes the terminal state.
        let entries = Arc::downgrade(&self.entries);
        deferred.on_done(move || forget(&entries, id));
        let entries = Arc::downgrade(&self.entries);
        deferred.on_failure(move |_| forget(&entries, id));

        debug!(%id, "deferred registered");
        deferred
    }

    /// Forward `envelope` to the deferred value `id`.
    ///
    /// Returns `false` when no such value is registered; that is expected for
    /// events racing a value that already settled.
    pub fn send_event(&self, id: DeferredId, envelope: Envelope<Value>) -> bool {
        // Clone out so the map shard is unlocked before listeners run.
        let target = self.entries.get(&id).map(|entry| entry.value().clone());

        match target {
            Some(deferred) => {
                deferred.deliver(envelope);
                true
            }
            None => {
                trace!(%id, kind = envelope.kind(), "dropping event for unknown deferred");
                false
            }
        }
    }

    pub fn get(&self, id: DeferredId) -> Option<Deferred<Value>> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: DeferredId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn forget(entries: &Weak<DashMap<DeferredId, Deferred<Value>>>, id: DeferredId) {
    if let Some(entries) = entries.upgrade() {
        if entries.remove(&id).is_some() {
            debug!(%id, "deferred settled, unregistered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::TracingHooks;
    use crate::DeferredState;
    use serde_json::json;
    use std::sync::Mutex;

    fn registry() -> Registry {
        Registry::new(Arc::new(TracingHooks))
    }

    #[test]
    fn events_reach_registered_value() {
        let registry = registry();
        let deferred = registry.create();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        deferred.on_value(move |v| sink.lock().unwrap().push(v.clone()));

        assert!(registry.send_event(deferred.id(), Envelope::Success(json!("a"))));
        assert_eq!(*seen.lock().unwrap(), vec![json!("a")]);
        assert!(registry.contains(deferred.id()));
    }

    #[test]
    fn settled_values_leave_the_registry() {
        let registry = registry();
        let done = registry.create();
        let failed = registry.create();
        assert_eq!(registry.len(), 2);

        registry.send_event(done.id(), Envelope::Done);
        failed.deliver(Envelope::Failure("x".into()));

        assert!(registry.is_empty());
        assert_eq!(done.state(), DeferredState::Fulfilled);
        assert_eq!(failed.state(), DeferredState::Failed);
    }

    #[test]
    fn late_events_are_dropped_silently() {
        let registry = registry();
        let deferred = registry.create();
        registry.send_event(deferred.id(), Envelope::Done);

        assert!(!registry.send_event(deferred.id(), Envelope::Success(json!(1))));
        assert!(!registry.send_event(DeferredId::new(), Envelope::Done));
        assert!(deferred.buffered_values().is_empty());
    }

    #[test]
    fn registry_entry_gone_before_user_done_listener_runs() {
        let registry = registry();
        let deferred = registry.create();
        let observed = Arc::new(Mutex::new(None));

        let handle = registry.clone();
        let sink = Arc::clone(&observed);
        let id = deferred.id();
        deferred.on_done(move || *sink.lock().unwrap() = Some(handle.contains(id)));

        registry.send_event(id, Envelope::Done);
        assert_eq!(*observed.lock().unwrap(), Some(false));
    }
}
