//! A concurrent GVK-keyed home for [`ObjectTracker`]s with irreversible removal.

use crate::obj_data::{ObjData, ObjDataFactory};
use crate::objkey::{Gvk, ObjKey};
use crate::object_tracker::ObjectTracker;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

enum Entry {
    Live(Arc<ObjectTracker>),
    Removed,
}

/// Concurrent `Gvk -> ObjectTracker` map used for the per-kind constraint
/// and data trackers of [`crate::ready_tracker::ReadyTracker`].
///
/// `Remove` tombstones the GVK: once removed, the same map will never
/// track that GVK again.
pub struct TrackerMap {
    trackers: RwLock<HashMap<Gvk, Entry>>,
    retry_budgets: RwLock<HashMap<Gvk, ObjData>>,
    factory: ObjDataFactory,
}

impl TrackerMap {
    #[must_use]
    pub fn new(factory: ObjDataFactory) -> Self {
        Self {
            trackers: RwLock::new(HashMap::new()),
            retry_budgets: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Return the tracker for `gvk`, creating one on first access. If
    /// `gvk` has been removed, returns a handle whose operations are all
    /// no-ops and whose `satisfied()` is always `true`.
    #[must_use]
    pub fn get(&self, gvk: &Gvk) -> TrackerHandle {
        {
            let trackers = self.trackers.read();
            match trackers.get(gvk) {
                Some(Entry::Live(t)) => return TrackerHandle::Live(t.clone()),
                Some(Entry::Removed) => return TrackerHandle::Removed,
                None => {}
            }
        }
        let mut trackers = self.trackers.write();
        match trackers.get(gvk) {
            Some(Entry::Live(t)) => TrackerHandle::Live(t.clone()),
            Some(Entry::Removed) => TrackerHandle::Removed,
            None => {
                let tracker = Arc::new(ObjectTracker::new(gvk.clone(), self.factory.clone()));
                trackers.insert(gvk.clone(), Entry::Live(tracker.clone()));
                TrackerHandle::Live(tracker)
            }
        }
    }

    /// `true` if `gvk` currently has a live tracker (does not create one).
    #[must_use]
    pub fn has(&self, gvk: &Gvk) -> bool {
        matches!(self.trackers.read().get(gvk), Some(Entry::Live(_)))
    }

    /// Snapshot of every currently-live GVK. Does not include removed GVKs.
    #[must_use]
    pub fn keys(&self) -> Vec<Gvk> {
        self.trackers
            .read()
            .iter()
            .filter_map(|(gvk, e)| matches!(e, Entry::Live(_)).then(|| gvk.clone()))
            .collect()
    }

    /// Delete the tracker for `gvk` and tombstone it so it can never be
    /// re-tracked by this map again. Used when a constraint template is
    /// deleted: its dependent constraint GVK must never block readiness
    /// again.
    pub fn remove(&self, gvk: &Gvk) {
        let mut trackers = self.trackers.write();
        trackers.insert(gvk.clone(), Entry::Removed);
        info!(?gvk, "tracker removed and tombstoned");
    }

    /// Decrement a per-GVK retry budget; when exhausted, `remove` the GVK.
    pub fn try_cancel(&self, gvk: &Gvk) {
        let exhausted = {
            let mut budgets = self.retry_budgets.write();
            let mut data = budgets.remove(gvk).unwrap_or_else(|| (self.factory)());
            let exhausted = data.decrement();
            budgets.insert(gvk.clone(), data);
            exhausted
        };
        if exhausted {
            self.remove(gvk);
        }
    }

    /// Conjunction of `Satisfied()` across every live tracker. An empty
    /// map (no kinds discovered yet) is vacuously satisfied; callers that
    /// need "has discovery even run" should consult [`TrackerMap::populated`]
    /// as well.
    #[must_use]
    pub fn satisfied(&self) -> bool {
        self.trackers.read().values().all(|e| match e {
            Entry::Live(t) => t.satisfied(),
            Entry::Removed => true,
        })
    }

    /// Conjunction of `Populated()` across every live tracker.
    #[must_use]
    pub fn populated(&self) -> bool {
        self.trackers.read().values().all(|e| match e {
            Entry::Live(t) => t.populated(),
            Entry::Removed => true,
        })
    }
}

/// A handle returned by [`TrackerMap::get`]: either a live tracker or the
/// permanent no-op stand-in for a removed GVK.
pub enum TrackerHandle {
    Live(Arc<ObjectTracker>),
    Removed,
}

impl TrackerHandle {
    pub fn expect(&self, key: ObjKey, is_deleting: bool) {
        if let TrackerHandle::Live(t) = self {
            t.expect(key, is_deleting);
        }
    }

    pub fn observe(&self, key: ObjKey) {
        if let TrackerHandle::Live(t) = self {
            t.observe(key);
        }
    }

    pub fn expectations_done(&self) {
        if let TrackerHandle::Live(t) = self {
            t.expectations_done();
        }
    }

    #[must_use]
    pub fn satisfied(&self) -> bool {
        match self {
            TrackerHandle::Live(t) => t.satisfied(),
            TrackerHandle::Removed => true,
        }
    }

    /// Diagnostic count of expected-but-unobserved keys, `0` for a removed
    /// (tombstoned) GVK. Used by metrics exporters; never consulted by
    /// readiness logic itself.
    #[must_use]
    pub fn unsatisfied_count(&self) -> usize {
        match self {
            TrackerHandle::Live(t) => t.unsatisfied().len(),
            TrackerHandle::Removed => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj_data::fixed_retries_factory;

    fn gvk(kind: &str) -> Gvk {
        Gvk::gvk("constraints.gatekeeper.sh", "v1beta1", kind)
    }

    #[test]
    fn get_creates_on_first_access_and_reuses_after() {
        let map = TrackerMap::new(fixed_retries_factory(1));
        let gvk = gvk("K8sRequiredLabels");
        assert!(!map.has(&gvk));
        map.get(&gvk).expectations_done();
        assert!(map.has(&gvk));
        // Second access must hit the same tracker, not recreate it as unpopulated.
        assert!(map.get(&gvk).satisfied());
    }

    #[test]
    fn removed_gvk_returns_permanently_satisfied_noop_handle() {
        let map = TrackerMap::new(fixed_retries_factory(1));
        let gvk = gvk("K8sRequiredLabels");
        map.get(&gvk);
        map.remove(&gvk);
        assert!(!map.has(&gvk));
        let handle = map.get(&gvk);
        assert!(handle.satisfied());
        // Re-expecting under a removed GVK must stay a no-op.
        handle.expect(ObjKey::new(gvk.clone(), None, "x".into()), false);
        assert!(handle.satisfied());
    }

    #[test]
    fn removed_gvk_cannot_be_retracked() {
        let map = TrackerMap::new(fixed_retries_factory(1));
        let gvk = gvk("K8sRequiredLabels");
        map.remove(&gvk);
        assert!(!map.has(&gvk));
        map.get(&gvk); // should not resurrect it as live
        assert!(!map.has(&gvk));
    }

    #[test]
    fn aggregate_satisfied_requires_every_live_tracker() {
        let map = TrackerMap::new(fixed_retries_factory(1));
        let a = gvk("K8sRequiredLabels");
        let b = gvk("K8sAllowedRepos");
        map.get(&a).expectations_done();
        map.get(&b); // never populated
        assert!(!map.satisfied());
        map.get(&b).expectations_done();
        assert!(map.satisfied());
    }

    #[test]
    fn try_cancel_removes_after_budget_exhausted() {
        let map = TrackerMap::new(fixed_retries_factory(1));
        let gvk = gvk("K8sRequiredLabels");
        map.get(&gvk);
        assert!(map.has(&gvk));
        map.try_cancel(&gvk);
        assert!(map.has(&gvk));
        map.try_cancel(&gvk);
        assert!(!map.has(&gvk));
    }
}
