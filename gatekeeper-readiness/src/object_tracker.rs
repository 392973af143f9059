//! Per-GVK expectation set with a one-way satisfied latch.

use crate::obj_data::{ObjData, ObjDataFactory};
use crate::objkey::{Gvk, ObjKey};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Default)]
struct State {
    expect: HashSet<ObjKey>,
    seen: HashSet<ObjKey>,
    satisfied: HashSet<ObjKey>,
    cancelled: HashSet<ObjKey>,
    try_cancelled: HashMap<ObjKey, ObjData>,
    populated: bool,
    all_satisfied: bool,
}

impl State {
    /// Invariant: once `all_satisfied` flips, the four key-sets are
    /// released and never repopulated.
    fn release_key_sets(&mut self) {
        self.expect = HashSet::new();
        self.seen = HashSet::new();
        self.satisfied = HashSet::new();
        self.cancelled = HashSet::new();
        self.try_cancelled = HashMap::new();
    }
}

/// Tracks expectations for a single resource kind and reports, monotonically,
/// whether every expected key has been observed.
///
/// All mutating operations take a single [`parking_lot::RwLock`] write
/// guard; readers (`populated`/`satisfied`) take the read lock first and
/// only upgrade to a write lock when a mutation (the circuit-breaker flip)
/// is actually required
pub struct ObjectTracker {
    gvk: Gvk,
    state: RwLock<State>,
    factory: ObjDataFactory,
}

impl ObjectTracker {
    #[must_use]
    pub fn new(gvk: Gvk, factory: ObjDataFactory) -> Self {
        Self {
            gvk,
            state: RwLock::new(State::default()),
            factory,
        }
    }

    #[must_use]
    pub fn gvk(&self) -> &Gvk {
        &self.gvk
    }

    /// Add `key` to the expectation set.
    ///
    /// Silently rejected if: the tracker is already populated; the object
    /// carries a deletion timestamp (`is_deleting`); the key has already
    /// been cancelled; or the key is already satisfied. A key already
    /// present in `seen` resolves immediately to `satisfied`.
    pub fn expect(&self, key: ObjKey, is_deleting: bool) {
        if is_deleting {
            return;
        }
        let mut state = self.state.write();
        if state.all_satisfied || state.populated {
            return;
        }
        if state.cancelled.contains(&key) || state.satisfied.contains(&key) {
            return;
        }
        if state.seen.remove(&key) {
            debug!(gvk = ?self.gvk, %key, "expectation resolved from a prior observation");
            state.satisfied.insert(key);
        } else {
            state.expect.insert(key);
        }
    }

    /// Mark `key` as observed. If a matching expectation exists it is
    /// moved to `satisfied`; otherwise, if the tracker is already
    /// populated, the observation is discarded; otherwise it is held in
    /// `seen` for a future `expect`.
    pub fn observe(&self, key: ObjKey) {
        let mut state = self.state.write();
        if state.all_satisfied {
            return;
        }
        if state.expect.remove(&key) {
            state.satisfied.insert(key);
        } else if !state.populated {
            state.seen.insert(key);
        }
        // populated && not expected: discard.
    }

    /// Remove `key` from expect/seen/satisfied and add it to `cancelled`.
    /// No-op after the circuit breaker has tripped. Once cancelled,
    /// a key is never expected again.
    pub fn cancel_expect(&self, key: &ObjKey) {
        let mut state = self.state.write();
        if state.all_satisfied {
            return;
        }
        state.expect.remove(key);
        state.seen.remove(key);
        state.satisfied.remove(key);
        state.try_cancelled.remove(key);
        state.cancelled.insert(key.clone());
        debug!(gvk = ?self.gvk, %key, "expectation cancelled");
    }

    /// Like [`ObjectTracker::cancel_expect`], but only cancels once the
    /// key's retry budget is exhausted. Each call decrements the budget
    /// (an infinite budget never cancels). The budget persists per key
    /// even before the key has been `expect`-ed.
    ///
    /// Respects the circuit breaker: once `all_satisfied`, this is a
    /// no-op and does not consume budget.
    pub fn try_cancel_expect(&self, key: &ObjKey) {
        let should_cancel = {
            let mut state = self.state.write();
            if state.all_satisfied {
                return;
            }
            let mut data = state
                .try_cancelled
                .remove(key)
                .unwrap_or_else(|| (self.factory)());
            let exhausted = data.decrement();
            state.try_cancelled.insert(key.clone(), data);
            exhausted
        };
        if should_cancel {
            self.cancel_expect(key);
        }
    }

    /// Transition to `populated`. After this call, new `expect`
    /// invocations are rejected.
    pub fn expectations_done(&self) {
        let mut state = self.state.write();
        state.populated = true;
        debug!(gvk = ?self.gvk, outstanding = state.expect.len(), "expectations done");
    }

    #[must_use]
    pub fn populated(&self) -> bool {
        self.state.read().populated
    }

    /// Double-checked evaluation of the monotonic satisfied latch: once
    /// `populated && expect.is_empty()`, the four key-sets are released
    /// and every later call returns `true` without touching shared state
    /// again.
    #[must_use]
    pub fn satisfied(&self) -> bool {
        {
            let state = self.state.read();
            if state.all_satisfied {
                return true;
            }
            if !(state.populated && state.expect.is_empty()) {
                return false;
            }
        }
        let mut state = self.state.write();
        if !state.all_satisfied && state.populated && state.expect.is_empty() {
            state.all_satisfied = true;
            state.release_key_sets();
            debug!(gvk = ?self.gvk, "tracker satisfied, key sets released");
        }
        state.all_satisfied
    }

    /// Diagnostic list of keys still expected but not yet observed.
    #[must_use]
    pub fn unsatisfied(&self) -> Vec<ObjKey> {
        self.state.read().expect.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj_data::fixed_retries_factory;

    fn gvk() -> Gvk {
        Gvk::gvk("constraints.gatekeeper.sh", "v1beta1", "K8sRequiredLabels")
    }

    fn key(name: &str) -> ObjKey {
        ObjKey::new(gvk(), None, name.to_owned())
    }

    fn tracker() -> ObjectTracker {
        ObjectTracker::new(gvk(), fixed_retries_factory(2))
    }

    #[test]
    fn unpopulated_tracker_is_never_satisfied_even_when_empty() {
        let t = tracker();
        assert!(!t.satisfied());
    }

    #[test]
    fn populated_tracker_with_empty_expect_is_satisfied_immediately() {
        let t = tracker();
        t.expectations_done();
        assert!(t.satisfied());
    }

    #[test]
    fn expect_then_observe_then_done_is_satisfied() {
        let t = tracker();
        t.expect(key("a"), false);
        t.observe(key("a"));
        t.expectations_done();
        assert!(t.satisfied());
    }

    #[test]
    fn observe_before_expect_commutes_with_expect_before_observe() {
        let t = tracker();
        t.observe(key("a"));
        t.expect(key("a"), false);
        t.expectations_done();
        assert!(t.satisfied());
    }

    #[test]
    fn deletion_timestamped_object_is_not_expected() {
        let t = tracker();
        t.expect(key("a"), true);
        t.expectations_done();
        assert!(t.satisfied());
    }

    #[test]
    fn cancellation_is_immune_to_later_expect() {
        let t = tracker();
        t.expect(key("a"), false);
        t.cancel_expect(&key("a"));
        t.expect(key("a"), false);
        t.expectations_done();
        assert!(t.satisfied());
    }

    #[test]
    fn forced_cancellation_under_retry_budget() {
        let t = tracker();
        t.expect(key("a"), false);
        t.expectations_done();
        assert!(!t.satisfied());
        t.try_cancel_expect(&key("a"));
        assert!(!t.satisfied());
        t.try_cancel_expect(&key("a"));
        assert!(!t.satisfied());
        t.try_cancel_expect(&key("a"));
        assert!(t.satisfied());
        assert!(t.unsatisfied().is_empty());
    }

    #[test]
    fn satisfied_releases_key_sets_so_unsatisfied_is_empty() {
        let t = tracker();
        t.expectations_done();
        assert!(t.satisfied());
        t.observe(key("late"));
        assert!(t.unsatisfied().is_empty());
        assert!(t.satisfied());
    }

    #[test]
    fn monotonic_once_satisfied_stays_satisfied_under_late_additions() {
        let t = tracker();
        t.expectations_done();
        assert!(t.satisfied());
        t.expect(key("late"), false);
        assert!(t.satisfied());
    }
}
