//! Per-key retry budget used by the forced-cancellation paths.

use std::sync::Arc;

/// Retry budget attached to a single tracked key.
///
/// `retries < 0` means infinite: the key is never force-cancelled.
/// Otherwise each `TryCancel*` call decrements the counter by one; it
/// stops at zero rather than going negative. The first `k` calls must not
/// remove the key, the `(k+1)`-th must.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjData {
    retries: i64,
}

impl ObjData {
    /// Construct with an explicit retry count. `retries < 0` is infinite.
    #[must_use]
    pub fn new(retries: i64) -> Self {
        Self { retries }
    }

    /// Never cancels, no matter how many times `decrement` is called.
    #[must_use]
    pub fn infinite() -> Self {
        Self::new(-1)
    }

    /// Decrement the budget and report whether it is now exhausted.
    ///
    /// Returns `true` exactly once per budget -- the call that brings the
    /// counter from `1` to `0`. Further calls on an already-exhausted
    /// budget keep returning `true` (idempotent), since the caller is
    /// expected to remove the key from tracking as soon as it sees `true`.
    pub fn decrement(&mut self) -> bool {
        if self.retries < 0 {
            return false;
        }
        if self.retries == 0 {
            return true;
        }
        self.retries -= 1;
        false
    }
}

/// Supplies the initial [`ObjData`] for a newly observed key.
///
/// Constructed once (from the `readinessRetries` construction-time option)
/// and shared by every [`crate::object_tracker::ObjectTracker`] and
/// [`crate::tracker_map::TrackerMap`] that needs a fresh budget.
pub type ObjDataFactory = Arc<dyn Fn() -> ObjData + Send + Sync>;

/// Build a factory that always returns the same fixed budget.
#[must_use]
pub fn fixed_retries_factory(retries: i64) -> ObjDataFactory {
    Arc::new(move || ObjData::new(retries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_k_requires_k_plus_one_calls() {
        for k in 0..5i64 {
            let mut data = ObjData::new(k);
            for _ in 0..k {
                assert!(!data.decrement(), "budget {k} cancelled too early");
            }
            assert!(data.decrement(), "budget {k} should exhaust on call {}", k + 1);
        }
    }

    #[test]
    fn infinite_budget_never_exhausts() {
        let mut data = ObjData::infinite();
        for _ in 0..10_000 {
            assert!(!data.decrement());
        }
    }
}
