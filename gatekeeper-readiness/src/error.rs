//! Error taxonomy for the readiness core.
//!
//! None of these are ever returned from `Expect`/`Observe`/`Satisfied` --
//! the object tracker is infallible at that boundary by design. They exist
//! so that discovery loops and the top-level `Run` can distinguish
//! terminal conditions (an unregistered kind) from retryable ones, and so
//! that fail-close mode has something concrete to propagate.

use crate::objkey::Gvk;

/// Non-fatal conditions logged by [`crate::object_tracker::ObjectTracker`]
/// when an accessor on a supposedly well-formed object fails.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The object handed to `Expect`/`Observe` had no name, which should
    /// be impossible for anything returned by the API server.
    #[error("object of kind {gvk:?} is missing a name")]
    MissingName { gvk: Gvk },
}

/// A classified discovery-loop failure.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Listing succeeded in reaching the API server, but it returned an
    /// error for this GVK specifically (typically "kind not registered").
    /// Terminal: retrying will not help, this GVK does not exist.
    #[error("kind {gvk:?} is not registered with the API server")]
    Unregistered { gvk: Gvk },
    /// A transient failure (network error, server error, rate limit).
    /// Retryable under backoff.
    #[error("failed to list {gvk:?}: {source}")]
    Transient {
        gvk: Gvk,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The parent context was cancelled while listing was in flight.
    #[error("listing {gvk:?} was cancelled")]
    Cancelled { gvk: Gvk },
}

impl DiscoveryError {
    /// `true` for conditions that must not be retried.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, DiscoveryError::Unregistered { .. } | DiscoveryError::Cancelled { .. })
    }
}

/// Failure of the top-level [`crate::ready_tracker::ReadyTracker::run`].
///
/// Only ever produced in fail-close mode; in fail-open mode the same
/// conditions are logged and absorbed instead.
#[derive(Debug, thiserror::Error)]
pub enum ReadyTrackerError {
    #[error("discovery failed for {branch}: {source}")]
    Discovery {
        branch: &'static str,
        #[source]
        source: DiscoveryError,
    },
    #[error("{0} discovery tasks failed")]
    Aggregate(usize),
}
