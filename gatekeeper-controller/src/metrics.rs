//! Optional metrics exposed alongside `/readyz`: a readiness-flip gauge and
//! a per-GVK unsatisfied-expectation gauge, in the spirit of
//! `kube_runtime::metrics` shipping structured, optional metrics next to
//! the runtime primitives they describe.

use std::sync::Arc;

use gatekeeper_readiness::ReadyTracker;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct GvkLabels {
    gvk: String,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, EncodeLabelValue)]
enum Branch {
    Provider,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BranchLabels {
    branch: Branch,
}

/// Readiness metrics registered once at startup and updated from the
/// `/readyz` poll loop; reading them never touches the tracker's own locks
/// outside of the calls `ReadyTracker` already exposes publicly.
pub struct ReadinessMetrics {
    satisfied: Gauge,
    flipped_at_unix_seconds: Gauge,
    constraint_unsatisfied: Family<GvkLabels, Gauge>,
    data_unsatisfied: Family<GvkLabels, Gauge>,
    provider_unsatisfied: Family<BranchLabels, Gauge>,
}

impl ReadinessMetrics {
    #[must_use]
    pub fn new(registry: &mut Registry) -> Arc<Self> {
        let metrics = Arc::new(Self {
            satisfied: Gauge::default(),
            flipped_at_unix_seconds: Gauge::default(),
            constraint_unsatisfied: Family::default(),
            data_unsatisfied: Family::default(),
            provider_unsatisfied: Family::default(),
        });

        registry.register(
            "gatekeeper_readiness_satisfied",
            "1 once the readiness tracker's Satisfied() predicate holds, else 0",
            metrics.satisfied.clone(),
        );
        registry.register(
            "gatekeeper_readiness_flipped_timestamp_seconds",
            "unix timestamp at which Satisfied() was first observed true, 0 until then",
            metrics.flipped_at_unix_seconds.clone(),
        );
        registry.register(
            "gatekeeper_readiness_constraint_unsatisfied",
            "count of expected-but-unobserved keys per constraint GVK",
            metrics.constraint_unsatisfied.clone(),
        );
        registry.register(
            "gatekeeper_readiness_data_unsatisfied",
            "count of expected-but-unobserved keys per data GVK",
            metrics.data_unsatisfied.clone(),
        );
        registry.register(
            "gatekeeper_readiness_provider_unsatisfied",
            "count of expected-but-unobserved provider keys",
            metrics.provider_unsatisfied.clone(),
        );

        metrics
    }

    /// Refresh every gauge from the tracker's current public state. Called
    /// on a short poll interval; cheap relative to the lock traffic the
    /// tracker itself already does on every `Satisfied()` call.
    pub fn refresh(&self, tracker: &ReadyTracker, now_unix_seconds: i64) {
        let satisfied = tracker.satisfied();
        self.satisfied.set(if satisfied { 1 } else { 0 });
        if satisfied && self.flipped_at_unix_seconds.get() == 0 {
            self.flipped_at_unix_seconds.set(now_unix_seconds);
        }

        for gvk in tracker.constraint_trackers().keys() {
            let count = tracker.constraint_trackers().get(&gvk).unsatisfied_count();
            self.constraint_unsatisfied
                .get_or_create(&GvkLabels { gvk: gvk.to_string() })
                .set(count as i64);
        }
        for gvk in tracker.data_trackers().keys() {
            let count = tracker.data_trackers().get(&gvk).unsatisfied_count();
            self.data_unsatisfied
                .get_or_create(&GvkLabels { gvk: gvk.to_string() })
                .set(count as i64);
        }
        self.provider_unsatisfied
            .get_or_create(&BranchLabels { branch: Branch::Provider })
            .set(tracker.provider_tracker().unsatisfied().len() as i64);
    }
}

/// Render the registry in Prometheus text exposition format.
pub fn encode(registry: &Registry) -> Result<String, std::fmt::Error> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, registry)?;
    Ok(buf)
}
