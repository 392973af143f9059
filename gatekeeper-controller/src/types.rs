//! CRD types for the Provider reconciler and its per-pod status pattern.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An external-data provider the policy engine should route `validating`/
/// `mutating` data lookups through. Cluster-scoped: providers are a global
/// collaborator, not namespaced per tenant.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "externaldata.gatekeeper.sh",
    version = "v1beta1",
    kind = "Provider",
    status = "ProviderStatus",
    printcolumn = r#"{"name":"Url", "type":"string", "jsonPath":".spec.url"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// The URL the provider is reached at, e.g. `https://provider.ns:8090/validate`.
    pub url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: i32,
    /// Base64-encoded PEM CA bundle used to verify the provider's TLS certificate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

fn default_timeout() -> i32 {
    3
}

/// Aggregated view of every replica's local status for this `Provider`,
/// written by the status-aggregator controller.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub by_pod: Vec<PodStatusSummary>,
}

/// One replica's summary, copied verbatim from its `ProviderPodStatus`
/// object into the parent's `.status.byPod`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodStatusSummary {
    pub id: String,
    pub active: bool,
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StatusError>,
}

/// A typed error surfaced on a per-pod status object. Two error lists are
/// considered equal iff they contain the same (kind, message) multiset;
/// order never matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub struct StatusError {
    pub kind: StatusErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum StatusErrorKind {
    ConversionError,
    UpsertCacheError,
}

/// A single replica's local view of one `Provider`, aggregated by a
/// companion controller into the `Provider`'s own `.status.byPod`.
///
/// Named by the deterministic key `KeyFor(pod_name, resource_name)` so
/// every pod owns exactly one status object per resource and reconciling
/// it is an idempotent upsert.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "externaldata.gatekeeper.sh",
    version = "v1beta1",
    kind = "ProviderPodStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPodStatusSpec {
    /// Labels carried here rather than inferred: the aggregator filters on
    /// `provider-name` and sorts on `pod-id`, both set by the reconciler
    /// when it creates or updates this object.
    pub provider_name: String,
    pub provider_uid: String,
    pub pod_id: String,
    pub active: bool,
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StatusError>,
    pub last_cache_update_time: Option<Time>,
    pub last_transition_time: Option<Time>,
}

pub const LABEL_PROVIDER_NAME: &str = "externaldata.gatekeeper.sh/provider-name";
pub const LABEL_POD_ID: &str = "externaldata.gatekeeper.sh/pod-id";

/// Deterministic name for a pod's status object against one resource.
#[must_use]
pub fn status_object_name(pod_id: &str, provider_name: &str) -> String {
    format!("{provider_name}-{pod_id}")
}

/// Labels every `ProviderPodStatus` must carry so the aggregator can
/// select its owner's full set with one label query.
#[must_use]
pub fn status_object_labels(provider_name: &str, pod_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_PROVIDER_NAME.to_owned(), provider_name.to_owned()),
        (LABEL_POD_ID.to_owned(), pod_id.to_owned()),
    ])
}

/// `true` iff `a` and `b` carry the same (kind, message) multiset,
/// regardless of order.
#[must_use]
pub fn error_sets_equal(a: &[StatusError], b: &[StatusError]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_sorted = a.to_vec();
    let mut b_sorted = b.to_vec();
    a_sorted.sort_by(|x, y| (x.kind as u8, &x.message).cmp(&(y.kind as u8, &y.message)));
    b_sorted.sort_by(|x, y| (x.kind as u8, &x.message).cmp(&(y.kind as u8, &y.message)));
    a_sorted == b_sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: StatusErrorKind, message: &str) -> StatusError {
        StatusError {
            kind,
            message: message.to_owned(),
        }
    }

    #[test]
    fn error_sets_equal_ignores_order() {
        let a = vec![
            err(StatusErrorKind::UpsertCacheError, "bad CA bundle"),
            err(StatusErrorKind::ConversionError, "missing field"),
        ];
        let b = vec![
            err(StatusErrorKind::ConversionError, "missing field"),
            err(StatusErrorKind::UpsertCacheError, "bad CA bundle"),
        ];
        assert!(error_sets_equal(&a, &b));
    }

    #[test]
    fn error_sets_not_equal_with_different_messages() {
        let a = vec![err(StatusErrorKind::UpsertCacheError, "bad CA bundle")];
        let b = vec![err(StatusErrorKind::UpsertCacheError, "different message")];
        assert!(!error_sets_equal(&a, &b));
    }

    #[test]
    fn status_object_name_is_deterministic() {
        assert_eq!(status_object_name("pod-a", "my-provider"), "my-provider-pod-a");
        assert_eq!(
            status_object_name("pod-a", "my-provider"),
            status_object_name("pod-a", "my-provider")
        );
    }
}
