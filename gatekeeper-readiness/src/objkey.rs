//! Value identity for a tracked resource.

use kube::api::GroupVersionKind;
use std::fmt::{self, Display};

/// A (group, version, kind) triple, used to key [`crate::tracker_map::TrackerMap`]
/// and to select a [`crate::lister::DynamicLister`] target.
///
/// This is a thin alias over [`kube::api::GroupVersionKind`] rather than a
/// home-grown type: the cluster's discovery data already produces one of
/// these for every kind we care about, and reusing it means a `Gvk` derived
/// from a live object and one built by hand from a `Config.syncOnly` entry
/// compare equal without any extra normalization step.
pub type Gvk = GroupVersionKind;

/// Anything with enough object metadata to be identified and tracked.
///
/// Implemented for `kube::Resource`-bound types via a blanket impl in
/// `gatekeeper-controller`; kept minimal here so the core crate never has
/// to know about `DynamicObject`, `Api`, or any wire format.
pub trait HasObjectMeta {
    /// The object's name. Panics are the caller's problem -- objects
    /// returned by the API server always have one.
    fn object_name(&self) -> &str;
    /// The object's namespace, if the kind is namespaced.
    fn object_namespace(&self) -> Option<&str>;
    /// `true` once a deletion has been requested (`deletionTimestamp` set).
    fn is_deleting(&self) -> bool;
}

/// A value identity for a tracked resource: (group, version, kind, namespace, name).
///
/// Two keys are equal iff all fields equal. For `ConstraintTemplate` objects
/// the GVK is re-keyed to the *constraint GVK* the template generates (see
/// [`constraint_gvk_for_template`]), so templates and their child
/// constraints share one identity space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjKey {
    gvk: Gvk,
    namespace: Option<String>,
    name: String,
}

impl ObjKey {
    /// Build a key directly from a GVK and a name/namespace pair.
    ///
    /// Prefer [`ObjKey::from_obj`] when an object is available; this
    /// constructor exists for callers (like the constraint-template
    /// re-keying) that must build a key whose GVK doesn't match the
    /// concrete object's own kind.
    #[must_use]
    pub fn new(gvk: Gvk, namespace: Option<String>, name: String) -> Self {
        Self { gvk, namespace, name }
    }

    /// Derive a key from an object and its GVK.
    #[must_use]
    pub fn from_obj(obj: &impl HasObjectMeta, gvk: Gvk) -> Self {
        Self {
            gvk,
            namespace: obj.object_namespace().map(str::to_owned),
            name: obj.object_name().to_owned(),
        }
    }

    #[must_use]
    pub fn gvk(&self) -> &Gvk {
        &self.gvk
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}/{}",
            self.gvk.kind, self.gvk.version, self.gvk.group, self.name
        )?;
        if let Some(ns) = &self.namespace {
            write!(f, ".{ns}")?;
        }
        Ok(())
    }
}

/// Minimal description of a `ConstraintTemplate`, enough to compute the
/// constraint GVK it generates without depending on the constraint
/// framework's own types.
pub struct ConstraintTemplateDescriptor<'a> {
    /// The API group constraints live under, e.g. `constraints.gatekeeper.sh`.
    pub constraints_group: &'a str,
    /// The version constraints of this kind are served at.
    pub constraint_version: &'a str,
    /// The CRD `kind` the template declares it generates (`spec.crd.spec.names.kind`).
    pub crd_kind: &'a str,
}

/// Re-key a `ConstraintTemplate` object's GVK to the constraint GVK it
/// generates.
///
/// This is what lets the templates tracker be satisfied by constraint-kind
/// observations instead of template-name observations, and what lets
/// `CancelTemplate` purge the derived constraint-kind tracker without a
/// second lookup layer.
#[must_use]
pub fn constraint_gvk_for_template(desc: &ConstraintTemplateDescriptor<'_>) -> Gvk {
    Gvk::gvk(desc.constraints_group, desc.constraint_version, desc.crd_kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        name: String,
        namespace: Option<String>,
        deleting: bool,
    }

    impl HasObjectMeta for Fake {
        fn object_name(&self) -> &str {
            &self.name
        }

        fn object_namespace(&self) -> Option<&str> {
            self.namespace.as_deref()
        }

        fn is_deleting(&self) -> bool {
            self.deleting
        }
    }

    fn gvk(kind: &str) -> Gvk {
        Gvk::gvk("constraints.gatekeeper.sh", "v1beta1", kind)
    }

    #[test]
    fn equal_iff_all_fields_equal() {
        let a = ObjKey::new(gvk("K8sRequiredLabels"), Some("ns".into()), "c1".into());
        let b = ObjKey::new(gvk("K8sRequiredLabels"), Some("ns".into()), "c1".into());
        let c = ObjKey::new(gvk("K8sRequiredLabels"), None, "c1".into());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn display_matches_expected_format() {
        let key = ObjKey::new(gvk("K8sRequiredLabels"), Some("team-a".into()), "ns-must-have-gk".into());
        assert_eq!(
            key.to_string(),
            "K8sRequiredLabels.v1beta1.constraints.gatekeeper.sh/ns-must-have-gk.team-a"
        );
    }

    #[test]
    fn constraint_gvk_rewrite_uses_crd_kind() {
        let desc = ConstraintTemplateDescriptor {
            constraints_group: "constraints.gatekeeper.sh",
            constraint_version: "v1beta1",
            crd_kind: "K8sRequiredLabels",
        };
        let rewritten = constraint_gvk_for_template(&desc);
        let from_obj = ObjKey::from_obj(
            &Fake {
                name: "ns-must-have-gk".into(),
                namespace: None,
                deleting: false,
            },
            rewritten,
        );
        assert_eq!(from_obj.gvk().kind, "K8sRequiredLabels");
        assert_eq!(from_obj.gvk().group, "constraints.gatekeeper.sh");
    }
}
