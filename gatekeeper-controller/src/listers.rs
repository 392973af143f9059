//! `kube::Client`-backed implementations of the readiness core's `Lister`
//! and `DynamicLister` traits.

use async_trait::async_trait;
use gatekeeper_readiness::{DataSourceSummary, DiscoveryError, Gvk, HasObjectMeta, SimpleResource, TemplateSummary};
use kube::api::DynamicObject;
use kube::discovery::{self, ApiResource};
use kube::{Api, Client};

impl HasObjectMeta for DynamicObject {
    fn object_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn object_namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

fn discovery_error(gvk: &Gvk, source: kube::Error) -> DiscoveryError {
    match &source {
        kube::Error::Api(resp) if resp.code == 404 => DiscoveryError::Unregistered { gvk: gvk.clone() },
        kube::Error::Discovery(_) => DiscoveryError::Unregistered { gvk: gvk.clone() },
        _ => DiscoveryError::Transient {
            gvk: gvk.clone(),
            source: Box::new(source),
        },
    }
}

async fn resolve(client: &Client, gvk: &Gvk) -> Result<ApiResource, DiscoveryError> {
    let (ar, _caps) = discovery::pinned_kind(client, gvk).await.map_err(|e| discovery_error(gvk, e))?;
    Ok(ar)
}

async fn list_all(client: &Client, gvk: &Gvk, namespace: Option<&str>) -> Result<Vec<DynamicObject>, DiscoveryError> {
    let ar = resolve(client, gvk).await?;
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
        None => Api::all_with(client.clone(), &ar),
    };
    let list = api
        .list(&Default::default())
        .await
        .map_err(|e| discovery_error(gvk, e))?;
    Ok(list.items)
}

fn string_field<'a>(obj: &'a DynamicObject, path: &[&str]) -> Option<&'a str> {
    let mut value = &obj.data;
    for segment in path {
        value = value.get(segment)?;
    }
    value.as_str()
}

/// Lists `ConstraintTemplate` objects and reduces each to the constraint
/// GVK it generates, per Gatekeeper convention (`constraints.gatekeeper.sh/v1beta1`).
pub struct ConstraintTemplateLister {
    client: Client,
    gvk: Gvk,
    constraints_group: String,
    constraint_version: String,
}

impl ConstraintTemplateLister {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            gvk: Gvk::gvk("templates.gatekeeper.sh", "v1", "ConstraintTemplate"),
            constraints_group: "constraints.gatekeeper.sh".to_owned(),
            constraint_version: "v1beta1".to_owned(),
        }
    }
}

#[async_trait]
impl gatekeeper_readiness::Lister<TemplateSummary> for ConstraintTemplateLister {
    type Error = DiscoveryError;

    async fn list(&self) -> Result<Vec<TemplateSummary>, Self::Error> {
        let items = list_all(&self.client, &self.gvk, None).await?;
        let mut out = Vec::with_capacity(items.len());
        for obj in items {
            let Some(kind) = string_field(&obj, &["spec", "crd", "spec", "names", "kind"]) else {
                continue;
            };
            out.push(TemplateSummary {
                name: obj.object_name().to_owned(),
                is_deleting: obj.is_deleting(),
                constraint_gvk: Gvk::gvk(&self.constraints_group, &self.constraint_version, kind),
            });
        }
        Ok(out)
    }
}

/// Lists `Config` (singleton) and `SyncSet` objects and reduces each to the
/// data GVKs named in its `spec.syncOnly`.
pub struct ConfigAndSyncSetLister {
    client: Client,
    config_gvk: Gvk,
    syncset_gvk: Gvk,
}

impl ConfigAndSyncSetLister {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            config_gvk: Gvk::gvk("config.gatekeeper.sh", "v1alpha1", "Config"),
            syncset_gvk: Gvk::gvk("syncset.gatekeeper.sh", "v1alpha1", "SyncSet"),
            client,
        }
    }

    fn sync_only_gvks(obj: &DynamicObject) -> Vec<Gvk> {
        let Some(sync_only) = obj.data.pointer("/spec/syncOnly").and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        sync_only
            .iter()
            .filter_map(|entry| {
                let group = entry.get("group").and_then(|v| v.as_str()).unwrap_or_default();
                let version = entry.get("version").and_then(|v| v.as_str())?;
                let kind = entry.get("kind").and_then(|v| v.as_str())?;
                Some(Gvk::gvk(group, version, kind))
            })
            .collect()
    }
}

#[async_trait]
impl gatekeeper_readiness::Lister<DataSourceSummary> for ConfigAndSyncSetLister {
    type Error = DiscoveryError;

    async fn list(&self) -> Result<Vec<DataSourceSummary>, Self::Error> {
        let mut out = Vec::new();
        match list_all(&self.client, &self.config_gvk, None).await {
            Ok(items) => out.extend(items.iter().map(|obj| DataSourceSummary {
                name: obj.object_name().to_owned(),
                is_deleting: obj.is_deleting(),
                data_gvks: Self::sync_only_gvks(obj),
            })),
            Err(DiscoveryError::Unregistered { .. }) => {}
            Err(e) => return Err(e),
        }
        match list_all(&self.client, &self.syncset_gvk, None).await {
            Ok(items) => out.extend(items.iter().map(|obj| DataSourceSummary {
                name: obj.object_name().to_owned(),
                is_deleting: obj.is_deleting(),
                data_gvks: Self::sync_only_gvks(obj),
            })),
            Err(DiscoveryError::Unregistered { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(out)
    }
}

/// Lists plain top-level resources (providers, mutators, expansion
/// templates) of one fixed GVK, reduced to their bare identity.
pub struct SimpleResourceLister {
    client: Client,
    gvk: Gvk,
}

impl SimpleResourceLister {
    #[must_use]
    pub fn new(client: Client, gvk: Gvk) -> Self {
        Self { client, gvk }
    }
}

#[async_trait]
impl gatekeeper_readiness::Lister<SimpleResource> for SimpleResourceLister {
    type Error = DiscoveryError;

    async fn list(&self) -> Result<Vec<SimpleResource>, Self::Error> {
        let items = list_all(&self.client, &self.gvk, None).await?;
        Ok(items
            .iter()
            .map(|obj| SimpleResource {
                name: obj.object_name().to_owned(),
                namespace: obj.object_namespace().map(str::to_owned),
                is_deleting: obj.is_deleting(),
            })
            .collect())
    }
}

/// Lists objects of a runtime-selected GVK, used for constraint kinds
/// generated by templates and data kinds named by `Config`/`SyncSet`.
pub struct ClusterDynamicLister {
    client: Client,
}

impl ClusterDynamicLister {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl gatekeeper_readiness::DynamicLister for ClusterDynamicLister {
    type Error = DiscoveryError;
    type Item = SimpleResource;

    async fn list(&self, gvk: &Gvk, for_each: &mut (dyn FnMut(Self::Item) + Send)) -> Result<(), Self::Error> {
        let items = list_all(&self.client, gvk, None).await?;
        for obj in items {
            for_each(SimpleResource {
                name: obj.object_name().to_owned(),
                namespace: obj.object_namespace().map(str::to_owned),
                is_deleting: obj.is_deleting(),
            });
        }
        Ok(())
    }
}
