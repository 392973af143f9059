//! Aggregates every replica's `ProviderPodStatus` into its owning
//! `Provider`'s `.status.byPod`.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{error, info, instrument};

use crate::error::Result;
use crate::types::{PodStatusSummary, Provider, ProviderPodStatus, LABEL_PROVIDER_NAME};

#[derive(Clone)]
pub struct Context {
    pub client: Client,
}

#[instrument(skip(client))]
pub async fn run(client: Client) {
    let providers: Api<Provider> = Api::all(client.clone());
    info!("starting provider status aggregator");
    Controller::new(providers, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(Context { client }))
        .filter_map(|res| async move { res.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
    info!("status aggregator shutdown complete");
}

#[instrument(skip(provider, ctx), fields(provider_name = %provider.name_any()))]
async fn reconcile(provider: Arc<Provider>, ctx: Arc<Context>) -> Result<Action> {
    let name = provider.name_any();
    let uid = provider.uid().unwrap_or_default();
    let status_api: Api<ProviderPodStatus> = Api::all(ctx.client.clone());

    let selector = format!("{LABEL_PROVIDER_NAME}={name}");
    let pod_statuses = status_api.list(&ListParams::default().labels(&selector)).await?;

    // Discard leftovers from a recreated resource: a status object whose
    // `provider_uid` doesn't match the current object's UID belongs to a
    // provider of the same name that has since been deleted and re-created.
    let mut by_pod: Vec<PodStatusSummary> = pod_statuses
        .items
        .iter()
        .filter(|ps| ps.spec.provider_uid == uid)
        .map(|ps| PodStatusSummary {
            id: ps.spec.pod_id.clone(),
            active: ps.spec.active,
            observed_generation: ps.spec.observed_generation,
            errors: ps.spec.errors.clone(),
        })
        .collect();
    by_pod.sort_by(|a, b| a.id.cmp(&b.id));

    let providers: Api<Provider> = Api::all(ctx.client.clone());
    let patch = json!({ "status": { "byPod": by_pod } });
    providers
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;

    Ok(Action::requeue(Duration::from_secs(30)))
}

#[instrument(skip(object, err, _ctx))]
fn error_policy(object: Arc<Provider>, err: &crate::error::Error, _ctx: Arc<Context>) -> Action {
    error!(error = %err, provider = %object.name_any(), "status aggregation failed");
    Action::requeue(Duration::from_secs(60))
}
