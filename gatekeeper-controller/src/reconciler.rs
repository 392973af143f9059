//! The Provider reconciler: upserts external-data provider configuration
//! into the policy engine's cache and reports per-pod outcomes via
//! `ProviderPodStatus`.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event as KubeEvent, EventType, Recorder};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{error, info, instrument};

use crate::error::{Error, Result};
use crate::provider_cache::ProviderCache;
use crate::types::{status_object_labels, status_object_name, error_sets_equal, Provider, ProviderPodStatus, ProviderPodStatusSpec, StatusError, StatusErrorKind};

const FINALIZER_NAME: &str = "readiness.gatekeeper.sh/provider-cleanup";

pub struct Context {
    pub client: Client,
    pub cache: Arc<dyn ProviderCache>,
    pub readiness: Arc<gatekeeper_readiness::ReadyTracker>,
    pub recorder: Recorder,
    /// Stable identity for this replica -- used to key its own
    /// `ProviderPodStatus` object among its peers.
    pub pod_id: String,
}

#[instrument(skip(ctx))]
pub async fn run(client: Client, ctx: Arc<Context>) {
    let providers: Api<Provider> = Api::all(client);
    info!("starting provider controller");
    Controller::new(providers, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|res| async move { res.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
    info!("provider controller shutdown complete");
}

#[instrument(skip(provider, ctx), fields(provider_name = %provider.name_any()))]
async fn reconcile(provider: Arc<Provider>, ctx: Arc<Context>) -> Result<Action> {
    let api: Api<Provider> = Api::all(ctx.client.clone());
    finalizer(&api, FINALIZER_NAME, provider, |event| async {
        match event {
            FinalizerEvent::Apply(provider) => apply(provider, ctx.clone()).await,
            FinalizerEvent::Cleanup(provider) => cleanup(provider, ctx.clone()).await,
        }
    })
    .await
    .map_err(Box::new)
    .map_err(Error::Finalizer)
}

async fn apply(provider: Arc<Provider>, ctx: Arc<Context>) -> Result<Action> {
    let name = provider.name_any();
    let oref = provider.object_ref(&());
    let generation = provider.meta().generation.unwrap_or_default();

    let uid = provider.uid().unwrap_or_default();
    let result = ctx.cache.upsert(&name, &provider.spec).await;

    let errors = match &result {
        Ok(()) => Vec::new(),
        Err(message) => vec![StatusError {
            kind: StatusErrorKind::UpsertCacheError,
            message: message.clone(),
        }],
    };

    let key = gatekeeper_readiness::ObjKey::new(
        gatekeeper_readiness::Gvk::gvk("externaldata.gatekeeper.sh", "v1beta1", "Provider"),
        None,
        name.clone(),
    );
    if result.is_ok() {
        ctx.readiness.provider_tracker().observe(key);
    } else {
        ctx.readiness.provider_tracker().try_cancel_expect(&key);
    }

    write_pod_status(&ctx, &name, &uid, generation, !result.is_err(), errors.clone()).await?;

    if let Err(message) = &result {
        publish_event(
            &ctx.recorder,
            EventType::Warning,
            "UpsertFailed",
            "Reconcile",
            Some(format!("failed to upsert provider into cache: {message}")),
            &oref,
        )
        .await;
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    publish_event(
        &ctx.recorder,
        EventType::Normal,
        "Upserted",
        "Reconcile",
        Some(format!("provider {name} upserted into cache")),
        &oref,
    )
    .await;

    Ok(Action::requeue(Duration::from_secs(300)))
}

async fn cleanup(provider: Arc<Provider>, ctx: Arc<Context>) -> Result<Action> {
    let name = provider.name_any();
    ctx.cache.remove(&name).await;

    let key = gatekeeper_readiness::ObjKey::new(
        gatekeeper_readiness::Gvk::gvk("externaldata.gatekeeper.sh", "v1beta1", "Provider"),
        None,
        name.clone(),
    );
    ctx.readiness.provider_tracker().cancel_expect(&key);

    let status_api: Api<ProviderPodStatus> = Api::all(ctx.client.clone());
    let status_name = status_object_name(&ctx.pod_id, &name);
    let _ = status_api.delete(&status_name, &Default::default()).await;

    info!(provider = %name, "provider removed from cache, status object cleaned up");
    Ok(Action::await_change())
}

#[instrument(skip(object, err, ctx))]
fn error_policy(object: Arc<Provider>, err: &Error, ctx: Arc<Context>) -> Action {
    error!(error = %err, provider = %object.name_any(), "provider reconciliation failed");
    let ctx_clone = ctx.clone();
    let oref = object.object_ref(&());
    let message = err.to_string();
    tokio::spawn(async move {
        publish_event(
            &ctx_clone.recorder,
            EventType::Warning,
            "ReconcileError",
            "Reconcile",
            Some(message),
            &oref,
        )
        .await;
    });
    Action::requeue(Duration::from_secs(60))
}

/// Upsert this pod's `ProviderPodStatus` object, advancing
/// `last_transition_time` only when the error set actually changed.
async fn write_pod_status(
    ctx: &Context,
    provider_name: &str,
    provider_uid: &str,
    generation: i64,
    active: bool,
    errors: Vec<StatusError>,
) -> Result<()> {
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "gatekeeper-system".to_owned());
    let api: Api<ProviderPodStatus> = Api::namespaced(ctx.client.clone(), &namespace);
    let name = status_object_name(&ctx.pod_id, provider_name);

    let existing = api.get_opt(&name).await?;
    let now = Time(chrono::Utc::now());
    let last_transition_time = match &existing {
        Some(prev) if error_sets_equal(&prev.spec.errors, &errors) => prev.spec.last_transition_time.clone(),
        _ => Some(now.clone()),
    };

    let mut body = ProviderPodStatus::new(
        &name,
        ProviderPodStatusSpec {
            provider_name: provider_name.to_owned(),
            provider_uid: provider_uid.to_owned(),
            pod_id: ctx.pod_id.clone(),
            active,
            observed_generation: generation,
            errors,
            last_cache_update_time: Some(now),
            last_transition_time,
        },
    );
    body.metadata.namespace = Some(namespace.clone());
    body.metadata.labels = Some(status_object_labels(provider_name, &ctx.pod_id));

    api.patch(&name, &PatchParams::apply("gatekeeper-readiness"), &Patch::Apply(&body))
        .await?;
    Ok(())
}

async fn publish_event(
    recorder: &Recorder,
    event_type: EventType,
    reason: impl Into<String>,
    action: impl Into<String>,
    note: Option<String>,
    oref: &ObjectReference,
) {
    let _ = recorder
        .publish(
            &KubeEvent {
                type_: event_type,
                reason: reason.into(),
                note,
                action: action.into(),
                secondary: None,
            },
            oref,
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProviderSpec, StatusErrorKind};

    #[test]
    fn error_sets_equal_used_to_gate_transition_time() {
        let a = vec![StatusError {
            kind: StatusErrorKind::UpsertCacheError,
            message: "x".into(),
        }];
        let b = a.clone();
        assert!(error_sets_equal(&a, &b));
    }

    #[tokio::test]
    async fn apply_writes_status_and_requeues_on_cache_failure() {
        use crate::provider_cache::ProviderCache;
        use async_trait::async_trait;
        use http::{Request, Response};
        use kube::client::Body;
        use kube::runtime::events::Reporter;
        use tower_test::mock;

        struct FailingCache;
        #[async_trait]
        impl ProviderCache for FailingCache {
            async fn upsert(&self, _name: &str, _spec: &ProviderSpec) -> std::result::Result<(), String> {
                Err("connection refused".into())
            }

            async fn remove(&self, _name: &str) {}
        }

        let (mock_service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let recorder = Recorder::new(
            client.clone(),
            Reporter {
                controller: "gatekeeper-readiness".into(),
                instance: Some("test".into()),
            },
        );

        let ctx = Arc::new(Context {
            client: client.clone(),
            cache: Arc::new(FailingCache),
            readiness: Arc::new(gatekeeper_readiness::ReadyTracker::builder().build()),
            recorder,
            pod_id: "pod-a".into(),
        });

        let provider = Arc::new(Provider::new(
            "my-provider",
            ProviderSpec {
                url: "https://provider.default:8090".into(),
                timeout: 3,
                ca_bundle: None,
            },
        ));

        tokio::spawn(async move {
            // get_opt probing for an existing status object: none yet.
            if let Some((request, send)) = handle.next_request().await {
                assert_eq!(request.method(), http::Method::GET);
                let not_found = serde_json::json!({
                    "kind": "Status",
                    "apiVersion": "v1",
                    "status": "Failure",
                    "reason": "NotFound",
                    "code": 404,
                });
                let response = Response::builder()
                    .status(404)
                    .body(Body::from(serde_json::to_vec(&not_found).unwrap()))
                    .unwrap();
                send.send_response(response);
            }
            // status patch request
            if let Some((request, send)) = handle.next_request().await {
                assert_eq!(request.method(), http::Method::PATCH);
                let body = serde_json::json!({
                    "apiVersion": "externaldata.gatekeeper.sh/v1beta1",
                    "kind": "ProviderPodStatus",
                    "metadata": {"name": "my-provider-pod-a", "namespace": "gatekeeper-system"},
                    "spec": {
                        "providerName": "my-provider",
                        "providerUid": "",
                        "podId": "pod-a",
                        "active": false,
                        "observedGeneration": 0,
                        "errors": [{"kind": "UpsertCacheError", "message": "connection refused"}],
                    },
                });
                let response = Response::builder()
                    .status(200)
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap();
                send.send_response(response);
            }
            // event publish request
            if let Some((_, send)) = handle.next_request().await {
                let response = Response::builder().status(201).body(Body::empty()).unwrap();
                send.send_response(response);
            }
        });

        let action = apply(provider, ctx).await.unwrap();
        // `Action` exposes no public accessor or `PartialEq`; its `Debug`
        // form is the only thing a test can assert on.
        assert_eq!(format!("{action:?}"), format!("{:?}", Action::requeue(Duration::from_secs(30))));
    }
}
