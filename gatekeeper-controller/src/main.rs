//! Entry point wiring `gatekeeper-readiness`'s `ReadyTracker` to a real
//! cluster: builds the typed/dynamic listers over `kube::Client`, runs the
//! readiness discovery loops, serves `/readyz` and `/metrics`, and drives
//! the Provider reconciler + per-pod status aggregator.

mod error;
mod listers;
mod metrics;
mod provider_cache;
mod reconciler;
mod status_aggregator;
mod types;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use gatekeeper_readiness::{Gvk, ReadyTracker, ReadyTrackerBuilder};
use kube::runtime::events::{Recorder, Reporter};
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use listers::{ClusterDynamicLister, ConfigAndSyncSetLister, ConstraintTemplateLister, SimpleResourceLister};
use metrics::ReadinessMetrics;
use provider_cache::NoopProviderCache;
use reconciler::Context as ReconcilerContext;

/// Construction-time options and HTTP surface for `gatekeeper-controller`,
/// matching the construction-time option set of the readiness core and the
/// flag/env-var layer other controllers in this ecosystem expose around
/// their own entrypoints.
#[derive(Parser, Debug)]
#[command(name = "gatekeeper-controller", version, about = "Gatekeeper readiness tracker and external-data provider controller")]
struct Cli {
    /// Include the mutator trackers (`AssignMetadata`, `Assign`, `ModifySet`,
    /// `AssignImage`) in the readiness aggregate.
    #[arg(long, env = "MUTATION_ENABLED", default_value_t = false)]
    mutation_enabled: bool,

    /// Include the external-data `Provider` tracker and run the Provider
    /// reconciler + status aggregator.
    #[arg(long, env = "EXTERNAL_DATA_ENABLED", default_value_t = false)]
    external_data_enabled: bool,

    /// Include the `ExpansionTemplate` tracker.
    #[arg(long, env = "EXPANSION_ENABLED", default_value_t = false)]
    expansion_enabled: bool,

    /// Discovery errors leave the affected branch unpopulated and abort
    /// startup (`true`), or get absorbed and force the branch populated
    /// anyway (`false`).
    #[arg(long, env = "FAIL_CLOSE", default_value_t = true)]
    fail_close: bool,

    /// Retry budget for `TryCancelExpect`/`TryCancel` forced cancellations.
    /// Negative means infinite (never force-cancel).
    #[arg(long, env = "READINESS_RETRIES", default_value_t = 5)]
    readiness_retries: i64,

    /// Address the `/readyz` and `/metrics` HTTP server binds to.
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    /// Stable identity for this replica, used to key its `ProviderPodStatus`
    /// object. Falls back to the Kubernetes-assigned pod name.
    #[arg(long, env = "POD_NAME")]
    pod_name: Option<String>,
}

#[derive(Clone)]
struct AppState {
    tracker: Arc<ReadyTracker>,
    registry: Arc<prometheus_client::registry::Registry>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,gatekeeper_readiness=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let pod_name = cli.pod_name.clone().unwrap_or_else(|| "gatekeeper-controller".to_owned());

    info!(version = env!("CARGO_PKG_VERSION"), pod = %pod_name, "starting gatekeeper-controller");

    let client = Client::try_default().await?;
    let cancel = CancellationToken::new();

    let tracker = Arc::new(build_tracker(&cli, client.clone()));

    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = ReadinessMetrics::new(&mut registry);

    let state = AppState {
        tracker: tracker.clone(),
        registry: Arc::new(registry),
    };

    let run_handle = {
        let tracker = tracker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tracker.run(cancel).await {
                warn!(error = %e, "readiness tracker run() returned an error (fail-close mode)");
            }
        })
    };

    let metrics_poll_handle = {
        let tracker = tracker.clone();
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_secs(5)) => {
                        metrics.refresh(&tracker, unix_seconds_since_launch());
                    }
                }
            }
        })
    };

    let mut provider_handles = Vec::new();
    if cli.external_data_enabled {
        let recorder = Recorder::new(
            client.clone(),
            Reporter {
                controller: "gatekeeper-readiness".into(),
                instance: Some(pod_name.clone()),
            },
        );
        let reconciler_ctx = Arc::new(ReconcilerContext {
            client: client.clone(),
            cache: Arc::new(NoopProviderCache),
            readiness: tracker.clone(),
            recorder,
            pod_id: pod_name.clone(),
        });
        let client_for_reconciler = client.clone();
        provider_handles.push(tokio::spawn(async move {
            reconciler::run(client_for_reconciler, reconciler_ctx).await;
        }));
        let client_for_aggregator = client.clone();
        provider_handles.push(tokio::spawn(async move {
            status_aggregator::run(client_for_aggregator).await;
        }));
    }

    let app = Router::new()
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(tower_http::trace::DefaultMakeSpan::new().level(Level::INFO)))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(cli.http_addr).await?;
    info!(addr = %cli.http_addr, "serving /readyz and /metrics");

    let server_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_cancel.cancel();
        })
        .await?;

    run_handle.abort();
    metrics_poll_handle.abort();
    for handle in provider_handles {
        handle.abort();
    }

    info!("gatekeeper-controller stopped");
    Ok(())
}

fn build_tracker(cli: &Cli, client: Client) -> ReadyTracker {
    ReadyTrackerBuilder::new()
        .mutation_enabled(cli.mutation_enabled)
        .external_data_enabled(cli.external_data_enabled)
        .expansion_enabled(cli.expansion_enabled)
        .fail_close(cli.fail_close)
        .readiness_retries(cli.readiness_retries)
        .template_lister(Arc::new(ConstraintTemplateLister::new(client.clone())))
        .config_syncset_lister(Arc::new(ConfigAndSyncSetLister::new(client.clone())))
        .provider_lister(Arc::new(SimpleResourceLister::new(
            client.clone(),
            Gvk::gvk("externaldata.gatekeeper.sh", "v1beta1", "Provider"),
        )))
        .assign_metadata_lister(Arc::new(SimpleResourceLister::new(
            client.clone(),
            Gvk::gvk("mutations.gatekeeper.sh", "v1", "AssignMetadata"),
        )))
        .assign_lister(Arc::new(SimpleResourceLister::new(
            client.clone(),
            Gvk::gvk("mutations.gatekeeper.sh", "v1", "Assign"),
        )))
        .modify_set_lister(Arc::new(SimpleResourceLister::new(
            client.clone(),
            Gvk::gvk("mutations.gatekeeper.sh", "v1", "ModifySet"),
        )))
        .assign_image_lister(Arc::new(SimpleResourceLister::new(
            client.clone(),
            Gvk::gvk("mutations.gatekeeper.sh", "v1alpha1", "AssignImage"),
        )))
        .expansion_template_lister(Arc::new(SimpleResourceLister::new(
            client.clone(),
            Gvk::gvk("expansion.gatekeeper.sh", "v1alpha1", "ExpansionTemplate"),
        )))
        .dynamic_lister(Arc::new(ClusterDynamicLister::new(client)))
        .build()
}

async fn readyz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.tracker.check_satisfied() {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    metrics::encode(&state.registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn unix_seconds_since_launch() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
