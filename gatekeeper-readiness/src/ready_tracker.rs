//! The top-level readiness aggregate.

use crate::error::{DiscoveryError, ReadyTrackerError};
use crate::lister::{DynamicLister, Lister};
use crate::obj_data::{fixed_retries_factory, ObjDataFactory};
use crate::objkey::{Gvk, ObjKey};
use crate::object_tracker::ObjectTracker;
use crate::retry_list::{retry_list, retry_unless_unregistered, RetryError};
use crate::single_runner::SingleRunner;
use crate::tracker_map::TrackerMap;
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A `ConstraintTemplate` list item, already reduced to what the readiness
/// core needs: its own name/deletion state, plus the constraint GVK it
/// generates (computed by the caller via
/// [`crate::objkey::constraint_gvk_for_template`]).
#[derive(Debug, Clone)]
pub struct TemplateSummary {
    pub name: String,
    pub is_deleting: bool,
    pub constraint_gvk: Gvk,
}

/// A `Config` or `SyncSet` list item reduced to the data GVKs it demands.
#[derive(Debug, Clone)]
pub struct DataSourceSummary {
    pub name: String,
    pub is_deleting: bool,
    pub data_gvks: Vec<Gvk>,
}

/// A plain top-level resource (provider, mutator, expansion template, ...)
/// with no further structure the tracker needs to inspect.
#[derive(Debug, Clone)]
pub struct SimpleResource {
    pub name: String,
    pub namespace: Option<String>,
    pub is_deleting: bool,
}

type TypedLister<T> = Arc<dyn Lister<T, Error = DiscoveryError>>;
type DynLister = Arc<dyn DynamicLister<Item = SimpleResource, Error = DiscoveryError>>;

/// Construction-time options.
pub struct ReadyTrackerBuilder {
    mutation_enabled: bool,
    external_data_enabled: bool,
    expansion_enabled: bool,
    fail_close: bool,
    obj_data_factory: ObjDataFactory,
    template_lister: Option<TypedLister<TemplateSummary>>,
    config_syncset_lister: Option<TypedLister<DataSourceSummary>>,
    provider_lister: Option<TypedLister<SimpleResource>>,
    assign_metadata_lister: Option<TypedLister<SimpleResource>>,
    assign_lister: Option<TypedLister<SimpleResource>>,
    modify_set_lister: Option<TypedLister<SimpleResource>>,
    assign_image_lister: Option<TypedLister<SimpleResource>>,
    expansion_template_lister: Option<TypedLister<SimpleResource>>,
    dynamic_lister: Option<DynLister>,
}

impl Default for ReadyTrackerBuilder {
    fn default() -> Self {
        Self {
            mutation_enabled: false,
            external_data_enabled: false,
            expansion_enabled: false,
            fail_close: true,
            obj_data_factory: fixed_retries_factory(5),
            template_lister: None,
            config_syncset_lister: None,
            provider_lister: None,
            assign_metadata_lister: None,
            assign_lister: None,
            modify_set_lister: None,
            assign_image_lister: None,
            expansion_template_lister: None,
            dynamic_lister: None,
        }
    }
}

impl ReadyTrackerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn mutation_enabled(mut self, on: bool) -> Self {
        self.mutation_enabled = on;
        self
    }

    #[must_use]
    pub fn external_data_enabled(mut self, on: bool) -> Self {
        self.external_data_enabled = on;
        self
    }

    #[must_use]
    pub fn expansion_enabled(mut self, on: bool) -> Self {
        self.expansion_enabled = on;
        self
    }

    /// `true`: discovery errors leave the affected branch unpopulated and
    /// `run` returns an error. `false` (fail-open): errors are logged and
    /// the branch is forced populated anyway.
    #[must_use]
    pub fn fail_close(mut self, on: bool) -> Self {
        self.fail_close = on;
        self
    }

    #[must_use]
    pub fn readiness_retries(mut self, retries: i64) -> Self {
        self.obj_data_factory = fixed_retries_factory(retries);
        self
    }

    #[must_use]
    pub fn obj_data_factory(mut self, factory: ObjDataFactory) -> Self {
        self.obj_data_factory = factory;
        self
    }

    #[must_use]
    pub fn template_lister(mut self, lister: TypedLister<TemplateSummary>) -> Self {
        self.template_lister = Some(lister);
        self
    }

    #[must_use]
    pub fn config_syncset_lister(mut self, lister: TypedLister<DataSourceSummary>) -> Self {
        self.config_syncset_lister = Some(lister);
        self
    }

    #[must_use]
    pub fn provider_lister(mut self, lister: TypedLister<SimpleResource>) -> Self {
        self.provider_lister = Some(lister);
        self
    }

    #[must_use]
    pub fn assign_metadata_lister(mut self, lister: TypedLister<SimpleResource>) -> Self {
        self.assign_metadata_lister = Some(lister);
        self
    }

    #[must_use]
    pub fn assign_lister(mut self, lister: TypedLister<SimpleResource>) -> Self {
        self.assign_lister = Some(lister);
        self
    }

    #[must_use]
    pub fn modify_set_lister(mut self, lister: TypedLister<SimpleResource>) -> Self {
        self.modify_set_lister = Some(lister);
        self
    }

    #[must_use]
    pub fn assign_image_lister(mut self, lister: TypedLister<SimpleResource>) -> Self {
        self.assign_image_lister = Some(lister);
        self
    }

    #[must_use]
    pub fn expansion_template_lister(mut self, lister: TypedLister<SimpleResource>) -> Self {
        self.expansion_template_lister = Some(lister);
        self
    }

    #[must_use]
    pub fn dynamic_lister(mut self, lister: DynLister) -> Self {
        self.dynamic_lister = Some(lister);
        self
    }

    /// Nominal GVKs for the single-instance top-level trackers. These
    /// never name a real discoverable kind on their own (the resources
    /// involved are cluster singletons or small in number); they exist
    /// purely so every tracker can log a GVK-shaped identity.
    fn nominal(kind: &str) -> Gvk {
        Gvk::gvk("readiness.gatekeeper.sh", "internal", kind)
    }

    #[must_use]
    pub fn build(self) -> ReadyTracker {
        let factory = self.obj_data_factory;
        ReadyTracker {
            templates: ObjectTracker::new(Self::nominal("ConstraintTemplate"), factory.clone()),
            config_syncsets: ObjectTracker::new(Self::nominal("ConfigAndSyncSet"), factory.clone()),
            provider: ObjectTracker::new(Self::nominal("Provider"), factory.clone()),
            assign_metadata: ObjectTracker::new(Self::nominal("AssignMetadata"), factory.clone()),
            assign: ObjectTracker::new(Self::nominal("Assign"), factory.clone()),
            modify_set: ObjectTracker::new(Self::nominal("ModifySet"), factory.clone()),
            assign_image: ObjectTracker::new(Self::nominal("AssignImage"), factory.clone()),
            expansion_template: ObjectTracker::new(Self::nominal("ExpansionTemplate"), factory.clone()),
            constraint_trackers: Arc::new(TrackerMap::new(factory.clone())),
            data_trackers: Arc::new(TrackerMap::new(factory)),
            constraint_runner: OnceLock::new(),
            data_runner: OnceLock::new(),
            mutation_enabled: self.mutation_enabled,
            external_data_enabled: self.external_data_enabled,
            expansion_enabled: self.expansion_enabled,
            fail_close: self.fail_close,
            template_lister: self.template_lister,
            config_syncset_lister: self.config_syncset_lister,
            provider_lister: self.provider_lister,
            assign_metadata_lister: self.assign_metadata_lister,
            assign_lister: self.assign_lister,
            modify_set_lister: self.modify_set_lister,
            assign_image_lister: self.assign_image_lister,
            expansion_template_lister: self.expansion_template_lister,
            dynamic_lister: self.dynamic_lister,
            ready: watch::channel(false),
        }
    }
}

/// Computes, from partial and racy cluster observations, the exact moment
/// the policy engine has ingested every resource an admission or audit
/// decision may depend on.
///
/// `Satisfied()` is a monotonic latch: once it returns `true` it
/// returns `true` for the process lifetime, because every component it
/// composes is itself monotonic and `Satisfied()` never calls
/// `Expect`.
pub struct ReadyTracker {
    templates: ObjectTracker,
    config_syncsets: ObjectTracker,
    provider: ObjectTracker,
    assign_metadata: ObjectTracker,
    assign: ObjectTracker,
    modify_set: ObjectTracker,
    assign_image: ObjectTracker,
    expansion_template: ObjectTracker,
    constraint_trackers: Arc<TrackerMap>,
    data_trackers: Arc<TrackerMap>,
    /// Bound to `run`'s own cancellation token on first (and only) call, so
    /// parent cancellation reaches every per-kind discovery job.
    constraint_runner: OnceLock<SingleRunner<DiscoveryError>>,
    data_runner: OnceLock<SingleRunner<DiscoveryError>>,

    mutation_enabled: bool,
    external_data_enabled: bool,
    expansion_enabled: bool,
    fail_close: bool,

    template_lister: Option<TypedLister<TemplateSummary>>,
    config_syncset_lister: Option<TypedLister<DataSourceSummary>>,
    provider_lister: Option<TypedLister<SimpleResource>>,
    assign_metadata_lister: Option<TypedLister<SimpleResource>>,
    assign_lister: Option<TypedLister<SimpleResource>>,
    modify_set_lister: Option<TypedLister<SimpleResource>>,
    assign_image_lister: Option<TypedLister<SimpleResource>>,
    expansion_template_lister: Option<TypedLister<SimpleResource>>,
    dynamic_lister: Option<DynLister>,

    /// Closed (set to `true`) once `run`'s single-runners are
    /// initialized, establishing a happens-before edge so `CancelTemplate`
    /// / `CancelData` may safely reference them.
    ready: (watch::Sender<bool>, watch::Receiver<bool>),
}

impl ReadyTracker {
    #[must_use]
    pub fn builder() -> ReadyTrackerBuilder {
        ReadyTrackerBuilder::new()
    }

    /// Run every enabled discovery loop to completion (they each call
    /// `ExpectationsDone` on their own top-level tracker when done), then
    /// wait for every per-kind job spawned onto the two single-runners.
    ///
    /// In fail-close mode the first discovery error aborts with an error.
    /// In fail-open mode errors are logged and absorbed: the affected
    /// branch is still marked populated so it doesn't permanently block
    /// readiness.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ReadyTrackerError> {
        // Step 1: bind the single-runners to this call's cancellation token,
        // then announce that they're safe to reference from CancelTemplate/
        // CancelData. `run` is only ever called once per tracker, so these
        // `set` calls always win the race.
        let _ = self.constraint_runner.set(SingleRunner::new(cancel.clone()));
        let _ = self.data_runner.set(SingleRunner::new(cancel.clone()));
        let _ = self.ready.0.send(true);

        let mut errors: Vec<(&'static str, DiscoveryError)> = Vec::new();

        if let Some(lister) = &self.template_lister {
            if let Err(e) = self.track_constraint_templates(lister.as_ref(), &cancel).await {
                errors.push(("templates", e));
            }
        } else {
            self.templates.expectations_done();
        }

        if let Some(lister) = &self.config_syncset_lister {
            if let Err(e) = self.track_config_and_syncsets(lister.as_ref(), &cancel).await {
                errors.push(("config_and_syncsets", e));
            }
        } else {
            self.config_syncsets.expectations_done();
        }

        if self.external_data_enabled {
            // Provider has its own reconciler (`gatekeeper-controller::reconciler`)
            // that calls `observe` once it actually upserts into the cache, so
            // discovery here must not self-observe.
            self.run_simple_branch(
                "provider",
                &self.provider,
                &self.provider_lister,
                false,
                &cancel,
                &mut errors,
            )
            .await;
        } else {
            self.provider.expectations_done();
        }

        if self.mutation_enabled {
            self.run_simple_branch(
                "assign_metadata",
                &self.assign_metadata,
                &self.assign_metadata_lister,
                true,
                &cancel,
                &mut errors,
            )
            .await;
            self.run_simple_branch("assign", &self.assign, &self.assign_lister, true, &cancel, &mut errors)
                .await;
            self.run_simple_branch(
                "modify_set",
                &self.modify_set,
                &self.modify_set_lister,
                true,
                &cancel,
                &mut errors,
            )
            .await;
            self.run_simple_branch(
                "assign_image",
                &self.assign_image,
                &self.assign_image_lister,
                true,
                &cancel,
                &mut errors,
            )
            .await;
        } else {
            self.assign_metadata.expectations_done();
            self.assign.expectations_done();
            self.modify_set.expectations_done();
            self.assign_image.expectations_done();
        }

        if self.expansion_enabled {
            self.run_simple_branch(
                "expansion_template",
                &self.expansion_template,
                &self.expansion_template_lister,
                true,
                &cancel,
                &mut errors,
            )
            .await;
        } else {
            self.expansion_template.expectations_done();
        }

        // Step 3: wait for every per-kind job spawned onto the two
        // single-runners while discovery was running.
        if let Err(e) = self.constraint_runner().wait().await {
            errors.push(("constraint_kinds", e));
        }
        if let Err(e) = self.data_runner().wait().await {
            errors.push(("data_kinds", e));
        }

        if errors.is_empty() {
            return Ok(());
        }

        if self.fail_close {
            let (branch, source) = errors.into_iter().next().unwrap();
            Err(ReadyTrackerError::Discovery { branch, source })
        } else {
            for (branch, source) in &errors {
                warn!(branch, error = %source, "discovery failed, fail-open: populating anyway");
            }
            Ok(())
        }
    }

    /// `self_observe`: this crate models no dedicated reconciler for the
    /// resource kind being listed (unlike Provider, whose own reconciler
    /// calls `observe` once it actually upserts into the policy engine's
    /// cache -- see `gatekeeper-controller::reconciler::apply`). For every
    /// other top-level kind there is no further ingestion step to wait on
    /// within this workspace's scope, so a successful list already *is*
    /// the observation: each listed item is expected and observed in the
    /// same pass, exactly like `list_kind_into_tracker` does for the
    /// per-kind constraint/data trackers below.
    async fn run_simple_branch(
        &self,
        name: &'static str,
        tracker: &ObjectTracker,
        lister: &Option<TypedLister<SimpleResource>>,
        self_observe: bool,
        cancel: &CancellationToken,
        errors: &mut Vec<(&'static str, DiscoveryError)>,
    ) {
        let Some(lister) = lister else {
            tracker.expectations_done();
            return;
        };
        match retry_list(lister.as_ref(), |_| false, cancel).await {
            Ok(items) => {
                for item in items {
                    let key = ObjKey::new(tracker.gvk().clone(), item.namespace.clone(), item.name.clone());
                    tracker.expect(key.clone(), item.is_deleting);
                    if self_observe && !item.is_deleting {
                        tracker.observe(key);
                    }
                }
                tracker.expectations_done();
            }
            Err(e) => {
                let err = into_discovery_error(tracker.gvk().clone(), e);
                if self.fail_close {
                    errors.push((name, err));
                } else {
                    warn!(branch = name, error = %err, "discovery failed, fail-open: populating anyway");
                    tracker.expectations_done();
                }
            }
        }
    }

    async fn track_constraint_templates(
        &self,
        lister: &dyn Lister<TemplateSummary, Error = DiscoveryError>,
        cancel: &CancellationToken,
    ) -> Result<(), DiscoveryError> {
        let items = retry_list(lister, |_| false, cancel)
            .await
            .map_err(|e| into_discovery_error(self.templates.gvk().clone(), e))?;
        for item in items {
            let key = ObjKey::new(item.constraint_gvk.clone(), None, item.name.clone());
            self.templates.expect(key.clone(), item.is_deleting);
            if !item.is_deleting {
                // No separate template-ingestion controller exists in this
                // workspace to later call `observe`; the listing itself is
                // the confirmation that the template is present.
                self.templates.observe(key);
                self.schedule_constraint_kind(item.constraint_gvk);
            }
        }
        self.templates.expectations_done();
        Ok(())
    }

    fn schedule_constraint_kind(&self, gvk: Gvk) {
        let Some(dynamic_lister) = self.dynamic_lister.clone() else {
            return;
        };
        let trackers = self.constraint_trackers.clone();
        let key = gvk.to_string_key();
        let task_gvk = gvk.clone();
        self.constraint_runner().go(key, move |token| async move {
            list_kind_into_tracker(dynamic_lister, trackers, task_gvk, token).await
        });
    }

    async fn track_config_and_syncsets(
        &self,
        lister: &dyn Lister<DataSourceSummary, Error = DiscoveryError>,
        cancel: &CancellationToken,
    ) -> Result<(), DiscoveryError> {
        let items = retry_list(lister, |_| false, cancel)
            .await
            .map_err(|e| into_discovery_error(self.config_syncsets.gvk().clone(), e))?;
        let mut seen_gvks = std::collections::HashSet::new();
        for item in items {
            let key = ObjKey::new(self.config_syncsets.gvk().clone(), None, item.name.clone());
            self.config_syncsets.expect(key.clone(), item.is_deleting);
            if !item.is_deleting {
                self.config_syncsets.observe(key);
                for gvk in item.data_gvks {
                    if seen_gvks.insert(gvk.clone()) {
                        self.schedule_data_kind(gvk);
                    }
                }
            }
        }
        self.config_syncsets.expectations_done();
        Ok(())
    }

    fn schedule_data_kind(&self, gvk: Gvk) {
        let Some(dynamic_lister) = self.dynamic_lister.clone() else {
            return;
        };
        let trackers = self.data_trackers.clone();
        let key = gvk.to_string_key();
        let task_gvk = gvk.clone();
        self.data_runner().go(key, move |token| async move {
            list_kind_into_tracker(dynamic_lister, trackers, task_gvk, token).await
        });
    }

    fn constraint_runner(&self) -> &SingleRunner<DiscoveryError> {
        self.constraint_runner
            .get()
            .expect("run() binds the constraint runner before any discovery loop can reach it")
    }

    fn data_runner(&self) -> &SingleRunner<DiscoveryError> {
        self.data_runner
            .get()
            .expect("run() binds the data runner before any discovery loop can reach it")
    }

    /// A constraint-template was deleted at runtime: cancel its
    /// expectation, tombstone the constraint GVK it generated, and stop
    /// the dynamic listing goroutine for that kind.
    pub async fn cancel_template(&self, name: &str, constraint_gvk: &Gvk) {
        let key = ObjKey::new(constraint_gvk.clone(), None, name.to_owned());
        self.templates.cancel_expect(&key);
        self.constraint_trackers.remove(constraint_gvk);
        self.wait_ready().await;
        self.constraint_runner().cancel(&constraint_gvk.to_string_key());
        info!(%key, "constraint template cancelled");
    }

    /// Budgeted variant of [`ReadyTracker::cancel_template`]: only takes
    /// effect once the key's retry budget is exhausted.
    pub async fn try_cancel_template(&self, name: &str, constraint_gvk: &Gvk) {
        let key = ObjKey::new(constraint_gvk.clone(), None, name.to_owned());
        self.templates.try_cancel_expect(&key);
        if self.templates.satisfied() || !self.templates.unsatisfied().contains(&key) {
            self.constraint_trackers.remove(constraint_gvk);
            self.wait_ready().await;
            self.constraint_runner().cancel(&constraint_gvk.to_string_key());
        }
    }

    /// Cancel expectation of a data GVK (e.g. removed from every
    /// `Config`/`SyncSet`).
    pub async fn cancel_data(&self, gvk: &Gvk) {
        self.data_trackers.remove(gvk);
        self.wait_ready().await;
        self.data_runner().cancel(&gvk.to_string_key());
    }

    /// Budgeted variant of [`ReadyTracker::cancel_data`].
    pub async fn try_cancel_data(&self, gvk: &Gvk) {
        self.data_trackers.try_cancel(gvk);
        if !self.data_trackers.has(gvk) {
            self.wait_ready().await;
            self.data_runner().cancel(&gvk.to_string_key());
        }
    }

    async fn wait_ready(&self) {
        let mut rx = self.ready.1.clone();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Conjunction of `Satisfied()` across every owned tracker and tracker
    /// map. Monotonic.
    #[must_use]
    pub fn satisfied(&self) -> bool {
        self.templates.satisfied()
            && self.config_syncsets.satisfied()
            && self.provider.satisfied()
            && self.assign_metadata.satisfied()
            && self.assign.satisfied()
            && self.modify_set.satisfied()
            && self.assign_image.satisfied()
            && self.expansion_template.satisfied()
            && self.constraint_trackers.satisfied()
            && self.data_trackers.satisfied()
    }

    /// Conjunction of `Populated()` across every owned tracker.
    #[must_use]
    pub fn populated(&self) -> bool {
        self.templates.populated()
            && self.config_syncsets.populated()
            && self.provider.populated()
            && self.assign_metadata.populated()
            && self.assign.populated()
            && self.modify_set.populated()
            && self.assign_image.populated()
            && self.expansion_template.populated()
            && self.constraint_trackers.populated()
            && self.data_trackers.populated()
    }

    /// Hooked directly into the process's `/readyz` endpoint: `Ok(())`
    /// iff [`ReadyTracker::satisfied`] holds, else an error.
    ///
    /// # Errors
    /// Returns an error when the tracker is not yet satisfied.
    pub fn check_satisfied(&self) -> Result<(), NotReadyError> {
        if self.satisfied() {
            Ok(())
        } else {
            Err(NotReadyError)
        }
    }

    /// Access the per-kind constraint tracker map, e.g. for the Provider
    /// reconciler to call `Observe`/`CancelExpect` against a specific GVK.
    #[must_use]
    pub fn constraint_trackers(&self) -> &Arc<TrackerMap> {
        &self.constraint_trackers
    }

    #[must_use]
    pub fn data_trackers(&self) -> &Arc<TrackerMap> {
        &self.data_trackers
    }

    #[must_use]
    pub fn provider_tracker(&self) -> &ObjectTracker {
        &self.provider
    }
}

/// Readiness endpoint error: the tracker has not yet reported satisfied.
#[derive(Debug, thiserror::Error)]
#[error("readiness tracker is not yet satisfied")]
pub struct NotReadyError;

fn into_discovery_error<E: std::error::Error + Send + Sync + 'static>(gvk: Gvk, err: RetryError<E>) -> DiscoveryError {
    match err {
        RetryError::Cancelled => DiscoveryError::Cancelled { gvk },
        RetryError::Inner(source) => DiscoveryError::Transient {
            gvk,
            source: Box::new(source),
        },
    }
}

/// Adapts a [`DynamicLister`] fixed to one `gvk` into the static [`Lister`]
/// shape [`retry_list`] expects, so every discovery loop -- top-level and
/// per-kind alike -- gets the same backoff treatment.
struct DynamicKindLister {
    inner: DynLister,
    gvk: Gvk,
}

#[async_trait]
impl Lister<SimpleResource> for DynamicKindLister {
    type Error = DiscoveryError;

    async fn list(&self) -> Result<Vec<SimpleResource>, Self::Error> {
        let mut items = Vec::new();
        self.inner.list(&self.gvk, &mut |item| items.push(item)).await?;
        Ok(items)
    }
}

async fn list_kind_into_tracker(
    dynamic_lister: DynLister,
    trackers: Arc<TrackerMap>,
    gvk: Gvk,
    cancel: CancellationToken,
) -> Result<(), DiscoveryError> {
    let tracker = trackers.get(&gvk);
    let lister = DynamicKindLister {
        inner: dynamic_lister,
        gvk: gvk.clone(),
    };
    match retry_list(&lister, retry_unless_unregistered, &cancel).await {
        Ok(items) => {
            for item in items {
                let is_deleting = item.is_deleting;
                let key = ObjKey::new(gvk.clone(), item.namespace, item.name);
                tracker.expect(key.clone(), is_deleting);
                if !is_deleting {
                    // No separate constraint/data-ingestion controller exists
                    // in this workspace to later call `observe`; the listing
                    // itself is the confirmation that the object is present.
                    tracker.observe(key);
                }
            }
            tracker.expectations_done();
            Ok(())
        }
        Err(RetryError::Cancelled) => Err(DiscoveryError::Cancelled { gvk }),
        Err(RetryError::Inner(DiscoveryError::Unregistered { .. })) => {
            // Terminal, non-fatal: the kind simply doesn't exist.
            // Satisfy the tracker trivially so it never blocks readiness.
            tracker.expectations_done();
            debug!(?gvk, "kind not registered, treating as vacuously satisfied");
            Ok(())
        }
        Err(RetryError::Inner(e)) => Err(e),
    }
}

/// Stable string form of a GVK, used as a [`SingleRunner`] key.
pub trait GvkKey {
    fn to_string_key(&self) -> String;
}

impl GvkKey for Gvk {
    fn to_string_key(&self) -> String {
        format!("{}/{}.{}", self.group, self.version, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn gvk(kind: &str) -> Gvk {
        Gvk::gvk("constraints.gatekeeper.sh", "v1beta1", kind)
    }

    struct FixedLister<T: Clone + Send + Sync>(Vec<T>);

    #[async_trait]
    impl<T: Clone + Send + Sync> Lister<T> for FixedLister<T> {
        type Error = DiscoveryError;

        async fn list(&self) -> Result<Vec<T>, Self::Error> {
            Ok(self.0.clone())
        }
    }

    struct FakeDynamicLister {
        items: Mutex<std::collections::HashMap<String, Vec<SimpleResource>>>,
        unregistered: std::collections::HashSet<String>,
    }

    #[async_trait]
    impl DynamicLister for FakeDynamicLister {
        type Error = DiscoveryError;
        type Item = SimpleResource;

        async fn list(&self, gvk: &Gvk, for_each: &mut (dyn FnMut(Self::Item) + Send)) -> Result<(), Self::Error> {
            let key = gvk.to_string_key();
            if self.unregistered.contains(&key) {
                return Err(DiscoveryError::Unregistered { gvk: gvk.clone() });
            }
            for item in self.items.lock().get(&key).cloned().unwrap_or_default() {
                for_each(item);
            }
            Ok(())
        }
    }

    fn resource(name: &str) -> SimpleResource {
        SimpleResource {
            name: name.to_owned(),
            namespace: None,
            is_deleting: false,
        }
    }

    #[tokio::test]
    async fn s1_happy_path_is_satisfied() {
        let constraint_gvk = gvk("K8sRequiredLabels");
        let templates = FixedLister(vec![TemplateSummary {
            name: "t1".into(),
            is_deleting: false,
            constraint_gvk: constraint_gvk.clone(),
        }]);
        let mut items = std::collections::HashMap::new();
        items.insert(constraint_gvk.to_string_key(), vec![resource("ns-must-have-gk")]);
        let dynamic = Arc::new(FakeDynamicLister {
            items: Mutex::new(items),
            unregistered: std::collections::HashSet::new(),
        });

        let tracker = ReadyTracker::builder()
            .template_lister(Arc::new(templates))
            .dynamic_lister(dynamic)
            .build();

        tracker.run(CancellationToken::new()).await.unwrap();
        assert!(tracker.satisfied());
        assert!(tracker.check_satisfied().is_ok());
    }

    #[tokio::test]
    async fn s2_deletion_timestamped_template_is_not_required() {
        let templates = FixedLister(vec![TemplateSummary {
            name: "t1".into(),
            is_deleting: true,
            constraint_gvk: gvk("K8sRequiredLabels"),
        }]);
        let dynamic = Arc::new(FakeDynamicLister {
            items: Mutex::new(std::collections::HashMap::new()),
            unregistered: std::collections::HashSet::new(),
        });
        let tracker = ReadyTracker::builder()
            .template_lister(Arc::new(templates))
            .dynamic_lister(dynamic)
            .build();
        tracker.run(CancellationToken::new()).await.unwrap();
        assert!(tracker.satisfied());
    }

    #[tokio::test]
    async fn s4_unknown_kind_is_vacuously_satisfied_in_fail_open() {
        let constraint_gvk = gvk("K8sRequiredLabels");
        let templates = FixedLister(vec![TemplateSummary {
            name: "t1".into(),
            is_deleting: false,
            constraint_gvk: constraint_gvk.clone(),
        }]);
        let mut unregistered = std::collections::HashSet::new();
        unregistered.insert(constraint_gvk.to_string_key());
        let dynamic = Arc::new(FakeDynamicLister {
            items: Mutex::new(std::collections::HashMap::new()),
            unregistered,
        });
        let tracker = ReadyTracker::builder()
            .template_lister(Arc::new(templates))
            .dynamic_lister(dynamic)
            .fail_close(false)
            .build();
        tracker.run(CancellationToken::new()).await.unwrap();
        assert!(tracker.satisfied());
    }

    #[tokio::test]
    async fn s6_monotonic_after_late_additions() {
        let constraint_gvk = gvk("K8sRequiredLabels");
        let templates = FixedLister(vec![TemplateSummary {
            name: "t1".into(),
            is_deleting: false,
            constraint_gvk: constraint_gvk.clone(),
        }]);
        let mut items = std::collections::HashMap::new();
        items.insert(constraint_gvk.to_string_key(), vec![resource("ns-must-have-gk")]);
        let dynamic = Arc::new(FakeDynamicLister {
            items: Mutex::new(items),
            unregistered: std::collections::HashSet::new(),
        });
        let tracker = ReadyTracker::builder()
            .template_lister(Arc::new(templates))
            .dynamic_lister(dynamic)
            .build();
        tracker.run(CancellationToken::new()).await.unwrap();
        assert!(tracker.satisfied());

        // Late additions must not be required for readiness: ExpectationsDone
        // already froze the templates tracker's expectation set.
        tracker
            .templates
            .expect(ObjKey::new(gvk("K8sAllowedRepos"), None, "t2".into()), false);
        assert!(tracker.satisfied());
    }
}
