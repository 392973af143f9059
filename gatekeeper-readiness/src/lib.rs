//! Readiness tracking core for the Gatekeeper-style admission/audit control
//! plane: decides the moment every constraint template, constraint,
//! mutator, and data source the cluster declares has actually been
//! ingested by the policy engine.
//!
//! This crate owns no cluster client, HTTP server, or CRD type -- those
//! live in the binary crate that wires a concrete [`lister::Lister`] and
//! [`lister::DynamicLister`] implementation over `kube::Api` into a
//! [`ready_tracker::ReadyTracker`].

pub mod error;
pub mod lister;
pub mod obj_data;
pub mod object_tracker;
pub mod objkey;
pub mod ready_tracker;
pub mod retry_list;
pub mod single_runner;
pub mod tracker_map;

pub use error::{DiscoveryError, ReadyTrackerError, TrackerError};
pub use lister::{DynamicLister, Lister};
pub use obj_data::{fixed_retries_factory, ObjData, ObjDataFactory};
pub use object_tracker::ObjectTracker;
pub use objkey::{constraint_gvk_for_template, ConstraintTemplateDescriptor, Gvk, HasObjectMeta, ObjKey};
pub use ready_tracker::{
    DataSourceSummary, GvkKey, NotReadyError, ReadyTracker, ReadyTrackerBuilder, SimpleResource, TemplateSummary,
};
pub use retry_list::{retry_list, retry_unless_unregistered, RetryError};
pub use single_runner::SingleRunner;
pub use tracker_map::{TrackerHandle, TrackerMap};
