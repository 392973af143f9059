//! External collaborator interfaces: the cluster client,
//! informer, and cache runtime are abstracted to these two traits so the
//! readiness core never depends on `kube`'s HTTP/watch machinery directly.

use crate::objkey::Gvk;
use async_trait::async_trait;
use std::error::Error as StdError;

/// Lists objects of a statically-known kind `K`.
///
/// Implemented in `gatekeeper-controller` as a one-line wrapper over
/// `kube::Api<K>::list`. May be called concurrently.
#[async_trait]
pub trait Lister<K>: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    async fn list(&self) -> Result<Vec<K>, Self::Error>;
}

/// Lists objects of a runtime-selected GVK, invoking `for_each` once per
/// item found. Used where the set of interesting kinds is not known at
/// compile time: constraint kinds generated by templates, and data kinds
/// named by `Config.syncOnly` / `SyncSet`.
#[async_trait]
pub trait DynamicLister: Send + Sync {
    type Error: StdError + Send + Sync + 'static;
    type Item: Send;

    async fn list(&self, gvk: &Gvk, for_each: &mut (dyn FnMut(Self::Item) + Send)) -> Result<(), Self::Error>;
}
