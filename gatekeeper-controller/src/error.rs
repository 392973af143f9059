//! Error taxonomy for the controller binary.

use kube::runtime::finalizer;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kube client error: {0}")]
    Kube(#[from] kube::Error),

    #[error("finalizer error: {0}")]
    Finalizer(#[from] Box<finalizer::Error<Error>>),

    #[error("serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("a Provider object is missing its name")]
    MissingName,

    #[error("failed to convert external-data provider config: {0}")]
    Conversion(String),

    #[error("failed to upsert the provider cache: {0}")]
    UpsertCache(String),

    #[error("readiness tracker discovery failed: {0}")]
    Readiness(#[from] gatekeeper_readiness::ReadyTrackerError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
