//! The external-data cache collaborator.
//!
//! Mirrors the constraint-framework client in `gatekeeper-readiness`: the
//! actual cache the policy engine queries at admission/audit time is opaque
//! here, reached only through this trait. Production wiring talks to the
//! real in-process provider cache; tests substitute a fake.

use crate::types::ProviderSpec;
use async_trait::async_trait;

#[async_trait]
pub trait ProviderCache: Send + Sync {
    async fn upsert(&self, name: &str, spec: &ProviderSpec) -> Result<(), String>;
    async fn remove(&self, name: &str);
}

/// In-memory stand-in, used by tests and by `main.rs` until a real
/// external-data cache is wired in.
#[derive(Default)]
pub struct NoopProviderCache;

#[async_trait]
impl ProviderCache for NoopProviderCache {
    async fn upsert(&self, _name: &str, _spec: &ProviderSpec) -> Result<(), String> {
        Ok(())
    }

    async fn remove(&self, _name: &str) {}
}
