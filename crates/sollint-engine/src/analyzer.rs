use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// The per-file analysis the engine caches and schedules.
///
/// Implementations must be deterministic for a given source text and rule
/// configuration; the engine serves repeated requests from its cache.
#[async_trait]
pub trait Analyzer: Send + Sync + 'static {
    type Output: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    async fn analyze(&self, path: &Path, source: &str) -> anyhow::Result<Self::Output>;
}
