//! In-memory [`Checkpointer`] for tests and single-process embeddings.

use super::{Checkpoint, Checkpointer};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;

/// Keeps every checkpoint version for every execution in memory. Nothing
/// survives a process restart; use [`super::FileCheckpointer`] for that.
#[derive(Default)]
pub struct MemoryCheckpointer {
    by_execution: DashMap<String, Vec<Checkpoint>>,
}

impl MemoryCheckpointer {
    /// Construct an empty checkpointer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.by_execution
            .entry(checkpoint.execution_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn load_latest(&self, execution_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .by_execution
            .get(execution_id)
            .and_then(|versions| versions.iter().max_by_key(|c| c.version).cloned()))
    }

    async fn load_version(&self, execution_id: &str, version: u64) -> Result<Option<Checkpoint>> {
        Ok(self
            .by_execution
            .get(execution_id)
            .and_then(|versions| versions.iter().find(|c| c.version == version).cloned()))
    }

    async fn list_versions(&self, execution_id: &str) -> Result<Vec<u64>> {
        Ok(self
            .by_execution
            .get(execution_id)
            .map(|versions| versions.iter().map(|c| c.version).collect())
            .unwrap_or_default())
    }

    async fn prune(&self, execution_id: &str, keep: &[u64]) -> Result<()> {
        if let Some(mut versions) = self.by_execution.get_mut(execution_id) {
            versions.retain(|c| keep.contains(&c.version));
        }
        Ok(())
    }
}
