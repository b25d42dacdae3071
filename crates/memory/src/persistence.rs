//! Persistence backend selection and the no-op backend.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use waymark_config::MemoryConfig;
use waymark_core::error::MemoryError;
use waymark_core::memory::{
    EpisodicRecord, MemoryPersistence, PersistedPartition, ProceduralWorkflow, PromotionState,
    SemanticFact,
};
use waymark_core::workspace::WorkspaceId;

use crate::jsonl::JsonlPersistence;
#[cfg(feature = "sqlite")]
use crate::sqlite::SqlitePersistence;

/// Keeps nothing; memory lives only as long as the process.
pub struct NoopPersistence;

#[async_trait]
impl MemoryPersistence for NoopPersistence {
    fn name(&self) -> &str {
        "none"
    }

    async fn append_episodic(&self, _record: &EpisodicRecord) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn evict_episodic(
        &self,
        _workspace_id: &WorkspaceId,
        _through: u64,
    ) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn save_semantic(
        &self,
        _workspace_id: &WorkspaceId,
        _facts: &[SemanticFact],
    ) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn save_procedural(
        &self,
        _workspace_id: &WorkspaceId,
        _workflows: &[ProceduralWorkflow],
    ) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn save_promotion_state(
        &self,
        _workspace_id: &WorkspaceId,
        _state: &PromotionState,
    ) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn load(&self, _workspace_id: &WorkspaceId) -> Result<PersistedPartition, MemoryError> {
        Ok(PersistedPartition::default())
    }

    async fn workspaces(&self) -> Result<Vec<WorkspaceId>, MemoryError> {
        Ok(Vec::new())
    }

    async fn purge(&self, _workspace_id: &WorkspaceId) -> Result<(), MemoryError> {
        Ok(())
    }
}

/// Open the backend named in `config.backend`.
pub async fn build_from_config(
    config: &MemoryConfig,
) -> Result<Arc<dyn MemoryPersistence>, MemoryError> {
    let backend: Arc<dyn MemoryPersistence> = match config.backend.as_str() {
        "none" => Arc::new(NoopPersistence),
        "jsonl" => Arc::new(JsonlPersistence::new(config.resolved_data_dir())),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let dir = config.resolved_data_dir();
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                MemoryError::Storage(format!("Failed to create memory directory: {e}"))
            })?;
            let path = dir.join("memory.db");
            Arc::new(SqlitePersistence::new(&format!("sqlite://{}", path.display())).await?)
        }
        other => {
            return Err(MemoryError::Storage(format!(
                "Unknown memory backend: {other}"
            )));
        }
    };
    info!(backend = backend.name(), "Memory persistence ready");
    Ok(backend)
}
