//! SQLite persistence.
//!
//! A single table holds every tier of every workspace:
//!
//! ```text
//! memory_records(workspace_id, tier, id, seq, body, updated_at)
//!     PRIMARY KEY (workspace_id, tier, id)
//! ```
//!
//! `body` is the JSON-encoded record. Episodic rows use the sequence number
//! as both `id` and `seq`; the promotion cursors are a single row in the
//! `promotion` tier. Every query is filtered by `workspace_id`.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info, warn};
use waymark_core::error::MemoryError;
use waymark_core::memory::{
    EpisodicRecord, MemoryPersistence, PersistedPartition, ProceduralWorkflow, PromotionState,
    SemanticFact,
};
use waymark_core::workspace::WorkspaceId;

const TIER_EPISODIC: &str = "episodic";
const TIER_SEMANTIC: &str = "semantic";
const TIER_PROCEDURAL: &str = "procedural";
const TIER_PROMOTION: &str = "promotion";

pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Open (creating if needed) the database at `path`.
    pub async fn new(path: &str) -> Result<Self, MemoryError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| MemoryError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to open SQLite: {e}")))?;

        let backend = Self { pool };
        backend.run_migrations().await?;
        info!("SQLite memory persistence initialized at {path}");
        Ok(backend)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, MemoryError> {
        let backend = Self { pool };
        backend.run_migrations().await?;
        Ok(backend)
    }

    async fn run_migrations(&self) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_records (
                workspace_id TEXT NOT NULL,
                tier         TEXT NOT NULL,
                id           TEXT NOT NULL,
                seq          INTEGER NOT NULL DEFAULT 0,
                body         TEXT NOT NULL,
                updated_at   TEXT NOT NULL,
                PRIMARY KEY (workspace_id, tier, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("memory_records table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_memory_records_seq ON memory_records(workspace_id, tier, seq)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("seq index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Replace every row of one tier in one transaction.
    async fn replace_tier<'a, T: Serialize + 'a>(
        &self,
        workspace_id: &WorkspaceId,
        tier: &str,
        rows: impl Iterator<Item = (String, &'a T)>,
    ) -> Result<(), MemoryError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MemoryError::Storage(format!("begin: {e}")))?;

        sqlx::query("DELETE FROM memory_records WHERE workspace_id = ?1 AND tier = ?2")
            .bind(workspace_id.as_str())
            .bind(tier)
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryError::Storage(format!("clear {tier}: {e}")))?;

        for (id, value) in rows {
            let body = encode(value)?;
            sqlx::query(
                "INSERT INTO memory_records (workspace_id, tier, id, seq, body, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            )
            .bind(workspace_id.as_str())
            .bind(tier)
            .bind(&id)
            .bind(&body)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryError::Storage(format!("insert {tier}: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| MemoryError::Storage(format!("commit: {e}")))
    }

    async fn load_tier<T: DeserializeOwned>(
        &self,
        workspace_id: &WorkspaceId,
        tier: &str,
    ) -> Result<Vec<T>, MemoryError> {
        let rows = sqlx::query(
            "SELECT body FROM memory_records WHERE workspace_id = ?1 AND tier = ?2 ORDER BY seq, id",
        )
        .bind(workspace_id.as_str())
        .bind(tier)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("load {tier}: {e}")))?;

        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            let body: String = row
                .try_get("body")
                .map_err(|e| MemoryError::Storage(format!("body column: {e}")))?;
            match serde_json::from_str::<T>(&body) {
                Ok(value) => values.push(value),
                Err(e) => warn!(tier, error = %e, "Skipping corrupted memory row"),
            }
        }
        Ok(values)
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, MemoryError> {
    serde_json::to_string(value).map_err(|e| MemoryError::Storage(format!("serialize: {e}")))
}

#[async_trait]
impl MemoryPersistence for SqlitePersistence {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append_episodic(&self, record: &EpisodicRecord) -> Result<(), MemoryError> {
        let body = encode(record)?;
        sqlx::query(
            "INSERT INTO memory_records (workspace_id, tier, id, seq, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(record.workspace_id.as_str())
        .bind(TIER_EPISODIC)
        .bind(record.sequence_no.to_string())
        .bind(record.sequence_no as i64)
        .bind(&body)
        .bind(record.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("append episodic: {e}")))?;
        Ok(())
    }

    async fn evict_episodic(
        &self,
        workspace_id: &WorkspaceId,
        through: u64,
    ) -> Result<(), MemoryError> {
        let result = sqlx::query(
            "DELETE FROM memory_records WHERE workspace_id = ?1 AND tier = ?2 AND seq <= ?3",
        )
        .bind(workspace_id.as_str())
        .bind(TIER_EPISODIC)
        .bind(through as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("evict episodic: {e}")))?;
        debug!(
            workspace_id = %workspace_id,
            through,
            evicted = result.rows_affected(),
            "Evicted episodic records"
        );
        Ok(())
    }

    async fn save_semantic(
        &self,
        workspace_id: &WorkspaceId,
        facts: &[SemanticFact],
    ) -> Result<(), MemoryError> {
        self.replace_tier(
            workspace_id,
            TIER_SEMANTIC,
            facts.iter().map(|f| (f.id.clone(), f)),
        )
        .await
    }

    async fn save_procedural(
        &self,
        workspace_id: &WorkspaceId,
        workflows: &[ProceduralWorkflow],
    ) -> Result<(), MemoryError> {
        self.replace_tier(
            workspace_id,
            TIER_PROCEDURAL,
            workflows.iter().map(|w| (w.id.clone(), w)),
        )
        .await
    }

    async fn save_promotion_state(
        &self,
        workspace_id: &WorkspaceId,
        state: &PromotionState,
    ) -> Result<(), MemoryError> {
        self.replace_tier(
            workspace_id,
            TIER_PROMOTION,
            std::iter::once(("state".to_string(), state)),
        )
        .await
    }

    async fn load(&self, workspace_id: &WorkspaceId) -> Result<PersistedPartition, MemoryError> {
        let episodic: Vec<EpisodicRecord> = self.load_tier(workspace_id, TIER_EPISODIC).await?;
        let semantic = self.load_tier(workspace_id, TIER_SEMANTIC).await?;
        let procedural = self.load_tier(workspace_id, TIER_PROCEDURAL).await?;
        let promotion = self
            .load_tier::<PromotionState>(workspace_id, TIER_PROMOTION)
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        Ok(PersistedPartition {
            episodic: episodic
                .into_iter()
                .filter(|r| &r.workspace_id == workspace_id)
                .collect(),
            semantic,
            procedural,
            promotion,
        })
    }

    async fn workspaces(&self) -> Result<Vec<WorkspaceId>, MemoryError> {
        let rows = sqlx::query(
            "SELECT DISTINCT workspace_id FROM memory_records ORDER BY workspace_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("list workspaces: {e}")))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("workspace_id")
                    .map(WorkspaceId)
                    .map_err(|e| MemoryError::Storage(format!("workspace_id column: {e}")))
            })
            .collect()
    }

    async fn purge(&self, workspace_id: &WorkspaceId) -> Result<(), MemoryError> {
        let result = sqlx::query("DELETE FROM memory_records WHERE workspace_id = ?1")
            .bind(workspace_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryError::Storage(format!("purge: {e}")))?;
        info!(
            workspace_id = %workspace_id,
            rows = result.rows_affected(),
            "Purged SQLite memory"
        );
        Ok(())
    }
}
