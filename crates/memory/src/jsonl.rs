//! File-based persistence: one directory per workspace.
//!
//! ```text
//! <root>/<workspace>/episodic.jsonl    one EpisodicRecord per line, append-only
//! <root>/<workspace>/semantic.json     full fact list, rewritten on save
//! <root>/<workspace>/procedural.json   full workflow list, rewritten on save
//! <root>/<workspace>/promotion.json    promotion cursors
//! ```
//!
//! Workspace ids are percent-encoded into directory names, so no id can
//! escape `<root>` or collide with another workspace's directory.
//! Human-inspectable and needs nothing beyond the filesystem.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use waymark_core::error::MemoryError;
use waymark_core::memory::{
    EpisodicRecord, MemoryPersistence, PersistedPartition, ProceduralWorkflow, PromotionState,
    SemanticFact,
};
use waymark_core::workspace::WorkspaceId;

const EPISODIC_FILE: &str = "episodic.jsonl";
const SEMANTIC_FILE: &str = "semantic.json";
const PROCEDURAL_FILE: &str = "procedural.json";
const PROMOTION_FILE: &str = "promotion.json";

pub struct JsonlPersistence {
    root: PathBuf,
}

impl JsonlPersistence {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workspace_dir(&self, workspace_id: &WorkspaceId) -> PathBuf {
        self.root.join(encode_dir_name(workspace_id.as_str()))
    }

    fn ensure_dir(&self, workspace_id: &WorkspaceId) -> Result<PathBuf, MemoryError> {
        let dir = self.workspace_dir(workspace_id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            MemoryError::Storage(format!("Failed to create memory directory: {e}"))
        })?;
        Ok(dir)
    }

    /// Load episodic records, skipping corrupted lines.
    fn load_episodic(path: &Path) -> Vec<EpisodicRecord> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<EpisodicRecord>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupted episodic record");
                    None
                }
            })
            .collect()
    }

    fn load_document<T: DeserializeOwned + Default>(path: &Path) -> Result<T, MemoryError> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                MemoryError::Storage(format!("Corrupted {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(MemoryError::Storage(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Write via a temp file and rename so a crash never leaves half a document.
    fn write_document<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), MemoryError> {
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| MemoryError::Storage(format!("Failed to serialize: {e}")))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| MemoryError::Storage(format!("Failed to write memory file: {e}")))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| MemoryError::Storage(format!("Failed to replace memory file: {e}")))
    }
}

#[async_trait]
impl MemoryPersistence for JsonlPersistence {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn append_episodic(&self, record: &EpisodicRecord) -> Result<(), MemoryError> {
        let dir = self.ensure_dir(&record.workspace_id)?;
        let mut line = serde_json::to_string(record)
            .map_err(|e| MemoryError::Storage(format!("Failed to serialize record: {e}")))?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EPISODIC_FILE))
            .map_err(|e| MemoryError::Storage(format!("Failed to open episodic log: {e}")))?;
        file.write_all(line.as_bytes())
            .map_err(|e| MemoryError::Storage(format!("Failed to append episodic log: {e}")))?;
        Ok(())
    }

    async fn evict_episodic(
        &self,
        workspace_id: &WorkspaceId,
        through: u64,
    ) -> Result<(), MemoryError> {
        let path = self.workspace_dir(workspace_id).join(EPISODIC_FILE);
        let kept: Vec<EpisodicRecord> = Self::load_episodic(&path)
            .into_iter()
            .filter(|r| r.sequence_no > through)
            .collect();

        let mut content = String::new();
        for record in &kept {
            let line = serde_json::to_string(record)
                .map_err(|e| MemoryError::Storage(format!("Failed to serialize record: {e}")))?;
            content.push_str(&line);
            content.push('\n');
        }
        if path.exists() {
            let tmp = path.with_extension("jsonl.tmp");
            std::fs::write(&tmp, content)
                .map_err(|e| MemoryError::Storage(format!("Failed to write episodic log: {e}")))?;
            std::fs::rename(&tmp, &path).map_err(|e| {
                MemoryError::Storage(format!("Failed to replace episodic log: {e}"))
            })?;
        }
        debug!(workspace_id = %workspace_id, through, kept = kept.len(), "Evicted episodic records");
        Ok(())
    }

    async fn save_semantic(
        &self,
        workspace_id: &WorkspaceId,
        facts: &[SemanticFact],
    ) -> Result<(), MemoryError> {
        let dir = self.ensure_dir(workspace_id)?;
        Self::write_document(&dir.join(SEMANTIC_FILE), facts)
    }

    async fn save_procedural(
        &self,
        workspace_id: &WorkspaceId,
        workflows: &[ProceduralWorkflow],
    ) -> Result<(), MemoryError> {
        let dir = self.ensure_dir(workspace_id)?;
        Self::write_document(&dir.join(PROCEDURAL_FILE), workflows)
    }

    async fn save_promotion_state(
        &self,
        workspace_id: &WorkspaceId,
        state: &PromotionState,
    ) -> Result<(), MemoryError> {
        let dir = self.ensure_dir(workspace_id)?;
        Self::write_document(&dir.join(PROMOTION_FILE), state)
    }

    async fn load(&self, workspace_id: &WorkspaceId) -> Result<PersistedPartition, MemoryError> {
        let dir = self.workspace_dir(workspace_id);
        let mut episodic = Self::load_episodic(&dir.join(EPISODIC_FILE));
        episodic.retain(|r| &r.workspace_id == workspace_id);
        episodic.sort_by_key(|r| r.sequence_no);
        episodic.dedup_by_key(|r| r.sequence_no);

        let partition = PersistedPartition {
            episodic,
            semantic: Self::load_document(&dir.join(SEMANTIC_FILE))?,
            procedural: Self::load_document(&dir.join(PROCEDURAL_FILE))?,
            promotion: Self::load_document(&dir.join(PROMOTION_FILE))?,
        };
        debug!(
            workspace_id = %workspace_id,
            episodic = partition.episodic.len(),
            semantic = partition.semantic.len(),
            procedural = partition.procedural.len(),
            "Loaded memory partition"
        );
        Ok(partition)
    }

    async fn workspaces(&self) -> Result<Vec<WorkspaceId>, MemoryError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(MemoryError::Storage(format!(
                    "Failed to list memory directory: {e}"
                )));
            }
        };

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(decode_dir_name) {
                Some(id) => ids.push(WorkspaceId(id)),
                None => warn!(dir = ?name, "Skipping unrecognized memory directory"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn purge(&self, workspace_id: &WorkspaceId) -> Result<(), MemoryError> {
        let dir = self.workspace_dir(workspace_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MemoryError::Storage(format!(
                "Failed to purge {}: {e}",
                dir.display()
            ))),
        }
    }
}

fn encode_dir_name(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn decode_dir_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use waymark_core::memory::{NewEpisode, Outcome};
    use waymark_core::plan::{ActionKind, BrowserAction};

    fn record(ws: &str, seq: u64) -> EpisodicRecord {
        NewEpisode::new(
            WorkspaceId::from(ws),
            "plan-1",
            "buy milk",
            BrowserAction::new(ActionKind::Click).with_target("#buy"),
            Outcome::Success,
        )
        .into_record(seq, Utc::now())
    }

    fn fact(ws: &str, statement: &str) -> SemanticFact {
        SemanticFact {
            id: format!("fact-{statement}"),
            workspace_id: WorkspaceId::from(ws),
            statement: statement.into(),
            confidence: 0.7,
            source_record_ids: BTreeSet::from([1]),
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
            corrections: Vec::new(),
        }
    }

    #[test]
    fn dir_names_roundtrip_and_stay_inside_root() {
        for id in ["shopping", "../etc", "a/b", "work space", "ünï"] {
            let encoded = encode_dir_name(id);
            assert!(!encoded.contains('/') && !encoded.contains('.'));
            assert_eq!(decode_dir_name(&encoded).as_deref(), Some(id));
        }
        assert_eq!(decode_dir_name("bad%G1"), None);
    }

    #[tokio::test]
    async fn append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let p = JsonlPersistence::new(dir.path().to_path_buf());
        let ws = WorkspaceId::from("shopping");
        p.append_episodic(&record("shopping", 1)).await.unwrap();
        p.append_episodic(&record("shopping", 2)).await.unwrap();

        let loaded = p.load(&ws).await.unwrap();
        let seqs: Vec<u64> = loaded.episodic.iter().map(|r| r.sequence_no).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(loaded.semantic.is_empty());
    }

    #[tokio::test]
    async fn corrupted_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let p = JsonlPersistence::new(dir.path().to_path_buf());
        p.append_episodic(&record("ws", 1)).await.unwrap();
        let path = dir.path().join("ws").join(EPISODIC_FILE);
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();
        drop(file);
        p.append_episodic(&record("ws", 2)).await.unwrap();

        let loaded = p.load(&WorkspaceId::from("ws")).await.unwrap();
        assert_eq!(loaded.episodic.len(), 2);
    }

    #[tokio::test]
    async fn eviction_rewrites_log() {
        let dir = tempfile::tempdir().unwrap();
        let p = JsonlPersistence::new(dir.path().to_path_buf());
        let ws = WorkspaceId::from("ws");
        for seq in 1..=5 {
            p.append_episodic(&record("ws", seq)).await.unwrap();
        }
        p.evict_episodic(&ws, 3).await.unwrap();
        let loaded = p.load(&ws).await.unwrap();
        let seqs: Vec<u64> = loaded.episodic.iter().map(|r| r.sequence_no).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn documents_saved_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let p = JsonlPersistence::new(dir.path().to_path_buf());
        let ws = WorkspaceId::from("ws");
        p.save_semantic(&ws, &[fact("ws", "login requires 2fa")])
            .await
            .unwrap();
        let state = PromotionState {
            summarized_through: 4,
            considered_through: 6,
            counted_runs: BTreeSet::from(["plan-1".to_string()]),
        };
        p.save_promotion_state(&ws, &state).await.unwrap();

        let loaded = p.load(&ws).await.unwrap();
        assert_eq!(loaded.semantic[0].statement, "login requires 2fa");
        assert_eq!(loaded.promotion, state);
        assert!(loaded.procedural.is_empty());
    }

    #[tokio::test]
    async fn workspaces_listed_and_purged() {
        let dir = tempfile::tempdir().unwrap();
        let p = JsonlPersistence::new(dir.path().to_path_buf());
        p.append_episodic(&record("a b", 1)).await.unwrap();
        p.append_episodic(&record("c", 1)).await.unwrap();
        assert_eq!(
            p.workspaces().await.unwrap(),
            vec![WorkspaceId::from("a b"), WorkspaceId::from("c")]
        );

        p.purge(&WorkspaceId::from("a b")).await.unwrap();
        p.purge(&WorkspaceId::from("missing")).await.unwrap();
        assert_eq!(p.workspaces().await.unwrap(), vec![WorkspaceId::from("c")]);
        assert!(p.load(&WorkspaceId::from("a b")).await.unwrap().episodic.is_empty());
    }
}
