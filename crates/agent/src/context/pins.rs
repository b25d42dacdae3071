//! Per-workspace pin board.
//!
//! Holds the user's pinned context items and the items of the most recent
//! pack assembled for each workspace, so pills shown in a UI can be pinned,
//! unpinned and edited by id. Pinned items survive across assembly calls
//! until explicitly unpinned or the workspace is deleted.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use waymark_core::context::ContextItem;
use waymark_core::error::{ContextError, Error, MemoryError};
use waymark_core::workspace::{WorkspaceCascade, WorkspaceId};

use crate::context::token::estimate_tokens;

#[derive(Default)]
struct Board {
    pinned: Vec<ContextItem>,
    last_pack: Vec<ContextItem>,
}

#[derive(Default)]
pub struct PinBoard {
    boards: RwLock<HashMap<WorkspaceId, Board>>,
}

impl PinBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pinned items in pin order.
    pub async fn pinned(&self, workspace_id: &WorkspaceId) -> Vec<ContextItem> {
        self.boards
            .read()
            .await
            .get(workspace_id)
            .map(|b| b.pinned.clone())
            .unwrap_or_default()
    }

    /// Items of the latest pack for the workspace, pinned ones included.
    pub async fn last_pack(&self, workspace_id: &WorkspaceId) -> Vec<ContextItem> {
        self.boards
            .read()
            .await
            .get(workspace_id)
            .map(|b| b.last_pack.clone())
            .unwrap_or_default()
    }

    pub(crate) async fn remember_pack(&self, workspace_id: &WorkspaceId, items: &[ContextItem]) {
        let mut boards = self.boards.write().await;
        boards.entry(workspace_id.clone()).or_default().last_pack = items.to_vec();
    }

    /// Look up an item by id among pinned items first, then the last pack.
    pub async fn find(&self, workspace_id: &WorkspaceId, item_id: &str) -> Option<ContextItem> {
        let boards = self.boards.read().await;
        let board = boards.get(workspace_id)?;
        board
            .pinned
            .iter()
            .chain(board.last_pack.iter())
            .find(|i| i.id == item_id)
            .cloned()
    }

    /// Pin an item from the latest pack. Pinning an already pinned item is a
    /// no-op that returns it.
    pub async fn pin(
        &self,
        workspace_id: &WorkspaceId,
        item_id: &str,
    ) -> Result<ContextItem, ContextError> {
        let mut boards = self.boards.write().await;
        let board = boards
            .get_mut(workspace_id)
            .ok_or_else(|| ContextError::ItemNotFound(item_id.to_string()))?;

        if let Some(existing) = board.pinned.iter().find(|i| i.id == item_id) {
            return Ok(existing.clone());
        }
        let mut item = board
            .last_pack
            .iter()
            .find(|i| i.id == item_id)
            .cloned()
            .ok_or_else(|| ContextError::ItemNotFound(item_id.to_string()))?;
        item.pinned = true;
        board.pinned.push(item.clone());
        info!(workspace_id = %workspace_id, item_id, tier = ?item.tier, "Context item pinned");
        Ok(item)
    }

    /// Pin a caller-authored item directly (a user note, say).
    pub async fn pin_item(
        &self,
        workspace_id: &WorkspaceId,
        mut item: ContextItem,
    ) -> Result<ContextItem, MemoryError> {
        if &item.workspace_id != workspace_id {
            return Err(MemoryError::isolation("pin", workspace_id, &item.workspace_id));
        }
        item.pinned = true;
        item.token_count = estimate_tokens(&item.content);
        let mut boards = self.boards.write().await;
        let board = boards.entry(workspace_id.clone()).or_default();
        board.pinned.retain(|i| i.id != item.id);
        board.pinned.push(item.clone());
        info!(workspace_id = %workspace_id, item_id = %item.id, "Context item pinned");
        Ok(item)
    }

    pub async fn unpin(
        &self,
        workspace_id: &WorkspaceId,
        item_id: &str,
    ) -> Result<ContextItem, ContextError> {
        let mut boards = self.boards.write().await;
        let board = boards
            .get_mut(workspace_id)
            .ok_or_else(|| ContextError::ItemNotFound(item_id.to_string()))?;
        let index = board
            .pinned
            .iter()
            .position(|i| i.id == item_id)
            .ok_or_else(|| ContextError::ItemNotFound(item_id.to_string()))?;
        let mut item = board.pinned.remove(index);
        item.pinned = false;
        for shown in board.last_pack.iter_mut().filter(|i| i.id == item_id) {
            shown.pinned = false;
        }
        info!(workspace_id = %workspace_id, item_id, "Context item unpinned");
        Ok(item)
    }

    /// Replace an item's content wherever the board holds it.
    pub(crate) async fn replace_content(
        &self,
        workspace_id: &WorkspaceId,
        item_id: &str,
        content: &str,
    ) -> Result<ContextItem, ContextError> {
        let mut boards = self.boards.write().await;
        let board = boards
            .get_mut(workspace_id)
            .ok_or_else(|| ContextError::ItemNotFound(item_id.to_string()))?;

        let tokens = estimate_tokens(content);
        let mut updated = None;
        for item in board
            .pinned
            .iter_mut()
            .chain(board.last_pack.iter_mut())
            .filter(|i| i.id == item_id)
        {
            item.content = content.to_string();
            item.token_count = tokens;
            item.compressed = false;
            updated.get_or_insert_with(|| item.clone());
        }
        updated.ok_or_else(|| ContextError::ItemNotFound(item_id.to_string()))
    }

    /// Drop every pin and remembered pack for a workspace.
    pub async fn clear(&self, workspace_id: &WorkspaceId) -> usize {
        let removed = self.boards.write().await.remove(workspace_id);
        let count = removed.map(|b| b.pinned.len()).unwrap_or(0);
        debug!(workspace_id = %workspace_id, pins = count, "Pin board cleared");
        count
    }
}

#[async_trait]
impl WorkspaceCascade for PinBoard {
    fn name(&self) -> &str {
        "context-pins"
    }

    async fn purge(&self, workspace_id: &WorkspaceId) -> Result<(), Error> {
        self.clear(workspace_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use waymark_core::context::Tier;

    fn item(ws: &str, id: &str, content: &str) -> ContextItem {
        ContextItem {
            id: id.into(),
            workspace_id: WorkspaceId::from(ws),
            tier: Tier::External,
            content: content.into(),
            token_count: estimate_tokens(content),
            priority_score: 0.5,
            pinned: false,
            source_ref: None,
            compressed: false,
            sequence_no: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn pin_from_last_pack_and_unpin() {
        let board = PinBoard::new();
        let ws = WorkspaceId::from("ws");
        board
            .remember_pack(&ws, &[item("ws", "a", "alpha"), item("ws", "b", "beta")])
            .await;

        let pinned = board.pin(&ws, "b").await.unwrap();
        assert!(pinned.pinned);
        assert_eq!(board.pinned(&ws).await.len(), 1);

        // Pinning twice keeps one copy.
        board.pin(&ws, "b").await.unwrap();
        assert_eq!(board.pinned(&ws).await.len(), 1);

        let unpinned = board.unpin(&ws, "b").await.unwrap();
        assert!(!unpinned.pinned);
        assert!(board.pinned(&ws).await.is_empty());
        assert!(matches!(
            board.unpin(&ws, "b").await,
            Err(ContextError::ItemNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_item_not_found() {
        let board = PinBoard::new();
        let ws = WorkspaceId::from("ws");
        assert!(matches!(
            board.pin(&ws, "missing").await,
            Err(ContextError::ItemNotFound(_))
        ));
    }

    #[tokio::test]
    async fn boards_are_per_workspace() {
        let board = PinBoard::new();
        let a = WorkspaceId::from("a");
        let b = WorkspaceId::from("b");
        board.remember_pack(&a, &[item("a", "shared-id", "alpha")]).await;

        assert!(board.pin(&b, "shared-id").await.is_err());
        assert!(board.find(&b, "shared-id").await.is_none());
        assert!(board.find(&a, "shared-id").await.is_some());
    }

    #[tokio::test]
    async fn pin_item_rejects_foreign_workspace() {
        let board = PinBoard::new();
        let ws = WorkspaceId::from("a");
        let err = board.pin_item(&ws, item("b", "n", "note")).await.unwrap_err();
        assert!(matches!(err, MemoryError::IsolationViolation { .. }));
    }

    #[tokio::test]
    async fn replace_content_updates_pinned_and_shown() {
        let board = PinBoard::new();
        let ws = WorkspaceId::from("ws");
        board.remember_pack(&ws, &[item("ws", "a", "alpha")]).await;
        board.pin(&ws, "a").await.unwrap();

        let updated = board
            .replace_content(&ws, "a", "alpha, corrected")
            .await
            .unwrap();
        assert_eq!(updated.content, "alpha, corrected");
        assert_eq!(board.pinned(&ws).await[0].content, "alpha, corrected");
        assert_eq!(board.last_pack(&ws).await[0].content, "alpha, corrected");
    }

    #[tokio::test]
    async fn purge_clears_workspace() {
        let board = PinBoard::new();
        let ws = WorkspaceId::from("ws");
        board.pin_item(&ws, item("ws", "n", "note")).await.unwrap();
        WorkspaceCascade::purge(&board, &ws).await.unwrap();
        assert!(board.pinned(&ws).await.is_empty());
    }
}
