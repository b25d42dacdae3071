//! One active task per workspace.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use waymark_core::error::OrchestratorError;
use waymark_core::workspace::WorkspaceId;

#[derive(Clone, Default)]
pub struct TaskLocks {
    active: Arc<Mutex<HashMap<WorkspaceId, String>>>,
}

impl TaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `workspace_id` for `task_id`; released when the guard drops.
    pub fn acquire(
        &self,
        workspace_id: &WorkspaceId,
        task_id: &str,
    ) -> Result<TaskLockGuard, OrchestratorError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(holder) = active.get(workspace_id) {
            return Err(OrchestratorError::WorkspaceBusy {
                workspace_id: workspace_id.to_string(),
                task_id: holder.clone(),
            });
        }
        active.insert(workspace_id.clone(), task_id.to_string());
        Ok(TaskLockGuard {
            locks: self.clone(),
            workspace_id: workspace_id.clone(),
        })
    }

    /// The task currently holding `workspace_id`.
    pub fn holder(&self, workspace_id: &WorkspaceId) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(workspace_id)
            .cloned()
    }
}

pub struct TaskLockGuard {
    locks: TaskLocks,
    workspace_id: WorkspaceId,
}

impl Drop for TaskLockGuard {
    fn drop(&mut self) {
        self.locks
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.workspace_id);
    }
}
