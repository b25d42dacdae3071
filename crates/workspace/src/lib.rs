//! Workspace registry for Waymark.
//!
//! The [`WorkspaceManager`] is the single source of truth for workspace
//! identity and policy (autonomy level, context budget, approval timeout).
//! Every other component resolves a workspace here before acting.
//!
//! Deletion cascades to every registered [`WorkspaceCascade`] while the
//! registry's write lock is held, so no reader can observe a workspace that
//! is half gone.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use waymark_core::error::{Error, WorkspaceError};
use waymark_core::event::{DomainEvent, EventBus};
use waymark_core::workspace::{
    Workspace, WorkspaceCascade, WorkspaceConfig, WorkspaceId, WorkspacePatch,
};

pub struct WorkspaceManager {
    workspaces: RwLock<BTreeMap<WorkspaceId, Workspace>>,
    cascades: RwLock<Vec<Arc<dyn WorkspaceCascade>>>,
    events: Option<Arc<EventBus>>,
}

impl WorkspaceManager {
    pub fn new() -> Self {
        Self {
            workspaces: RwLock::new(BTreeMap::new()),
            cascades: RwLock::new(Vec::new()),
            events: None,
        }
    }

    /// Publish workspace lifecycle events on `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Register state that must be purged when a workspace is deleted.
    pub async fn register_cascade(&self, cascade: Arc<dyn WorkspaceCascade>) {
        info!(cascade = cascade.name(), "Registered workspace cascade");
        self.cascades.write().await.push(cascade);
    }

    pub async fn create(&self, config: WorkspaceConfig) -> Result<Workspace, WorkspaceError> {
        let workspace = config.into_workspace()?;
        let mut workspaces = self.workspaces.write().await;
        if workspaces.contains_key(&workspace.id) {
            return Err(WorkspaceError::Invalid(format!(
                "workspace {} already exists",
                workspace.id
            )));
        }
        workspaces.insert(workspace.id.clone(), workspace.clone());
        drop(workspaces);

        info!(
            workspace_id = %workspace.id,
            name = %workspace.name,
            autonomy = workspace.autonomy_level.value(),
            "Workspace created"
        );
        self.publish(DomainEvent::WorkspaceCreated {
            workspace_id: workspace.id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(workspace)
    }

    /// Create every configured workspace that does not exist yet.
    pub async fn seed(&self, configs: Vec<WorkspaceConfig>) -> Result<usize, WorkspaceError> {
        let mut created = 0;
        for config in configs {
            if let Some(id) = &config.id
                && self.workspaces.read().await.contains_key(id)
            {
                continue;
            }
            self.create(config).await?;
            created += 1;
        }
        Ok(created)
    }

    pub async fn get(&self, id: &WorkspaceId) -> Result<Workspace, WorkspaceError> {
        self.workspaces
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| WorkspaceError::NotFound(id.to_string()))
    }

    /// All workspaces, ordered by id.
    pub async fn list(&self) -> Vec<Workspace> {
        self.workspaces.read().await.values().cloned().collect()
    }

    pub async fn update(
        &self,
        id: &WorkspaceId,
        patch: WorkspacePatch,
    ) -> Result<Workspace, WorkspaceError> {
        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces
            .get_mut(id)
            .ok_or_else(|| WorkspaceError::NotFound(id.to_string()))?;
        patch.apply(workspace)?;
        info!(workspace_id = %id, "Workspace updated");
        Ok(workspace.clone())
    }

    /// Delete a workspace and everything scoped to it.
    ///
    /// The workspace is gone once this returns, even if a cascade failed;
    /// the first cascade error is returned after all cascades have run.
    pub async fn delete(&self, id: &WorkspaceId) -> Result<(), Error> {
        let mut workspaces = self.workspaces.write().await;
        if !workspaces.contains_key(id) {
            return Err(WorkspaceError::NotFound(id.to_string()).into());
        }

        let cascades = self.cascades.read().await;
        let mut first_error = None;
        for cascade in cascades.iter() {
            if let Err(e) = cascade.purge(id).await {
                warn!(
                    workspace_id = %id,
                    cascade = cascade.name(),
                    error = %e,
                    "Cascade purge failed"
                );
                first_error.get_or_insert(e);
            }
        }
        workspaces.remove(id);
        drop(cascades);
        drop(workspaces);

        info!(workspace_id = %id, "Workspace deleted");
        self.publish(DomainEvent::WorkspaceDeleted {
            workspace_id: id.to_string(),
            timestamp: Utc::now(),
        });

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

impl Default for WorkspaceManager {
    fn default() -> Self {
        Self::new()
    }
}
