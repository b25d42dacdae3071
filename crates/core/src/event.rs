//! Domain event system - decoupled communication between bounded contexts.
//!
//! The orchestrator, memory store and workspace manager publish events here;
//! the gateway streams them to UIs over SSE.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::memory::Outcome;
use crate::plan::RiskLevel;
use crate::plan::Resolution;
use crate::task::TaskState;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    WorkspaceCreated {
        workspace_id: String,
        timestamp: DateTime<Utc>,
    },

    WorkspaceDeleted {
        workspace_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A task moved to a new orchestrator state.
    TaskStateChanged {
        task_id: String,
        workspace_id: String,
        state: TaskState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    ApprovalRequested {
        approval_id: String,
        task_id: String,
        workspace_id: String,
        step_description: String,
        required_level: RiskLevel,
        timestamp: DateTime<Utc>,
    },

    ApprovalResolved {
        approval_id: String,
        resolution: Resolution,
        timestamp: DateTime<Utc>,
    },

    /// An episodic record was durably appended.
    EpisodeRecorded {
        workspace_id: String,
        sequence_no: u64,
        outcome: Outcome,
        timestamp: DateTime<Utc>,
    },

    PromotionCompleted {
        workspace_id: String,
        facts_created: usize,
        facts_merged: usize,
        workflows_created: usize,
        workflows_updated: usize,
        timestamp: DateTime<Utc>,
    },

    /// An error was absorbed by a component rather than surfaced.
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Workspace the event is scoped to, if any.
    pub fn workspace_id(&self) -> Option<&str> {
        match self {
            Self::WorkspaceCreated { workspace_id, .. }
            | Self::WorkspaceDeleted { workspace_id, .. }
            | Self::TaskStateChanged { workspace_id, .. }
            | Self::ApprovalRequested { workspace_id, .. }
            | Self::EpisodeRecorded { workspace_id, .. }
            | Self::PromotionCompleted { workspace_id, .. } => Some(workspace_id),
            Self::ApprovalResolved { .. } | Self::ErrorOccurred { .. } => None,
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Slow subscribers lag and lose the oldest events; publishers never block.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
