//! Task requests, handles and the running report of a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use waymark_core::context::ContextItem;
use waymark_core::error::{Error, OrchestratorError};
use waymark_core::plan::Plan;
use waymark_core::task::{TaskState, Termination};
use waymark_core::workspace::WorkspaceId;

/// A goal to pursue in one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub workspace_id: WorkspaceId,
    pub goal: String,
    /// Extra context items offered to every assembly for this task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<ContextItem>,
}

impl TaskRequest {
    pub fn new(workspace_id: WorkspaceId, goal: impl Into<String>) -> Self {
        Self {
            workspace_id,
            goal: goal.into(),
            extra: Vec::new(),
        }
    }

    pub fn with_extra(mut self, items: Vec<ContextItem>) -> Self {
        self.extra = items;
        self
    }
}

/// One state change of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Everything that happened during a task, updated as it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub workspace_id: WorkspaceId,
    pub goal: String,
    pub state: TaskState,
    /// Why the task ended (or the latest transition's reason while running).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub transitions: Vec<Transition>,
    /// Every plan tried, in order; the last one is current.
    pub plans: Vec<Plan>,
    /// Sequence numbers of the episodic records this task appended.
    pub episodes: Vec<u64>,
    pub replans: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskReport {
    pub(crate) fn new(task_id: String, workspace_id: WorkspaceId, goal: String) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            workspace_id,
            goal,
            state: TaskState::Idle,
            reason: None,
            transitions: vec![Transition {
                state: TaskState::Idle,
                reason: None,
                at: now,
            }],
            plans: Vec::new(),
            episodes: Vec::new(),
            replans: 0,
            started_at: now,
            finished_at: None,
        }
    }

    pub(crate) fn record(&mut self, state: TaskState, reason: Option<String>) {
        let at = Utc::now();
        self.state = state;
        if reason.is_some() || state.is_terminal() {
            self.reason = reason.clone();
        }
        if state.is_terminal() {
            self.finished_at = Some(at);
        }
        self.transitions.push(Transition { state, reason, at });
    }

    pub fn termination(&self) -> Option<Termination> {
        match self.state {
            TaskState::Terminated(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the task ever entered `state`.
    pub fn visited(&self, state: TaskState) -> bool {
        self.transitions.iter().any(|t| t.state == state)
    }

    /// States in the order they were entered.
    pub fn states(&self) -> Vec<TaskState> {
        self.transitions.iter().map(|t| t.state).collect()
    }
}

/// A task running in the background.
pub struct TaskHandle {
    task_id: String,
    join: JoinHandle<TaskReport>,
}

impl TaskHandle {
    pub(crate) fn new(task_id: String, join: JoinHandle<TaskReport>) -> Self {
        Self { task_id, join }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the task to finish.
    pub async fn join(self) -> Result<TaskReport, Error> {
        self.join.await.map_err(|e| {
            Error::Orchestrator(OrchestratorError::TaskNotFound(format!(
                "{} (task aborted: {e})",
                self.task_id
            )))
        })
    }
}
