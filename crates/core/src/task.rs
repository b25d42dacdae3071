//! Task lifecycle states shared by the orchestrator, the event bus and the
//! gateway.

use serde::{Deserialize, Serialize};

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Success,
    Failure,
    Cancelled,
}

/// The orchestrator state machine.
///
/// `Idle → Planning → AwaitingApproval? → Executing → Observing →
/// (Planning | Done | Failed) → Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "termination", rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Planning,
    AwaitingApproval,
    Executing,
    Observing,
    Done,
    Failed,
    Terminated(Termination),
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated(_))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Observing => "observing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Terminated(Termination::Success) => "terminated:success",
            Self::Terminated(Termination::Failure) => "terminated:failure",
            Self::Terminated(Termination::Cancelled) => "terminated:cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_terminated_is_terminal() {
        assert!(TaskState::Terminated(Termination::Cancelled).is_terminal());
        assert!(!TaskState::Done.is_terminal());
        assert!(!TaskState::AwaitingApproval.is_terminal());
    }

    #[test]
    fn serializes_with_tag() {
        let json = serde_json::to_value(TaskState::Terminated(Termination::Success)).unwrap();
        assert_eq!(json["state"], "terminated");
        assert_eq!(json["termination"], "success");
        let json = serde_json::to_value(TaskState::Planning).unwrap();
        assert_eq!(json["state"], "planning");
    }
}
