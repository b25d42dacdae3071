//! Plans, steps, browser actions, risk levels and approval requests.
//!
//! A [`Plan`] is owned by the orchestrator for the lifetime of one task.
//! Steps transition independently, but a plan is abandoned wholesale when
//! the orchestrator replans or gives up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workspace::{AutonomyLevel, WorkspaceId};

/// The kind of browser action a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Scroll,
    Extract,
    Wait,
    Click,
    Select,
    Type,
    SubmitForm,
    Download,
    Purchase,
}

impl ActionKind {
    /// Risk derived from the action type alone.
    pub fn risk(self) -> RiskLevel {
        let level = match self {
            Self::Navigate | Self::Scroll | Self::Extract | Self::Wait => 1,
            Self::Click | Self::Select => 2,
            Self::Type => 3,
            Self::SubmitForm | Self::Download => 4,
            Self::Purchase => 5,
        };
        RiskLevel(level)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Scroll => "scroll",
            Self::Extract => "extract",
            Self::Wait => "wait",
            Self::Click => "click",
            Self::Select => "select",
            Self::Type => "type",
            Self::SubmitForm => "submit_form",
            Self::Download => "download",
            Self::Purchase => "purchase",
        }
    }

    /// All kinds, used to build the planner's response schema.
    pub const ALL: [ActionKind; 10] = [
        Self::Navigate,
        Self::Scroll,
        Self::Extract,
        Self::Wait,
        Self::Click,
        Self::Select,
        Self::Type,
        Self::SubmitForm,
        Self::Download,
        Self::Purchase,
    ];
}

/// Risk of a step on the same 1..=5 scale as [`AutonomyLevel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RiskLevel(pub u8);

impl RiskLevel {
    /// Whether a step at this risk needs a human in a workspace with `autonomy`.
    pub fn requires_approval(self, autonomy: AutonomyLevel) -> bool {
        self.0 > autonomy.value()
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One browser action as handed to the action executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserAction {
    pub kind: ActionKind,
    /// Selector, URL or element description the action applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Text to type, option to select, etc.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl BrowserAction {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            target: None,
            value: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

impl std::fmt::Display for BrowserAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(target) = &self.target {
            write!(f, " {target}")?;
        }
        if let Some(value) = &self.value {
            write!(f, " = {value:?}")?;
        }
        Ok(())
    }
}

/// Status of a plan step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    AwaitingApproval,
    Executing,
    Succeeded,
    Failed(String),
    Skipped,
}

/// A single step in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub description: String,
    pub action: BrowserAction,
    pub risk_level: RiskLevel,
    pub status: StepStatus,
}

impl Step {
    /// Create a pending step; risk is derived from the action kind.
    pub fn new(description: impl Into<String>, action: BrowserAction) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            risk_level: action.kind.risk(),
            action,
            status: StepStatus::Pending,
        }
    }
}

/// An ordered action plan for a goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub goal: String,
    pub steps: Vec<Step>,
    /// Procedural workflow the planner followed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
}

impl Plan {
    pub fn new(goal: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            steps,
            workflow_id: None,
        }
    }

    /// Highest risk of any step; `None` for an empty plan.
    pub fn max_risk(&self) -> Option<RiskLevel> {
        self.steps.iter().map(|s| s.risk_level).max()
    }
}

/// How an approval request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

/// A request for a human to allow a step that exceeds workspace autonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub task_id: String,
    pub workspace_id: WorkspaceId,
    pub step_id: String,
    pub step_description: String,
    pub action: BrowserAction,
    pub required_level: RiskLevel,
    pub resolution: Resolution,
    pub created_at: DateTime<Utc>,
}
