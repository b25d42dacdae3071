//! Workspace domain types - the isolation boundary for memory, context,
//! and autonomy policy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, WorkspaceError};

/// Unique identifier for a workspace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(pub String);

impl WorkspaceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkspaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How much the agent may do in a workspace without asking a human.
///
/// A step whose risk level is strictly greater than the autonomy level
/// requires approval. Valid range is 1..=5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct AutonomyLevel(u8);

impl AutonomyLevel {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn new(level: u8) -> Result<Self, WorkspaceError> {
        if (Self::MIN..=Self::MAX).contains(&level) {
            Ok(Self(level))
        } else {
            Err(WorkspaceError::Invalid(format!(
                "autonomy level must be between {} and {}, got {level}",
                Self::MIN,
                Self::MAX
            )))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for AutonomyLevel {
    fn default() -> Self {
        Self(2)
    }
}

impl TryFrom<u8> for AutonomyLevel {
    type Error = WorkspaceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AutonomyLevel> for u8 {
    fn from(level: AutonomyLevel) -> Self {
        level.0
    }
}

/// A workspace and its policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub autonomy_level: AutonomyLevel,
    /// Total tokens the assembled context may use, before reserved overhead.
    pub context_token_budget: usize,
    /// Seconds a pending approval may wait before the task is cancelled.
    pub approval_timeout_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }
}

/// Input for creating a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Explicit id; a fresh UUID is generated when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<WorkspaceId>,
    pub name: String,
    pub autonomy_level: u8,
    pub context_token_budget: usize,
    pub approval_timeout_secs: u64,
}

impl WorkspaceConfig {
    /// Validate and turn the config into a workspace.
    pub fn into_workspace(self) -> Result<Workspace, WorkspaceError> {
        if self.name.trim().is_empty() {
            return Err(WorkspaceError::Invalid("name must not be empty".into()));
        }
        if self.context_token_budget == 0 {
            return Err(WorkspaceError::Invalid(
                "context_token_budget must be greater than zero".into(),
            ));
        }
        Ok(Workspace {
            id: self.id.unwrap_or_default(),
            name: self.name,
            autonomy_level: AutonomyLevel::new(self.autonomy_level)?,
            context_token_budget: self.context_token_budget,
            approval_timeout_secs: self.approval_timeout_secs,
            created_at: Utc::now(),
        })
    }
}

/// A partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspacePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomy_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_token_budget: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout_secs: Option<u64>,
}

impl WorkspacePatch {
    /// Apply the patch, validating every changed field before mutating.
    pub fn apply(&self, workspace: &mut Workspace) -> Result<(), WorkspaceError> {
        let autonomy = self.autonomy_level.map(AutonomyLevel::new).transpose()?;
        if let Some(name) = &self.name
            && name.trim().is_empty()
        {
            return Err(WorkspaceError::Invalid("name must not be empty".into()));
        }
        if self.context_token_budget == Some(0) {
            return Err(WorkspaceError::Invalid(
                "context_token_budget must be greater than zero".into(),
            ));
        }

        if let Some(name) = &self.name {
            workspace.name = name.clone();
        }
        if let Some(level) = autonomy {
            workspace.autonomy_level = level;
        }
        if let Some(budget) = self.context_token_budget {
            workspace.context_token_budget = budget;
        }
        if let Some(timeout) = self.approval_timeout_secs {
            workspace.approval_timeout_secs = timeout;
        }
        Ok(())
    }
}

/// State owned on behalf of a workspace that must disappear with it.
///
/// The workspace manager calls `purge` on every registered cascade while
/// holding its write lock, so no reader observes a half-deleted workspace.
#[async_trait]
pub trait WorkspaceCascade: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Drop all state scoped to `workspace_id`.
    async fn purge(&self, workspace_id: &WorkspaceId) -> std::result::Result<(), Error>;
}
