//! Error types for the Waymark domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the top-level [`Error`]
//! aggregates them so task-level code can propagate with `?`.

use thiserror::Error;

/// The top-level error type for all Waymark operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Workspace errors ---
    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Context assembly errors ---
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    // --- LLM capability errors ---
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    // --- Browser automation errors ---
    #[error("Automation error: {0}")]
    Automation(#[from] AutomationError),

    // --- Approval errors ---
    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    // --- Orchestration errors ---
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkspaceError {
    #[error("Workspace not found: {0}")]
    NotFound(String),

    #[error("Invalid workspace configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// A caller tried to read or write across a workspace boundary.
    #[error("Isolation violation: {operation} targeted workspace {expected} with an entity owned by {actual}")]
    IsolationViolation {
        operation: String,
        expected: String,
        actual: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Semantic fact not found: {0}")]
    FactNotFound(String),

    #[error("Procedural workflow not found: {0}")]
    WorkflowNotFound(String),
}

impl MemoryError {
    pub fn isolation(
        operation: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::IsolationViolation {
            operation: operation.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    /// Pinned items alone do not fit in the workspace budget.
    #[error("Pinned context ({pinned_tokens} tokens in {pinned_items} items) exceeds the available budget ({budget} tokens)")]
    BudgetExceeded {
        pinned_tokens: usize,
        pinned_items: usize,
        budget: usize,
    },

    #[error("Context item not found: {0}")]
    ItemNotFound(String),

    #[error("Context item {0} cannot be edited: {1}")]
    NotEditable(String, String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    /// The capability cannot serve requests right now (model not loaded,
    /// endpoint down). Callers fall back to the next capability.
    #[error("Capability unavailable: {0}")]
    Unavailable(String),

    /// Structured output could not be parsed even after a repair attempt.
    #[error("Invalid structured output: {0}")]
    Validation(String),

    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Capability not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AutomationError {
    #[error("Browser action failed: {0}")]
    ActionFailed(String),

    #[error("Browser action timed out after {0}s")]
    Timeout(u64),

    /// The page no longer satisfies the step's precondition.
    #[error("Page state drifted: {0}")]
    PreconditionFailed(String),

    #[error("Action executor unavailable: {0}")]
    Unavailable(String),
}

impl AutomationError {
    /// Whether the same step may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::PreconditionFailed(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("Approval not granted within {timeout_secs}s for step {step_id}")]
    TimedOut { step_id: String, timeout_secs: u64 },

    #[error("Approval request not found: {0}")]
    NotFound(String),

    #[error("Approval request already resolved: {0}")]
    AlreadyResolved(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Workspace {workspace_id} already has an active task ({task_id})")]
    WorkspaceBusy {
        workspace_id: String,
        task_id: String,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),
}
