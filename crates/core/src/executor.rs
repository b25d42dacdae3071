//! Action executor - the opaque browser actuator.
//!
//! The orchestrator hands one [`Step`] at a time to an executor and receives
//! either an [`Observation`] or an [`AutomationError`]. Executors must be
//! safe to call again after a failure; the caller re-observes page state
//! before every retry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AutomationError;
use crate::plan::Step;

/// A snapshot of the page the browser is on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageState {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// Condensed, text-only rendering of the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl std::fmt::Display for PageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.title, self.url)
    }
}

/// What the executor saw after performing an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub summary: String,
    #[serde(default)]
    pub page: PageState,
    /// The action ran but only part of its effect was achieved.
    #[serde(default)]
    pub partial: bool,
}

impl Observation {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            page: PageState::default(),
            partial: false,
        }
    }
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Perform one step's browser action.
    async fn execute(&self, step: &Step) -> std::result::Result<Observation, AutomationError>;

    /// Read the current page state without acting.
    async fn observe(&self) -> std::result::Result<PageState, AutomationError>;
}
