//! The navigator role: runs one step against the browser.
//!
//! Each call is bounded by the step timeout. Retry policy (how many
//! attempts, how long to back off) lives here; the orchestrator decides
//! what to do with the outcome.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use waymark_config::OrchestratorConfig;
use waymark_core::error::AutomationError;
use waymark_core::executor::{ActionExecutor, Observation, PageState};
use waymark_core::plan::Step;

pub struct Navigator {
    executor: Arc<dyn ActionExecutor>,
    step_timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl Navigator {
    pub fn new(executor: Arc<dyn ActionExecutor>, config: &OrchestratorConfig) -> Self {
        Self {
            executor,
            step_timeout: Duration::from_secs(config.step_timeout_secs),
            max_attempts: config.max_step_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run the step once.
    pub async fn execute(&self, step: &Step) -> Result<Observation, AutomationError> {
        debug!(step_id = %step.id, action = %step.action, "Executing step");
        match tokio::time::timeout(self.step_timeout, self.executor.execute(step)).await {
            Ok(result) => result,
            Err(_) => Err(AutomationError::Timeout(self.step_timeout.as_secs())),
        }
    }

    /// Read the page again before a retry.
    pub async fn reobserve(&self) -> Option<PageState> {
        match tokio::time::timeout(self.step_timeout, self.executor.observe()).await {
            Ok(Ok(page)) => Some(page),
            Ok(Err(e)) => {
                warn!(error = %e, "Re-observation failed");
                None
            }
            Err(_) => {
                warn!("Re-observation timed out");
                None
            }
        }
    }

    /// Delay before attempt `attempt + 1`: `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// Whether another attempt may follow a failure on `attempt`.
    pub fn should_retry(&self, error: &AutomationError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }
}
