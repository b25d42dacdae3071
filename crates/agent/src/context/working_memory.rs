//! Working memory - the per-task scratchpad.
//!
//! Holds the current plan's progress, a trace of what the navigator did and
//! saw, the failures that forced a replan, and free-form notes. It lives
//! only as long as one task and is rendered into every planning prompt so
//! the planner does not repeat a step that already failed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use waymark_core::plan::{BrowserAction, Plan, StepStatus};

/// How many trace entries `render` shows.
const RENDERED_TRACE: usize = 12;

// ── Data Structures ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub goal: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanProgress>,

    pub trace: Vec<TraceEntry>,

    /// Steps that failed in earlier plans of this task.
    pub failures: Vec<StepFailure>,

    pub notes: Vec<String>,

    pub replans: u32,

    pub max_replans: u32,
}

/// Progress through the plan currently being executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanProgress {
    pub plan_id: String,
    pub steps: Vec<StepProgress>,
    pub current_step: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProgress {
    pub description: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub kind: TraceKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TraceKind {
    Action,
    Observation,
}

/// A step that failed and the error that ended it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailure {
    pub description: String,
    pub action: BrowserAction,
    pub error: String,
    pub attempts: u32,
}

// ── Implementation ────────────────────────────────────────────────────────

impl WorkingMemory {
    pub fn new(goal: impl Into<String>, max_replans: u32) -> Self {
        Self {
            goal: goal.into(),
            plan: None,
            trace: Vec::new(),
            failures: Vec::new(),
            notes: Vec::new(),
            replans: 0,
            max_replans,
        }
    }

    // ── Trace recording ──

    pub fn add_action(&mut self, action: &str) {
        self.push_trace(TraceKind::Action, action);
    }

    pub fn add_observation(&mut self, observation: &str) {
        self.push_trace(TraceKind::Observation, observation);
    }

    fn push_trace(&mut self, kind: TraceKind, content: &str) {
        self.trace.push(TraceEntry {
            kind,
            content: content.to_string(),
            timestamp: Utc::now(),
        });
    }

    // ── Plan management ──

    /// Track a new plan; the first step becomes current.
    pub fn set_plan(&mut self, plan: &Plan) {
        let steps = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| StepProgress {
                description: s.description.clone(),
                status: if i == 0 {
                    StepStatus::Executing
                } else {
                    StepStatus::Pending
                },
                result: None,
            })
            .collect();
        self.plan = Some(PlanProgress {
            plan_id: plan.id.clone(),
            steps,
            current_step: 0,
            workflow_id: plan.workflow_id.clone(),
        });
    }

    /// Mark the current step succeeded and move on.
    /// Returns `true` if advancement happened.
    pub fn advance_plan(&mut self, result: Option<String>) -> bool {
        let Some(plan) = &mut self.plan else {
            return false;
        };
        if plan.current_step >= plan.steps.len() {
            return false;
        }
        plan.steps[plan.current_step].status = StepStatus::Succeeded;
        plan.steps[plan.current_step].result = result;
        plan.current_step += 1;
        if let Some(next) = plan.steps.get_mut(plan.current_step) {
            next.status = StepStatus::Executing;
        }
        true
    }

    pub fn fail_plan_step(&mut self, reason: &str) {
        if let Some(plan) = &mut self.plan
            && let Some(step) = plan.steps.get_mut(plan.current_step)
        {
            step.status = StepStatus::Failed(reason.to_string());
        }
    }

    pub fn is_plan_complete(&self) -> bool {
        self.plan
            .as_ref()
            .is_some_and(|p| p.current_step >= p.steps.len())
    }

    // ── Failures ──

    pub fn record_failure(
        &mut self,
        description: &str,
        action: &BrowserAction,
        error: &str,
        attempts: u32,
    ) {
        self.fail_plan_step(error);
        self.failures.push(StepFailure {
            description: description.to_string(),
            action: action.clone(),
            error: error.to_string(),
            attempts,
        });
    }

    // ── Notes ──

    pub fn add_note(&mut self, note: &str) {
        self.notes.push(note.to_string());
    }

    // ── Replanning ──

    /// Count a replan. Returns `false` once the budget is exceeded.
    pub fn tick_replan(&mut self) -> bool {
        self.replans += 1;
        self.replans <= self.max_replans
    }

    // ── Rendering ──

    /// Render as a text section for the planning prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if let Some(plan) = &self.plan {
            out.push_str("## Current Plan\n");
            for (i, step) in plan.steps.iter().enumerate() {
                let marker = match &step.status {
                    StepStatus::Succeeded => "✓",
                    StepStatus::Executing | StepStatus::AwaitingApproval => "→",
                    StepStatus::Failed(_) => "✗",
                    StepStatus::Pending | StepStatus::Skipped => " ",
                };
                out.push_str(&format!("{}. [{}] {}\n", i + 1, marker, step.description));
                if let Some(result) = &step.result {
                    out.push_str(&format!("   Result: {result}\n"));
                }
            }
            out.push('\n');
        }

        if !self.failures.is_empty() {
            out.push_str("## Previous Failures\n");
            for f in &self.failures {
                out.push_str(&format!(
                    "- {} [{}] failed after {} attempt(s): {}\n",
                    f.description, f.action, f.attempts, f.error
                ));
            }
            out.push('\n');
        }

        if !self.trace.is_empty() {
            out.push_str("## Recent Trace\n");
            let skip = self.trace.len().saturating_sub(RENDERED_TRACE);
            for entry in &self.trace[skip..] {
                let label = match entry.kind {
                    TraceKind::Action => "Action",
                    TraceKind::Observation => "Observation",
                };
                out.push_str(&format!("[{label}] {}\n", entry.content));
            }
            out.push('\n');
        }

        if !self.notes.is_empty() {
            out.push_str("## Notes\n");
            for note in &self.notes {
                out.push_str(&format!("- {note}\n"));
            }
            out.push('\n');
        }

        if self.replans > 0 {
            out.push_str(&format!("Replans: {}/{}\n", self.replans, self.max_replans));
        }

        out
    }

    /// One-line summary used as a task's final reason.
    pub fn summarize(&self) -> String {
        let mut parts = Vec::new();
        if let Some(plan) = &self.plan {
            let done = plan
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Succeeded)
                .count();
            parts.push(format!("{done}/{} steps completed", plan.steps.len()));
        }
        if !self.failures.is_empty() {
            parts.push(format!("{} failed step(s)", self.failures.len()));
        }
        parts.push(format!("{} replan(s)", self.replans));
        parts.join(", ")
    }

    pub fn item_count(&self) -> usize {
        usize::from(self.plan.is_some()) + self.trace.len() + self.failures.len() + self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plan.is_none() && self.trace.is_empty() && self.failures.is_empty() && self.notes.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
