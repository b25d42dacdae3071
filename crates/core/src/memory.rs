//! Memory tiers - episodic history, semantic facts, procedural workflows.
//!
//! Episodic records are the raw, append-only log of what the agent did in a
//! workspace. The promotion pipeline condenses them into semantic facts and
//! induces procedural workflows from repeated successful runs. Every entity
//! carries the id of the workspace that owns it.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::plan::{ActionKind, BrowserAction};
use crate::workspace::WorkspaceId;

/// Result of executing one browser action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Partial,
}

impl Outcome {
    /// Weight used as the priority of an episodic item during assembly.
    pub fn weight(self) -> f32 {
        match self {
            Self::Success => 1.0,
            Self::Partial => 0.6,
            Self::Failure => 0.4,
        }
    }
}

// ── Episodic ──────────────────────────────────────────────────────────────

/// An appended, immutable entry in a workspace's episodic log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicRecord {
    pub workspace_id: WorkspaceId,
    /// Strictly increasing per workspace, never reused.
    pub sequence_no: u64,
    pub timestamp: DateTime<Utc>,
    pub action: BrowserAction,
    /// Human-readable description of the step that produced the action.
    pub description: String,
    pub observation: String,
    pub outcome: Outcome,
    pub plan_id: String,
    /// Goal of the task that produced this record.
    pub goal: String,
    pub step_index: usize,
    pub step_count: usize,
    /// 1-based attempt number for this step.
    pub attempt: u32,
    /// True when this is the final result of its step (no retry follows).
    pub settled: bool,
}

impl EpisodicRecord {
    /// One-line rendering used in prompts and relevance scoring.
    pub fn summary(&self) -> String {
        format!(
            "{} [{}] -> {:?}: {}",
            self.description, self.action, self.outcome, self.observation
        )
    }
}

/// An episodic record before the store has assigned its sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEpisode {
    pub workspace_id: WorkspaceId,
    pub action: BrowserAction,
    pub description: String,
    pub observation: String,
    pub outcome: Outcome,
    pub plan_id: String,
    pub goal: String,
    #[serde(default)]
    pub step_index: usize,
    #[serde(default = "default_step_count")]
    pub step_count: usize,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(default = "default_settled")]
    pub settled: bool,
}

fn default_step_count() -> usize {
    1
}

fn default_attempt() -> u32 {
    1
}

fn default_settled() -> bool {
    true
}

impl NewEpisode {
    /// A settled, single-step, first-attempt episode. Use the builder
    /// methods to place it inside a longer plan.
    pub fn new(
        workspace_id: WorkspaceId,
        plan_id: impl Into<String>,
        goal: impl Into<String>,
        action: BrowserAction,
        outcome: Outcome,
    ) -> Self {
        Self {
            workspace_id,
            description: action.to_string(),
            action,
            observation: String::new(),
            outcome,
            plan_id: plan_id.into(),
            goal: goal.into(),
            step_index: 0,
            step_count: 1,
            attempt: 1,
            settled: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_observation(mut self, observation: impl Into<String>) -> Self {
        self.observation = observation.into();
        self
    }

    pub fn at_step(mut self, step_index: usize, step_count: usize) -> Self {
        self.step_index = step_index;
        self.step_count = step_count;
        self
    }

    pub fn attempt(mut self, attempt: u32, settled: bool) -> Self {
        self.attempt = attempt;
        self.settled = settled;
        self
    }

    /// Stamp the episode with its sequence number.
    pub fn into_record(self, sequence_no: u64, timestamp: DateTime<Utc>) -> EpisodicRecord {
        EpisodicRecord {
            workspace_id: self.workspace_id,
            sequence_no,
            timestamp,
            action: self.action,
            description: self.description,
            observation: self.observation,
            outcome: self.outcome,
            plan_id: self.plan_id,
            goal: self.goal,
            step_index: self.step_index,
            step_count: self.step_count,
            attempt: self.attempt,
            settled: self.settled,
        }
    }
}

/// Which slice of the episodic log a query looks at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpisodeWindow {
    /// Only records with a sequence number greater than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<u64>,
    /// Maximum number of records returned; `0` means no limit.
    #[serde(default)]
    pub limit: usize,
    /// When set, results are ranked against this text instead of returned
    /// newest-first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl EpisodeWindow {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

// ── Semantic ──────────────────────────────────────────────────────────────

/// Who issued a correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionSource {
    #[default]
    User,
    Orchestrator,
}

/// A requested change to a semantic fact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Correction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub source: CorrectionSource,
}

/// An applied correction kept on the fact as an audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactCorrection {
    pub previous_statement: String,
    pub previous_confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub source: CorrectionSource,
    pub applied_at: DateTime<Utc>,
}

/// A condensed, deduplicated statement learned from episodic history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticFact {
    pub id: String,
    pub workspace_id: WorkspaceId,
    pub statement: String,
    /// In `[0, 1]`.
    pub confidence: f32,
    /// Sequence numbers of the episodic records this fact came from.
    pub source_record_ids: BTreeSet<u64>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub corrections: Vec<FactCorrection>,
}

impl SemanticFact {
    /// Merge a near-duplicate observation into this fact.
    ///
    /// Confidence combines as independent evidence, provenance is unioned.
    pub fn absorb(&mut self, confidence: f32, sources: impl IntoIterator<Item = u64>) {
        self.confidence = combine_confidence(self.confidence, confidence);
        self.source_record_ids.extend(sources);
    }

    /// Apply a correction, recording the previous value.
    pub fn apply_correction(&mut self, correction: Correction, at: DateTime<Utc>) {
        self.corrections.push(FactCorrection {
            previous_statement: self.statement.clone(),
            previous_confidence: self.confidence,
            note: correction.note,
            source: correction.source,
            applied_at: at,
        });
        if let Some(statement) = correction.statement {
            self.statement = statement;
        }
        if let Some(confidence) = correction.confidence {
            self.confidence = confidence.clamp(0.0, 1.0);
        }
    }
}

/// `1 - (1-a)(1-b)`, clamped to `[0, 1]`.
pub fn combine_confidence(a: f32, b: f32) -> f32 {
    let a = a.clamp(0.0, 1.0);
    let b = b.clamp(0.0, 1.0);
    1.0 - (1.0 - a) * (1.0 - b)
}

// ── Procedural ────────────────────────────────────────────────────────────

/// One step of a reusable workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub kind: ActionKind,
    pub description: String,
}

/// A workflow induced from repeated successful runs of the same goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProceduralWorkflow {
    pub id: String,
    pub workspace_id: WorkspaceId,
    pub goal_signature: String,
    pub step_templates: Vec<StepTemplate>,
    pub success_count: u32,
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retired: bool,
    /// Plans already counted toward this workflow.
    #[serde(default)]
    pub source_plan_ids: BTreeSet<String>,
}

impl ProceduralWorkflow {
    /// Ordered action kinds; two runs with the same structure are the same
    /// procedure.
    pub fn structure(&self) -> Vec<ActionKind> {
        self.step_templates.iter().map(|t| t.kind).collect()
    }

    pub fn success_rate(&self) -> f32 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f32 / total as f32
    }

    /// Retire the workflow if it has enough samples and a poor record.
    /// Returns `true` when this call retired it.
    pub fn apply_retirement(&mut self, min_samples: u32, success_floor: f32) -> bool {
        if self.retired {
            return false;
        }
        let samples = self.success_count + self.failure_count;
        if samples >= min_samples && self.success_rate() < success_floor {
            self.retired = true;
            return true;
        }
        false
    }

    /// Render as numbered steps for a planning prompt.
    pub fn render(&self) -> String {
        let steps: Vec<String> = self
            .step_templates
            .iter()
            .enumerate()
            .map(|(i, t)| format!("  {}. {} ({})", i + 1, t.description, t.kind.as_str()))
            .collect();
        format!(
            "Workflow {} for \"{}\" ({} ok / {} failed):\n{}",
            self.id,
            self.goal_signature,
            self.success_count,
            self.failure_count,
            steps.join("\n")
        )
    }
}

// ── Persistence ───────────────────────────────────────────────────────────

/// Bookkeeping for the promotion pipeline of one workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionState {
    /// Highest sequence number condensed into semantic facts.
    pub summarized_through: u64,
    /// Highest sequence number any completed promotion pass has seen.
    /// Records at or below it may be evicted.
    pub considered_through: u64,
    /// Plans whose runs have already been counted by workflow induction.
    #[serde(default)]
    pub counted_runs: BTreeSet<String>,
}

/// Everything persisted for one workspace.
#[derive(Debug, Clone, Default)]
pub struct PersistedPartition {
    pub episodic: Vec<EpisodicRecord>,
    pub semantic: Vec<SemanticFact>,
    pub procedural: Vec<ProceduralWorkflow>,
    pub promotion: PromotionState,
}

/// Durable storage behind the memory store.
///
/// Implementations: no-op (in-memory only), JSONL files, SQLite.
/// All methods are scoped to a single workspace; keys never span two.
#[async_trait]
pub trait MemoryPersistence: Send + Sync {
    /// The backend name (e.g., "sqlite", "jsonl", "none").
    fn name(&self) -> &str;

    /// Durably append one episodic record.
    async fn append_episodic(&self, record: &EpisodicRecord) -> Result<(), MemoryError>;

    /// Remove episodic records with `sequence_no <= through`.
    async fn evict_episodic(&self, workspace_id: &WorkspaceId, through: u64)
    -> Result<(), MemoryError>;

    /// Replace the stored semantic tier.
    async fn save_semantic(
        &self,
        workspace_id: &WorkspaceId,
        facts: &[SemanticFact],
    ) -> Result<(), MemoryError>;

    /// Replace the stored procedural tier.
    async fn save_procedural(
        &self,
        workspace_id: &WorkspaceId,
        workflows: &[ProceduralWorkflow],
    ) -> Result<(), MemoryError>;

    async fn save_promotion_state(
        &self,
        workspace_id: &WorkspaceId,
        state: &PromotionState,
    ) -> Result<(), MemoryError>;

    /// Load a workspace partition; an unknown workspace yields an empty one.
    async fn load(&self, workspace_id: &WorkspaceId) -> Result<PersistedPartition, MemoryError>;

    /// Workspaces with persisted state.
    async fn workspaces(&self) -> Result<Vec<WorkspaceId>, MemoryError>;

    /// Delete everything stored for a workspace.
    async fn purge(&self, workspace_id: &WorkspaceId) -> Result<(), MemoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(confidence: f32) -> SemanticFact {
        SemanticFact {
            id: "fact-1".into(),
            workspace_id: WorkspaceId::from("ws"),
            statement: "The search box is at the top of the page".into(),
            confidence,
            source_record_ids: BTreeSet::from([1, 2]),
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
            corrections: vec![],
        }
    }

    fn workflow(success: u32, failure: u32) -> ProceduralWorkflow {
        ProceduralWorkflow {
            id: "wf-1".into(),
            workspace_id: WorkspaceId::from("ws"),
            goal_signature: "search".into(),
            step_templates: vec![
                StepTemplate {
                    kind: ActionKind::Navigate,
                    description: "Open the site".into(),
                },
                StepTemplate {
                    kind: ActionKind::Type,
                    description: "Type the query".into(),
                },
            ],
            success_count: success,
            failure_count: failure,
            last_used_at: None,
            created_at: Utc::now(),
            retired: false,
            source_plan_ids: BTreeSet::new(),
        }
    }

    #[test]
    fn confidence_combines_as_independent_evidence() {
        let c = combine_confidence(0.5, 0.5);
        assert!((c - 0.75).abs() < 1e-6);
        assert!((combine_confidence(0.0, 0.3) - 0.3).abs() < 1e-6);
        assert!((combine_confidence(1.0, 0.1) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn absorb_unions_provenance() {
        let mut f = fact(0.6);
        f.absorb(0.5, [2, 3]);
        assert_eq!(f.source_record_ids, BTreeSet::from([1, 2, 3]));
        assert!((f.confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn correction_keeps_audit_trail() {
        let mut f = fact(0.9);
        f.apply_correction(
            Correction {
                statement: Some("The search box is in the sidebar".into()),
                confidence: Some(1.4),
                note: Some("layout changed".into()),
                source: CorrectionSource::User,
            },
            Utc::now(),
        );
        assert_eq!(f.statement, "The search box is in the sidebar");
        assert!((f.confidence - 1.0).abs() < 1e-6);
        assert_eq!(f.corrections.len(), 1);
        assert_eq!(
            f.corrections[0].previous_statement,
            "The search box is at the top of the page"
        );
    }

    #[test]
    fn retirement_needs_min_samples() {
        let mut wf = workflow(0, 2);
        assert!(!wf.apply_retirement(4, 0.5));
        wf.failure_count = 4;
        assert!(wf.apply_retirement(4, 0.5));
        assert!(wf.retired);
        assert!(!wf.apply_retirement(4, 0.5));
    }

    #[test]
    fn success_rate_handles_zero() {
        assert_eq!(workflow(0, 0).success_rate(), 0.0);
        assert!((workflow(3, 1).success_rate() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn new_episode_defaults_to_settled_single_step() {
        let ep = NewEpisode::new(
            WorkspaceId::from("ws"),
            "plan-1",
            "search for shoes",
            BrowserAction::new(ActionKind::Navigate).with_target("https://shop.test"),
            Outcome::Success,
        );
        let record = ep.into_record(7, Utc::now());
        assert_eq!(record.sequence_no, 7);
        assert!(record.settled);
        assert_eq!(record.step_count, 1);
        assert_eq!(record.description, "navigate https://shop.test");
    }

    #[test]
    fn workflow_render_lists_steps() {
        let text = workflow(2, 0).render();
        assert!(text.contains("1. Open the site (navigate)"));
        assert!(text.contains("2. Type the query (type)"));
    }
}
