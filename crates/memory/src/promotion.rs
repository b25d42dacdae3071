//! Promotion: condensing the episodic log into longer-lived tiers.
//!
//! Two independent passes run over the same window of records:
//!
//! - **Summarization** asks a language model for durable facts per goal and
//!   merges them into the semantic tier, deduplicating by text similarity.
//! - **Induction** groups settled plan runs by goal signature and action
//!   structure. Enough identical successes become a procedural workflow;
//!   a cluster dominated by failures demotes the workflows it matches.
//!
//! Both passes are pure over their inputs; [`crate::MemoryStore`] owns the
//! locking and persistence around them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;
use waymark_core::error::CapabilityError;
use waymark_core::memory::{
    EpisodicRecord, Outcome, ProceduralWorkflow, PromotionState, SemanticFact, StepTemplate,
};
use waymark_core::plan::ActionKind;
use waymark_core::provider::GenerateRequest;
use waymark_core::signature::goal_signature;
use waymark_core::workspace::WorkspaceId;
use waymark_providers::StructuredGenerator;

use crate::ranking::text_similarity;

/// What one promotion pass changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromotionReport {
    pub facts_created: usize,
    pub facts_merged: usize,
    pub workflows_created: usize,
    pub workflows_reinforced: usize,
    pub workflows_demoted: usize,
    pub workflows_retired: usize,
    /// The summarizer failed; its cursor did not advance.
    pub summarization_failed: bool,
    /// Highest sequence number this pass covered.
    pub considered_through: u64,
}

/// Tunables for induction and fact merging.
#[derive(Debug, Clone)]
pub struct PromotionSettings {
    pub workflow_min_runs: usize,
    pub dedup_threshold: f32,
    pub retire_min_samples: u32,
    pub retire_success_floor: f32,
}

impl Default for PromotionSettings {
    fn default() -> Self {
        Self {
            workflow_min_runs: 3,
            dedup_threshold: 0.85,
            retire_min_samples: 5,
            retire_success_floor: 0.4,
        }
    }
}

// ── Summarization ─────────────────────────────────────────────────────────

/// A fact proposed by the summarizer, not yet merged.
#[derive(Debug, Clone, PartialEq)]
pub struct FactCandidate {
    pub statement: String,
    pub confidence: f32,
    pub sources: BTreeSet<u64>,
}

#[derive(Debug, Deserialize)]
struct FactBatch {
    #[serde(default)]
    facts: Vec<RawFact>,
}

#[derive(Debug, Deserialize)]
struct RawFact {
    statement: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
    #[serde(default)]
    sources: Vec<u64>,
}

fn default_confidence() -> f32 {
    0.5
}

const SUMMARY_SYSTEM: &str = "You condense a browser automation history into durable facts \
about the websites involved and the user's preferences. Only state facts the history \
supports. Never restate individual clicks.";

fn fact_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "statement": { "type": "string" },
                        "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                        "sources": { "type": "array", "items": { "type": "integer" } }
                    },
                    "required": ["statement", "confidence"]
                }
            }
        },
        "required": ["facts"]
    })
}

/// Records grouped by the goal signature of their plan, in log order.
pub fn group_by_goal(records: &[EpisodicRecord]) -> Vec<(String, Vec<&EpisodicRecord>)> {
    let mut groups: Vec<(String, Vec<&EpisodicRecord>)> = Vec::new();
    for record in records {
        let signature = goal_signature(&record.goal);
        match groups.iter_mut().find(|(s, _)| *s == signature) {
            Some((_, members)) => members.push(record),
            None => groups.push((signature, vec![record])),
        }
    }
    groups
}

pub fn summarization_request(goal: &str, records: &[&EpisodicRecord]) -> GenerateRequest {
    let lines: Vec<String> = records
        .iter()
        .map(|r| format!("#{} {}", r.sequence_no, r.summary()))
        .collect();
    let prompt = format!(
        "Goal: {goal}\n\nHistory:\n{}\n\n\
         List the durable facts this history establishes. For each fact give a \
         confidence between 0 and 1 and the # numbers of the entries that support it.",
        lines.join("\n")
    );
    GenerateRequest::new(prompt)
        .with_system(SUMMARY_SYSTEM)
        .with_schema(fact_schema())
}

/// Summarize every goal group. All-or-nothing: any failed group fails the
/// pass so the cursor never skips records.
pub async fn summarize(
    generator: &StructuredGenerator,
    records: &[EpisodicRecord],
) -> Result<Vec<FactCandidate>, CapabilityError> {
    let mut candidates = Vec::new();
    for (_, group) in group_by_goal(records) {
        let Some(first) = group.first() else {
            continue;
        };
        let request = summarization_request(&first.goal, &group);
        let batch: FactBatch = generator.generate(request).await?;

        let group_seqs: BTreeSet<u64> = group.iter().map(|r| r.sequence_no).collect();
        for raw in batch.facts {
            let statement = raw.statement.trim().to_string();
            if statement.is_empty() {
                continue;
            }
            let cited: BTreeSet<u64> = raw
                .sources
                .into_iter()
                .filter(|s| group_seqs.contains(s))
                .collect();
            candidates.push(FactCandidate {
                statement,
                confidence: raw.confidence.clamp(0.0, 1.0),
                sources: if cited.is_empty() {
                    group_seqs.clone()
                } else {
                    cited
                },
            });
        }
    }
    Ok(candidates)
}

/// Merge candidates into `facts`. Returns `(created, merged)`.
pub fn merge_facts(
    facts: &mut Vec<SemanticFact>,
    candidates: Vec<FactCandidate>,
    workspace_id: &WorkspaceId,
    dedup_threshold: f32,
    now: DateTime<Utc>,
) -> (usize, usize) {
    let mut created = 0;
    let mut merged = 0;
    for candidate in candidates {
        let best = facts
            .iter_mut()
            .map(|f| (text_similarity(&f.statement, &candidate.statement), f))
            .filter(|(sim, _)| *sim >= dedup_threshold)
            .max_by(|a, b| a.0.total_cmp(&b.0));

        match best {
            Some((_, fact)) => {
                fact.absorb(candidate.confidence, candidate.sources);
                merged += 1;
            }
            None => {
                facts.push(SemanticFact {
                    id: Uuid::new_v4().to_string(),
                    workspace_id: workspace_id.clone(),
                    statement: candidate.statement,
                    confidence: candidate.confidence,
                    source_record_ids: candidate.sources,
                    created_at: now,
                    last_accessed_at: now,
                    corrections: Vec::new(),
                });
                created += 1;
            }
        }
    }
    (created, merged)
}

// ── Induction ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum RunOutcome {
    Succeeded(Vec<StepTemplate>),
    Failed,
    Open,
}

#[derive(Debug)]
struct Run {
    plan_id: String,
    signature: String,
    outcome: RunOutcome,
}

fn classify(records: &[&EpisodicRecord]) -> RunOutcome {
    if records
        .iter()
        .any(|r| r.settled && r.outcome == Outcome::Failure)
    {
        return RunOutcome::Failed;
    }

    let step_count = records.iter().map(|r| r.step_count).max().unwrap_or(0);
    if step_count == 0 {
        return RunOutcome::Open;
    }
    let mut templates: Vec<Option<StepTemplate>> = vec![None; step_count];
    for record in records.iter().filter(|r| r.settled) {
        if let Some(slot) = templates.get_mut(record.step_index) {
            *slot = Some(StepTemplate {
                kind: record.action.kind,
                description: record.description.clone(),
            });
        }
    }
    match templates.into_iter().collect::<Option<Vec<_>>>() {
        Some(templates) => RunOutcome::Succeeded(templates),
        None => RunOutcome::Open,
    }
}

/// Settled runs not yet counted, in order of first appearance.
fn uncounted_runs(records: &[EpisodicRecord], counted: &BTreeSet<String>) -> Vec<Run> {
    let mut order: Vec<&str> = Vec::new();
    let mut by_plan: BTreeMap<&str, Vec<&EpisodicRecord>> = BTreeMap::new();
    for record in records {
        if counted.contains(&record.plan_id) {
            continue;
        }
        let entry = by_plan.entry(record.plan_id.as_str()).or_default();
        if entry.is_empty() {
            order.push(record.plan_id.as_str());
        }
        entry.push(record);
    }

    order
        .into_iter()
        .filter_map(|plan_id| {
            let members = by_plan.get(plan_id)?;
            let outcome = classify(members);
            if outcome == RunOutcome::Open {
                return None;
            }
            Some(Run {
                plan_id: plan_id.to_string(),
                signature: goal_signature(&members[0].goal),
                outcome,
            })
        })
        .collect()
}

/// Counts from one induction pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InductionOutcome {
    pub created: usize,
    pub reinforced: usize,
    pub demoted: usize,
    pub retired: usize,
}

/// Fold settled runs from `records` into `workflows`.
///
/// Every run that influenced a workflow is added to
/// `state.counted_runs`, so repeating the pass over the same log changes
/// nothing. Successful runs in groups too small to form a workflow stay
/// uncounted and are reconsidered next time.
pub fn induce_workflows(
    records: &[EpisodicRecord],
    workflows: &mut Vec<ProceduralWorkflow>,
    state: &mut PromotionState,
    workspace_id: &WorkspaceId,
    settings: &PromotionSettings,
    now: DateTime<Utc>,
) -> InductionOutcome {
    let mut outcome = InductionOutcome::default();

    let mut clusters: Vec<(String, Vec<Run>)> = Vec::new();
    for run in uncounted_runs(records, &state.counted_runs) {
        match clusters.iter_mut().find(|(s, _)| *s == run.signature) {
            Some((_, runs)) => runs.push(run),
            None => clusters.push((run.signature.clone(), vec![run])),
        }
    }

    for (signature, runs) in clusters {
        let failures = runs
            .iter()
            .filter(|r| r.outcome == RunOutcome::Failed)
            .count();
        let successes = runs.len() - failures;

        if failures > successes {
            for workflow in workflows
                .iter_mut()
                .filter(|w| !w.retired && w.goal_signature == signature)
            {
                workflow.failure_count += failures as u32;
                outcome.demoted += 1;
                if workflow.apply_retirement(
                    settings.retire_min_samples,
                    settings.retire_success_floor,
                ) {
                    outcome.retired += 1;
                }
            }
            state
                .counted_runs
                .extend(runs.into_iter().map(|r| r.plan_id));
            continue;
        }

        // Minority failures carry no signal; successes group by structure.
        let mut groups: Vec<(Vec<ActionKind>, Vec<StepTemplate>, Vec<String>)> = Vec::new();
        for run in runs {
            match run.outcome {
                RunOutcome::Succeeded(templates) => {
                    let structure: Vec<ActionKind> = templates.iter().map(|t| t.kind).collect();
                    match groups.iter_mut().find(|(s, _, _)| *s == structure) {
                        Some((_, _, plans)) => plans.push(run.plan_id),
                        None => groups.push((structure, templates, vec![run.plan_id])),
                    }
                }
                _ => {
                    state.counted_runs.insert(run.plan_id);
                }
            }
        }

        for (structure, templates, plans) in groups {
            let existing = workflows.iter_mut().find(|w| {
                !w.retired && w.goal_signature == signature && w.structure() == structure
            });
            match existing {
                Some(workflow) => {
                    workflow.success_count += plans.len() as u32;
                    workflow.source_plan_ids.extend(plans.iter().cloned());
                    state.counted_runs.extend(plans);
                    outcome.reinforced += 1;
                }
                None if plans.len() >= settings.workflow_min_runs.max(1) => {
                    workflows.push(ProceduralWorkflow {
                        id: Uuid::new_v4().to_string(),
                        workspace_id: workspace_id.clone(),
                        goal_signature: signature.clone(),
                        step_templates: templates,
                        success_count: plans.len() as u32,
                        failure_count: 0,
                        last_used_at: None,
                        created_at: now,
                        retired: false,
                        source_plan_ids: plans.iter().cloned().collect(),
                    });
                    state.counted_runs.extend(plans);
                    outcome.created += 1;
                }
                None => {}
            }
        }
    }

    // Forget counted plans with nothing left in the log.
    let live: BTreeSet<&str> = records.iter().map(|r| r.plan_id.as_str()).collect();
    state.counted_runs.retain(|p| live.contains(p.as_str()));

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use waymark_core::memory::NewEpisode;
    use waymark_core::plan::BrowserAction;
    use waymark_core::provider::{GenerateResponse, LanguageModel, ModelKind};

    fn ws() -> WorkspaceId {
        WorkspaceId::from("ws")
    }

    /// Appends one settled record per step, stopping at the failing step.
    fn push_run(
        log: &mut Vec<EpisodicRecord>,
        plan: &str,
        goal: &str,
        kinds: &[ActionKind],
        fail_at: Option<usize>,
    ) {
        for (i, kind) in kinds.iter().enumerate() {
            let outcome = if fail_at == Some(i) {
                Outcome::Failure
            } else {
                Outcome::Success
            };
            let seq = log.len() as u64 + 1;
            log.push(
                NewEpisode::new(ws(), plan, goal, BrowserAction::new(*kind), outcome)
                    .at_step(i, kinds.len())
                    .into_record(seq, Utc::now()),
            );
            if fail_at == Some(i) {
                break;
            }
        }
    }

    const ORDER: [ActionKind; 3] = [ActionKind::Navigate, ActionKind::Click, ActionKind::Extract];

    #[test]
    fn three_identical_runs_create_workflow() {
        let mut log = Vec::new();
        for plan in ["p1", "p2", "p3"] {
            push_run(&mut log, plan, "Check order status", &ORDER, None);
        }
        let mut workflows = Vec::new();
        let mut state = PromotionState::default();
        let outcome = induce_workflows(
            &log,
            &mut workflows,
            &mut state,
            &ws(),
            &PromotionSettings::default(),
            Utc::now(),
        );

        assert_eq!(outcome.created, 1);
        assert_eq!(workflows.len(), 1);
        assert_eq!(workflows[0].goal_signature, "check order status");
        assert_eq!(workflows[0].structure(), ORDER.to_vec());
        assert_eq!(workflows[0].success_count, 3);
        assert_eq!(workflows[0].failure_count, 0);
        assert_eq!(state.counted_runs.len(), 3);
    }

    #[test]
    fn induction_is_idempotent() {
        let mut log = Vec::new();
        for plan in ["p1", "p2", "p3"] {
            push_run(&mut log, plan, "Check order status", &ORDER, None);
        }
        let mut workflows = Vec::new();
        let mut state = PromotionState::default();
        let settings = PromotionSettings::default();
        induce_workflows(&log, &mut workflows, &mut state, &ws(), &settings, Utc::now());
        let again = induce_workflows(&log, &mut workflows, &mut state, &ws(), &settings, Utc::now());

        assert_eq!(again, InductionOutcome::default());
        assert_eq!(workflows[0].success_count, 3);
    }

    #[test]
    fn too_few_runs_stay_uncounted() {
        let mut log = Vec::new();
        push_run(&mut log, "p1", "Check order status", &ORDER, None);
        push_run(&mut log, "p2", "check the order status", &ORDER, None);
        let mut workflows = Vec::new();
        let mut state = PromotionState::default();
        let settings = PromotionSettings::default();
        induce_workflows(&log, &mut workflows, &mut state, &ws(), &settings, Utc::now());
        assert!(workflows.is_empty());
        assert!(state.counted_runs.is_empty());

        push_run(&mut log, "p3", "check order status", &ORDER, None);
        let outcome =
            induce_workflows(&log, &mut workflows, &mut state, &ws(), &settings, Utc::now());
        assert_eq!(outcome.created, 1);
        assert_eq!(workflows[0].success_count, 3);
    }

    #[test]
    fn different_structures_do_not_merge() {
        let mut log = Vec::new();
        push_run(&mut log, "p1", "check order status", &ORDER, None);
        push_run(&mut log, "p2", "check order status", &ORDER, None);
        push_run(
            &mut log,
            "p3",
            "check order status",
            &[ActionKind::Navigate, ActionKind::Extract],
            None,
        );
        let mut workflows = Vec::new();
        let mut state = PromotionState::default();
        induce_workflows(
            &log,
            &mut workflows,
            &mut state,
            &ws(),
            &PromotionSettings::default(),
            Utc::now(),
        );
        assert!(workflows.is_empty());
    }

    #[test]
    fn open_runs_are_ignored() {
        let mut log = Vec::new();
        push_run(&mut log, "p1", "check order status", &ORDER, None);
        // Only the first of three steps recorded.
        log.truncate(1);
        let runs = uncounted_runs(&log, &BTreeSet::new());
        assert!(runs.is_empty());
    }

    #[test]
    fn unsettled_failures_do_not_fail_a_run() {
        let mut log = Vec::new();
        log.push(
            NewEpisode::new(ws(), "p1", "g", BrowserAction::new(ActionKind::Click), Outcome::Failure)
                .attempt(1, false)
                .into_record(1, Utc::now()),
        );
        log.push(
            NewEpisode::new(ws(), "p1", "g", BrowserAction::new(ActionKind::Click), Outcome::Success)
                .attempt(2, true)
                .into_record(2, Utc::now()),
        );
        let runs = uncounted_runs(&log, &BTreeSet::new());
        assert_eq!(runs.len(), 1);
        assert!(matches!(runs[0].outcome, RunOutcome::Succeeded(_)));
    }

    #[test]
    fn majority_failures_demote_and_retire() {
        let mut workflows = vec![ProceduralWorkflow {
            id: "wf".into(),
            workspace_id: ws(),
            goal_signature: "check order status".into(),
            step_templates: ORDER
                .iter()
                .map(|k| StepTemplate {
                    kind: *k,
                    description: k.as_str().into(),
                })
                .collect(),
            success_count: 1,
            failure_count: 1,
            last_used_at: None,
            created_at: Utc::now(),
            retired: false,
            source_plan_ids: BTreeSet::new(),
        }];
        let mut log = Vec::new();
        for plan in ["f1", "f2", "f3"] {
            push_run(&mut log, plan, "check order status", &ORDER, Some(1));
        }
        let mut state = PromotionState::default();
        let outcome = induce_workflows(
            &log,
            &mut workflows,
            &mut state,
            &ws(),
            &PromotionSettings::default(),
            Utc::now(),
        );

        assert_eq!(outcome.demoted, 1);
        assert_eq!(outcome.retired, 1);
        assert_eq!(workflows[0].failure_count, 4);
        assert!(workflows[0].retired);
        assert_eq!(state.counted_runs.len(), 3);
    }

    #[test]
    fn existing_workflow_reinforced_by_single_run() {
        let mut log = Vec::new();
        for plan in ["p1", "p2", "p3"] {
            push_run(&mut log, plan, "check order status", &ORDER, None);
        }
        let mut workflows = Vec::new();
        let mut state = PromotionState::default();
        let settings = PromotionSettings::default();
        induce_workflows(&log, &mut workflows, &mut state, &ws(), &settings, Utc::now());

        push_run(&mut log, "p4", "check order status", &ORDER, None);
        let outcome =
            induce_workflows(&log, &mut workflows, &mut state, &ws(), &settings, Utc::now());
        assert_eq!(outcome.reinforced, 1);
        assert_eq!(workflows[0].success_count, 4);
        assert!(workflows[0].source_plan_ids.contains("p4"));
    }

    #[test]
    fn counted_runs_pruned_when_evicted() {
        let mut log = Vec::new();
        for plan in ["p1", "p2", "p3"] {
            push_run(&mut log, plan, "check order status", &ORDER, None);
        }
        let mut workflows = Vec::new();
        let mut state = PromotionState::default();
        let settings = PromotionSettings::default();
        induce_workflows(&log, &mut workflows, &mut state, &ws(), &settings, Utc::now());

        log.retain(|r| r.plan_id == "p3");
        induce_workflows(&log, &mut workflows, &mut state, &ws(), &settings, Utc::now());
        assert_eq!(state.counted_runs, BTreeSet::from(["p3".to_string()]));
        assert_eq!(workflows[0].success_count, 3);
    }

    #[test]
    fn near_duplicate_facts_merge() {
        let now = Utc::now();
        let mut facts = Vec::new();
        let (created, merged) = merge_facts(
            &mut facts,
            vec![FactCandidate {
                statement: "Checkout requires login".into(),
                confidence: 0.5,
                sources: BTreeSet::from([1]),
            }],
            &ws(),
            0.85,
            now,
        );
        assert_eq!((created, merged), (1, 0));

        let (created, merged) = merge_facts(
            &mut facts,
            vec![
                FactCandidate {
                    statement: "checkout requires login.".into(),
                    confidence: 0.5,
                    sources: BTreeSet::from([2]),
                },
                FactCandidate {
                    statement: "Shipping is free over $50".into(),
                    confidence: 0.8,
                    sources: BTreeSet::from([3]),
                },
            ],
            &ws(),
            0.85,
            now,
        );
        assert_eq!((created, merged), (1, 1));
        assert_eq!(facts.len(), 2);
        assert!((facts[0].confidence - 0.75).abs() < 1e-6);
        assert_eq!(facts[0].source_record_ids, BTreeSet::from([1, 2]));
    }

    #[test]
    fn records_grouped_by_signature() {
        let mut log = Vec::new();
        push_run(&mut log, "p1", "Buy milk", &[ActionKind::Click], None);
        push_run(&mut log, "p2", "Check order status", &[ActionKind::Click], None);
        push_run(&mut log, "p3", "buy the milk", &[ActionKind::Click], None);
        let groups = group_by_goal(&log);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "buy milk");
        assert_eq!(groups[0].1.len(), 2);
    }

    struct FixedModel {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LanguageModel for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }

        fn kind(&self) -> ModelKind {
            ModelKind::OnDevice
        }

        async fn generate(
            &self,
            request: GenerateRequest,
        ) -> Result<GenerateResponse, CapabilityError> {
            self.prompts.lock().unwrap().push(request.prompt);
            Ok(GenerateResponse {
                text: self.reply.clone(),
                model: "fixed".into(),
                usage: None,
            })
        }
    }

    #[tokio::test]
    async fn summarize_filters_citations_to_group() {
        let model = Arc::new(FixedModel {
            reply: r#"{"facts":[
                {"statement":"Orders page lists tracking numbers","confidence":0.9,"sources":[2,99]},
                {"statement":"  ","confidence":0.9},
                {"statement":"Site uses 2FA","confidence":1.7}
            ]}"#
            .into(),
            prompts: Mutex::new(Vec::new()),
        });
        let mut log = Vec::new();
        push_run(&mut log, "p1", "check order status", &ORDER, None);

        let generator = StructuredGenerator::new(model.clone());
        let facts = summarize(&generator, &log).await.unwrap();

        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].sources, BTreeSet::from([2]));
        assert_eq!(facts[1].sources, BTreeSet::from([1, 2, 3]));
        assert_eq!(facts[1].confidence, 1.0);
        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("#1 "));
    }
}
