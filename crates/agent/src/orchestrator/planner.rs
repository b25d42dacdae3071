//! The planner role: context + goal + working memory in, ordered plan out.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use waymark_core::context::{ContextPack, Tier};
use waymark_core::error::CapabilityError;
use waymark_core::plan::{ActionKind, BrowserAction, Plan, Step};
use waymark_core::provider::{GenerateRequest, LanguageModel};
use waymark_providers::StructuredGenerator;

use crate::context::WorkingMemory;

const PLANNER_SYSTEM: &str = "You are the planner of a browser automation agent. \
Break the user's goal into the smallest sequence of browser actions that achieves it. \
Use the known workflows when one fits the goal and set workflow_id to its id; \
otherwise leave workflow_id null. Never repeat a step listed under previous failures \
unchanged. Return an empty steps list when the goal is already achieved. \
Respond with a single JSON document and nothing else.";

#[derive(Debug, Deserialize)]
struct PlanDraft {
    #[serde(default)]
    steps: Vec<StepDraft>,
    #[serde(default)]
    workflow_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StepDraft {
    #[serde(default)]
    description: String,
    action: ActionKind,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    value: Option<String>,
}

fn plan_schema() -> serde_json::Value {
    let kinds: Vec<&str> = ActionKind::ALL.iter().map(|k| k.as_str()).collect();
    serde_json::json!({
        "type": "object",
        "properties": {
            "steps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "description": { "type": "string" },
                        "action": { "type": "string", "enum": kinds },
                        "target": { "type": "string" },
                        "value": { "type": "string" }
                    },
                    "required": ["description", "action"]
                }
            },
            "workflow_id": { "type": ["string", "null"] }
        },
        "required": ["steps"]
    })
}

pub struct Planner {
    generator: StructuredGenerator,
    timeout: Duration,
}

impl Planner {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self {
            generator: StructuredGenerator::new(model),
            timeout,
        }
    }

    /// Build the planning request.
    pub fn request(goal: &str, pack: &ContextPack, memory: &WorkingMemory) -> GenerateRequest {
        let mut prompt = format!("Goal: {goal}\n");
        let context = pack.render();
        if !context.is_empty() {
            prompt.push_str("\n# Context\n");
            prompt.push_str(&context);
            prompt.push('\n');
        }
        let scratch = memory.render();
        if !scratch.is_empty() {
            prompt.push_str("\n# Task Progress\n");
            prompt.push_str(&scratch);
        }
        GenerateRequest::new(prompt)
            .with_system(PLANNER_SYSTEM)
            .with_schema(plan_schema())
    }

    /// Ask the model for a plan. Malformed output gets one repair pass
    /// inside the structured generator before this fails.
    pub async fn plan(
        &self,
        goal: &str,
        pack: &ContextPack,
        memory: &WorkingMemory,
    ) -> Result<Plan, CapabilityError> {
        let request = Self::request(goal, pack, memory);
        let draft: PlanDraft = tokio::time::timeout(self.timeout, self.generator.generate(request))
            .await
            .map_err(|_| {
                CapabilityError::Timeout(format!(
                    "planning exceeded {}s",
                    self.timeout.as_secs()
                ))
            })??;

        let plan = into_plan(goal, draft, pack);
        info!(
            plan_id = %plan.id,
            steps = plan.steps.len(),
            max_risk = ?plan.max_risk().map(|r| r.0),
            workflow_id = ?plan.workflow_id,
            "Plan created"
        );
        Ok(plan)
    }
}

fn into_plan(goal: &str, draft: PlanDraft, pack: &ContextPack) -> Plan {
    let steps = draft
        .steps
        .into_iter()
        .map(|s| {
            let mut action = BrowserAction::new(s.action);
            action.target = s.target.filter(|t| !t.trim().is_empty());
            action.value = s.value;
            let description = if s.description.trim().is_empty() {
                action.to_string()
            } else {
                s.description
            };
            Step::new(description, action)
        })
        .collect();

    let mut plan = Plan::new(goal, steps);
    // Only workflows that were actually offered in the context count.
    plan.workflow_id = draft.workflow_id.filter(|id| {
        let offered = pack
            .items
            .iter()
            .any(|i| i.tier == Tier::Procedural && i.source_ref.as_deref() == Some(id.as_str()));
        if !offered {
            debug!(workflow_id = %id, "Planner cited a workflow that was not in context");
        }
        offered
    });
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedModel;
    use chrono::Utc;
    use waymark_core::context::{AssemblyMetadata, ContextItem};
    use waymark_core::plan::RiskLevel;
    use waymark_core::workspace::WorkspaceId;

    fn pack(items: Vec<ContextItem>) -> ContextPack {
        ContextPack {
            workspace_id: WorkspaceId::from("ws"),
            total_tokens: items.iter().map(|i| i.token_count).sum(),
            items,
            budget: 1000,
            metadata: AssemblyMetadata::default(),
        }
    }

    fn workflow_pill(id: &str) -> ContextItem {
        ContextItem {
            id: format!("procedural:{id}"),
            workspace_id: WorkspaceId::from("ws"),
            tier: Tier::Procedural,
            content: "Workflow".into(),
            token_count: 2,
            priority_score: 1.0,
            pinned: false,
            source_ref: Some(id.into()),
            compressed: false,
            sequence_no: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn parses_steps_and_derives_risk() {
        let model = Arc::new(ScriptedModel::new(vec![
            r##"Here is the plan:
            {"steps":[
              {"description":"Open the shop","action":"navigate","target":"https://shop.test"},
              {"description":"Buy it","action":"purchase","target":"#buy"}
            ]}"##,
        ]));
        let planner = Planner::new(model.clone(), Duration::from_secs(5));
        let plan = planner
            .plan("buy socks", &pack(vec![]), &WorkingMemory::new("buy socks", 3))
            .await
            .unwrap();

        assert_eq!(plan.goal, "buy socks");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].risk_level, RiskLevel(1));
        assert_eq!(plan.steps[1].risk_level, RiskLevel(5));
        assert_eq!(plan.steps[0].action.target.as_deref(), Some("https://shop.test"));
        assert!(plan.workflow_id.is_none());
    }

    #[tokio::test]
    async fn invalid_output_fails_after_repair() {
        let model = Arc::new(ScriptedModel::new(vec!["no json here", "still nothing"]));
        let planner = Planner::new(model.clone(), Duration::from_secs(5));
        let err = planner
            .plan("goal", &pack(vec![]), &WorkingMemory::new("goal", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Validation(_)));
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn workflow_id_kept_only_when_offered() {
        let reply = r#"{"steps":[{"description":"Search","action":"type"}],"workflow_id":"wf-1"}"#;
        let planner = Planner::new(
            Arc::new(ScriptedModel::new(vec![reply, reply])),
            Duration::from_secs(5),
        );
        let wm = WorkingMemory::new("search", 3);

        let with = planner
            .plan("search", &pack(vec![workflow_pill("wf-1")]), &wm)
            .await
            .unwrap();
        assert_eq!(with.workflow_id.as_deref(), Some("wf-1"));

        let without = planner.plan("search", &pack(vec![]), &wm).await.unwrap();
        assert!(without.workflow_id.is_none());
    }

    #[test]
    fn prompt_carries_context_and_failures() {
        let mut wm = WorkingMemory::new("search", 3);
        wm.record_failure(
            "Click search",
            &BrowserAction::new(ActionKind::Click),
            "button missing",
            3,
        );
        let request = Planner::request("search", &pack(vec![workflow_pill("wf-9")]), &wm);
        assert!(request.prompt.starts_with("Goal: search"));
        assert!(request.prompt.contains("[Known Workflows]"));
        assert!(request.prompt.contains("## Previous Failures"));
        assert!(request.system.is_some());
        assert!(request.response_schema.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_model_times_out() {
        let model = Arc::new(ScriptedModel::new(vec![r#"{"steps":[]}"#]).with_delay(Duration::from_secs(60)));
        let planner = Planner::new(model, Duration::from_secs(5));
        let err = planner
            .plan("goal", &pack(vec![]), &WorkingMemory::new("goal", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Timeout(_)));
    }
}
