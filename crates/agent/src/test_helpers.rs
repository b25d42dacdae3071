//! Shared fakes and fixtures for context and orchestrator tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use waymark_config::{ContextConfig, OrchestratorConfig};
use waymark_core::context::{ContextItem, Tier};
use waymark_core::error::{AutomationError, CapabilityError};
use waymark_core::event::EventBus;
use waymark_core::executor::{ActionExecutor, Observation, PageState};
use waymark_core::plan::Step;
use waymark_core::provider::{GenerateRequest, GenerateResponse, LanguageModel, ModelKind};
use waymark_core::workspace::{WorkspaceConfig, WorkspaceId};
use waymark_memory::{MemorySettings, MemoryStore, NoopPersistence};
use waymark_workspace::WorkspaceManager;

use crate::context::{ContextAssembler, PinBoard};
use crate::orchestrator::Orchestrator;

// ── Language model ──

/// A model that replies from a script, one entry per call.
///
/// Once the script runs out it either repeats a fallback reply or fails
/// with `Unavailable`.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new<S: Into<String>>(replies: Vec<S>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            fallback: None,
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always reply with `reply`.
    pub fn repeating(reply: String) -> Self {
        let mut model = Self::new(Vec::<String>::new());
        model.fallback = Some(reply);
        model
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// Prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn kind(&self) -> ModelKind {
        ModelKind::OnDevice
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, CapabilityError> {
        self.prompts.lock().unwrap().push(request.prompt);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        let text = next
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| CapabilityError::Unavailable("script exhausted".into()))?;
        Ok(GenerateResponse {
            text,
            model: "scripted".into(),
            usage: None,
        })
    }
}

/// A plan reply with one step per `(description, action)` pair.
pub fn plan_json(steps: &[(&str, &str)]) -> String {
    let steps: Vec<serde_json::Value> = steps
        .iter()
        .map(|(description, action)| {
            serde_json::json!({ "description": description, "action": action })
        })
        .collect();
    serde_json::json!({ "steps": steps }).to_string()
}

/// A summarizer that always extracts `statement`.
pub fn fact_model(statement: &str) -> Arc<dyn LanguageModel> {
    let reply = serde_json::json!({
        "facts": [{ "statement": statement, "confidence": 0.8 }]
    })
    .to_string();
    Arc::new(ScriptedModel::repeating(reply))
}

// ── Executor ──

/// A browser stand-in. Scripted results are consumed in order; after that
/// every step succeeds, or fails with `always_fail` when set.
pub struct FakeExecutor {
    script: Mutex<VecDeque<Result<Observation, AutomationError>>>,
    always_fail: Option<AutomationError>,
    delay: Option<Duration>,
    executed: Mutex<Vec<String>>,
    observed: Mutex<usize>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<Result<Observation, AutomationError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            always_fail: None,
            delay: None,
            executed: Mutex::new(Vec::new()),
            observed: Mutex::new(0),
        }
    }

    pub fn failing(error: AutomationError) -> Self {
        let mut executor = Self::new();
        executor.always_fail = Some(error);
        executor
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn execute_count(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    pub fn observe_count(&self) -> usize {
        *self.observed.lock().unwrap()
    }

    /// Descriptions of executed steps, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for FakeExecutor {
    fn name(&self) -> &str {
        "fake"
    }

    async fn execute(&self, step: &Step) -> Result<Observation, AutomationError> {
        self.executed.lock().unwrap().push(step.description.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match (scripted, &self.always_fail) {
            (Some(result), _) => result,
            (None, Some(error)) => Err(error.clone()),
            (None, None) => Ok(Observation::new(format!("done: {}", step.description))),
        }
    }

    async fn observe(&self) -> Result<PageState, AutomationError> {
        *self.observed.lock().unwrap() += 1;
        Ok(PageState {
            url: "https://shop.test/".into(),
            title: "Shop".into(),
            summary: None,
        })
    }
}

// ── Fixture ──

/// Workspaces, in-memory storage and an assembler wired together.
pub struct Fixture {
    pub workspaces: Arc<WorkspaceManager>,
    pub memory: MemoryStore,
    pub assembler: Arc<ContextAssembler>,
    pub events: Arc<EventBus>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::build(None).await
    }

    pub async fn with_summarizer(model: Arc<dyn LanguageModel>) -> Self {
        Self::build(Some(model)).await
    }

    async fn build(summarizer: Option<Arc<dyn LanguageModel>>) -> Self {
        let events = Arc::new(EventBus::new(256));
        let settings = MemorySettings {
            auto_promote: false,
            ..MemorySettings::default()
        };
        let mut memory = MemoryStore::new(Arc::new(NoopPersistence), settings)
            .with_events(events.clone());
        if let Some(model) = summarizer {
            memory = memory.with_summarizer(model);
        }

        let workspaces = Arc::new(WorkspaceManager::new().with_events(events.clone()));
        let pins = Arc::new(PinBoard::new());
        workspaces.register_cascade(Arc::new(memory.clone())).await;
        workspaces.register_cascade(pins.clone()).await;

        let assembler = Arc::new(ContextAssembler::new(
            memory.clone(),
            workspaces.clone(),
            pins,
            ContextConfig::default(),
        ));
        Self {
            workspaces,
            memory,
            assembler,
            events,
        }
    }

    /// Create a workspace whose id is its name.
    pub async fn workspace(&self, name: &str, autonomy: u8, budget: usize) -> WorkspaceId {
        self.workspaces
            .create(WorkspaceConfig {
                id: Some(WorkspaceId::from(name)),
                name: name.into(),
                autonomy_level: autonomy,
                context_token_budget: budget,
                approval_timeout_secs: 30,
            })
            .await
            .unwrap()
            .id
    }

    pub fn orchestrator(
        &self,
        model: ScriptedModel,
        executor: Arc<FakeExecutor>,
        config: OrchestratorConfig,
    ) -> Orchestrator {
        self.orchestrator_with(Arc::new(model), executor, config)
    }

    pub fn orchestrator_with(
        &self,
        model: Arc<ScriptedModel>,
        executor: Arc<FakeExecutor>,
        config: OrchestratorConfig,
    ) -> Orchestrator {
        Orchestrator::new(
            self.workspaces.clone(),
            self.memory.clone(),
            self.assembler.clone(),
            model,
            executor,
            self.events.clone(),
            config,
        )
    }
}

/// A caller-supplied context item with a fixed timestamp.
pub fn external(workspace_id: &WorkspaceId, id: &str, content: &str) -> ContextItem {
    ContextItem {
        id: id.into(),
        workspace_id: workspace_id.clone(),
        tier: Tier::External,
        content: content.into(),
        token_count: crate::context::token::estimate_tokens(content),
        priority_score: 0.5,
        pinned: false,
        source_ref: None,
        compressed: false,
        sequence_no: None,
        created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
    }
}
