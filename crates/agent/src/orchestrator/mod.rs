//! The Planner/Navigator loop.
//!
//! ```text
//! Idle → Planning → AwaitingApproval? → Executing → Observing
//!      → (Planning | Done | Failed) → Terminated{success | failure | cancelled}
//! ```
//!
//! One task runs per workspace at a time. Every transition is recorded in
//! the task's report and published on the event bus. The only places a task
//! suspends are the approval gate, LLM calls and executor calls, each with
//! its own bound.

pub mod approval;
pub mod locks;
pub mod navigator;
pub mod planner;
pub mod report;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;
use waymark_config::OrchestratorConfig;
use waymark_core::context::ContextItem;
use waymark_core::error::{ApprovalError, ContextError, Error, OrchestratorError};
use waymark_core::event::{DomainEvent, EventBus};
use waymark_core::executor::{ActionExecutor, Observation};
use waymark_core::memory::{NewEpisode, Outcome};
use waymark_core::plan::{ApprovalRequest, Plan, Resolution, StepStatus};
use waymark_core::provider::LanguageModel;
use waymark_core::task::{TaskState, Termination};
use waymark_core::workspace::{Workspace, WorkspaceId};
use waymark_memory::MemoryStore;
use waymark_workspace::WorkspaceManager;

use crate::context::{ContextAssembler, WorkingMemory};

pub use approval::{ApprovalBroker, Decision};
pub use locks::{TaskLockGuard, TaskLocks};
pub use navigator::Navigator;
pub use planner::Planner;
pub use report::{TaskHandle, TaskReport, TaskRequest, Transition};

/// Finished tasks kept for `task_status`.
const RETAINED_TASKS: usize = 256;

/// Resolves once the task's cancel flag is set. Never resolves if the
/// sender is gone without having cancelled.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

struct TaskEntry {
    report: Arc<RwLock<TaskReport>>,
    cancel: watch::Sender<bool>,
}

/// A task that passed admission and is ready to drive.
struct TaskRun {
    task_id: String,
    workspace: Workspace,
    goal: String,
    extra: Vec<ContextItem>,
    report: Arc<RwLock<TaskReport>>,
    cancel: watch::Receiver<bool>,
    memory: WorkingMemory,
    /// Released just before the terminal transition is published.
    lock: Option<TaskLockGuard>,
}

impl TaskRun {
    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

enum PlanningOutcome {
    Ready(Plan),
    Failed(String),
    Cancelled,
}

enum PlanOutcome {
    Completed,
    StepFailed(String),
    Cancelled(String),
    /// Memory could not record what happened; nothing further is safe.
    Aborted(String),
}

enum StepResult {
    Succeeded(Observation),
    Failed(String),
    Cancelled,
    Aborted(String),
}

pub struct Orchestrator {
    workspaces: Arc<WorkspaceManager>,
    memory: MemoryStore,
    assembler: Arc<ContextAssembler>,
    planner: Planner,
    navigator: Navigator,
    approvals: Arc<ApprovalBroker>,
    events: Arc<EventBus>,
    config: OrchestratorConfig,
    tasks: RwLock<HashMap<String, TaskEntry>>,
    locks: TaskLocks,
}

impl Orchestrator {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        memory: MemoryStore,
        assembler: Arc<ContextAssembler>,
        model: Arc<dyn LanguageModel>,
        executor: Arc<dyn ActionExecutor>,
        events: Arc<EventBus>,
        config: OrchestratorConfig,
    ) -> Self {
        let planner = Planner::new(model, Duration::from_secs(config.planning_timeout_secs));
        let navigator = Navigator::new(executor, &config);
        let approvals = Arc::new(ApprovalBroker::new().with_events(events.clone()));
        Self {
            workspaces,
            memory,
            assembler,
            planner,
            navigator,
            approvals,
            events,
            config,
            tasks: RwLock::new(HashMap::new()),
            locks: TaskLocks::new(),
        }
    }

    pub fn approvals(&self) -> &Arc<ApprovalBroker> {
        &self.approvals
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ── Public operations ──

    /// Run a task to completion.
    ///
    /// Fails only if the task cannot start (unknown workspace, workspace
    /// busy). Everything after that ends in a report.
    pub async fn run_task(&self, request: TaskRequest) -> Result<TaskReport, Error> {
        let run = self.admit(request).await?;
        Ok(self.drive(run).await)
    }

    /// Start a task in the background.
    pub async fn spawn_task(self: &Arc<Self>, request: TaskRequest) -> Result<TaskHandle, Error> {
        let run = self.admit(request).await?;
        let task_id = run.task_id.clone();
        let this = Arc::clone(self);
        let join = tokio::spawn(async move { this.drive(run).await });
        Ok(TaskHandle::new(task_id, join))
    }

    /// Request cancellation. A step already executing finishes and is
    /// recorded first.
    pub async fn cancel(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let tasks = self.tasks.read().await;
        let entry = tasks
            .get(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        entry.cancel.send_replace(true);
        info!(task_id, "Task cancellation requested");
        Ok(())
    }

    pub async fn task_status(&self, task_id: &str) -> Result<TaskReport, OrchestratorError> {
        let report = {
            let tasks = self.tasks.read().await;
            tasks
                .get(task_id)
                .map(|e| e.report.clone())
                .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?
        };
        let snapshot = report.read().await.clone();
        Ok(snapshot)
    }

    /// Known tasks, newest first, optionally for one workspace.
    pub async fn tasks(&self, workspace_id: Option<&WorkspaceId>) -> Vec<TaskReport> {
        let reports: Vec<Arc<RwLock<TaskReport>>> =
            self.tasks.read().await.values().map(|e| e.report.clone()).collect();
        let mut out = Vec::with_capacity(reports.len());
        for report in reports {
            let report = report.read().await;
            if workspace_id.is_none_or(|ws| &report.workspace_id == ws) {
                out.push(report.clone());
            }
        }
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out
    }

    pub async fn pending_approvals(&self, workspace_id: Option<&WorkspaceId>) -> Vec<ApprovalRequest> {
        self.approvals.pending(workspace_id).await
    }

    pub async fn resolve_approval(
        &self,
        approval_id: &str,
        approved: bool,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.approvals.resolve(approval_id, approved).await
    }

    /// Delete a workspace and everything it owns.
    ///
    /// The workspace's task lock is held for the whole cascade, so no task
    /// can be admitted between the busy check and the purge.
    pub async fn delete_workspace(&self, workspace_id: &WorkspaceId) -> Result<(), Error> {
        let _lock = self
            .locks
            .acquire(workspace_id, &format!("delete:{workspace_id}"))?;
        self.workspaces.delete(workspace_id).await
    }

    // ── Admission ──

    async fn admit(&self, request: TaskRequest) -> Result<TaskRun, Error> {
        let workspace = self.workspaces.get(&request.workspace_id).await?;
        let task_id = Uuid::new_v4().to_string();
        let lock = self.locks.acquire(&workspace.id, &task_id)?;

        let report = Arc::new(RwLock::new(TaskReport::new(
            task_id.clone(),
            workspace.id.clone(),
            request.goal.clone(),
        )));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut tasks = self.tasks.write().await;
            prune_finished(&mut tasks).await;
            tasks.insert(
                task_id.clone(),
                TaskEntry {
                    report: report.clone(),
                    cancel: cancel_tx,
                },
            );
        }

        info!(
            task_id = %task_id,
            workspace_id = %workspace.id,
            goal = %request.goal,
            "Task accepted"
        );
        self.publish_state(&task_id, &workspace.id, TaskState::Idle, None);

        Ok(TaskRun {
            task_id,
            memory: WorkingMemory::new(request.goal.clone(), self.config.max_replans),
            goal: request.goal,
            extra: request.extra,
            workspace,
            report,
            cancel: cancel_rx,
            lock: Some(lock),
        })
    }

    // ── State machine ──

    async fn drive(&self, mut run: TaskRun) -> TaskReport {
        let (termination, reason) = self.pursue(&mut run).await;
        match termination {
            Termination::Success => self.transition(&run, TaskState::Done, None).await,
            Termination::Failure => self.transition(&run, TaskState::Failed, reason.clone()).await,
            Termination::Cancelled => {}
        }
        run.lock.take();
        self.transition(&run, TaskState::Terminated(termination), reason.clone())
            .await;

        let report = run.report.read().await.clone();
        info!(
            task_id = %run.task_id,
            workspace_id = %run.workspace.id,
            termination = ?termination,
            reason = reason.as_deref().unwrap_or(""),
            episodes = report.episodes.len(),
            summary = %run.memory.summarize(),
            "Task finished"
        );
        report
    }

    async fn pursue(&self, run: &mut TaskRun) -> (Termination, Option<String>) {
        loop {
            if run.is_cancelled() {
                return (Termination::Cancelled, Some("cancelled".into()));
            }
            self.transition(run, TaskState::Planning, None).await;

            let mut plan = match self.plan(run).await {
                PlanningOutcome::Ready(plan) => plan,
                PlanningOutcome::Failed(reason) => return (Termination::Failure, Some(reason)),
                PlanningOutcome::Cancelled => {
                    return (Termination::Cancelled, Some("cancelled during planning".into()));
                }
            };
            if plan.steps.is_empty() {
                return (Termination::Success, Some("nothing to do".into()));
            }
            run.memory.set_plan(&plan);
            run.report.write().await.plans.push(plan.clone());

            let outcome = self.execute_plan(run, &mut plan).await;
            if let Some(current) = run.report.write().await.plans.last_mut() {
                *current = plan.clone();
            }

            match outcome {
                PlanOutcome::Completed => {
                    self.workflow_feedback(run, &plan, true).await;
                    return (Termination::Success, None);
                }
                PlanOutcome::StepFailed(reason) => {
                    self.workflow_feedback(run, &plan, false).await;
                    if !run.memory.tick_replan() {
                        return (
                            Termination::Failure,
                            Some(format!(
                                "gave up after {} replans; last failure: {reason}",
                                self.config.max_replans
                            )),
                        );
                    }
                    run.report.write().await.replans = run.memory.replans;
                    info!(
                        task_id = %run.task_id,
                        replans = run.memory.replans,
                        reason = %reason,
                        "Replanning"
                    );
                }
                PlanOutcome::Cancelled(reason) => return (Termination::Cancelled, Some(reason)),
                PlanOutcome::Aborted(reason) => return (Termination::Failure, Some(reason)),
            }
        }
    }

    async fn plan(&self, run: &mut TaskRun) -> PlanningOutcome {
        let attempts = self.config.max_planning_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let pack = match self
                .assembler
                .assemble(&run.workspace.id, &run.goal, run.extra.clone())
                .await
            {
                Ok(pack) => pack,
                Err(Error::Context(e @ ContextError::BudgetExceeded { .. })) => {
                    return PlanningOutcome::Failed(e.to_string());
                }
                Err(e) => return PlanningOutcome::Failed(format!("context assembly failed: {e}")),
            };

            let result = tokio::select! {
                result = self.planner.plan(&run.goal, &pack, &run.memory) => result,
                _ = cancelled(&mut run.cancel) => return PlanningOutcome::Cancelled,
            };
            match result {
                Ok(plan) => return PlanningOutcome::Ready(plan),
                Err(e) => {
                    warn!(task_id = %run.task_id, attempt, error = %e, "Planning attempt failed");
                    run.memory
                        .add_note(&format!("planning attempt {attempt} failed: {e}"));
                    last_error = e.to_string();
                }
            }
        }
        PlanningOutcome::Failed(format!(
            "planning failed after {attempts} attempt(s): {last_error}"
        ))
    }

    async fn execute_plan(&self, run: &mut TaskRun, plan: &mut Plan) -> PlanOutcome {
        for index in 0..plan.steps.len() {
            if run.is_cancelled() {
                mark_remaining_skipped(plan, index);
                return PlanOutcome::Cancelled("cancelled".into());
            }

            let step = plan.steps[index].clone();
            if step.risk_level.requires_approval(run.workspace.autonomy_level) {
                plan.steps[index].status = StepStatus::AwaitingApproval;
                self.transition(
                    run,
                    TaskState::AwaitingApproval,
                    Some(format!(
                        "step '{}' has risk {} above autonomy {}",
                        step.description,
                        step.risk_level,
                        run.workspace.autonomy_level.value()
                    )),
                )
                .await;

                let request = ApprovalRequest {
                    id: Uuid::new_v4().to_string(),
                    task_id: run.task_id.clone(),
                    workspace_id: run.workspace.id.clone(),
                    step_id: step.id.clone(),
                    step_description: step.description.clone(),
                    action: step.action.clone(),
                    required_level: step.risk_level,
                    resolution: Resolution::Pending,
                    created_at: Utc::now(),
                };
                let timeout = run.workspace.approval_timeout();
                let reason = match self.approvals.request(request, timeout, &mut run.cancel).await {
                    Decision::Approved => None,
                    Decision::Rejected => {
                        Some(format!("approval rejected for step '{}'", step.description))
                    }
                    Decision::TimedOut => Some(
                        ApprovalError::TimedOut {
                            step_id: step.id.clone(),
                            timeout_secs: timeout.as_secs(),
                        }
                        .to_string(),
                    ),
                    Decision::Cancelled => Some("cancelled while awaiting approval".into()),
                };
                if let Some(reason) = reason {
                    mark_remaining_skipped(plan, index);
                    return PlanOutcome::Cancelled(reason);
                }
            }

            plan.steps[index].status = StepStatus::Executing;
            match self.run_step(run, plan, index).await {
                StepResult::Succeeded(observation) => {
                    plan.steps[index].status = StepStatus::Succeeded;
                    run.memory.advance_plan(Some(observation.summary));
                }
                StepResult::Failed(reason) => {
                    plan.steps[index].status = StepStatus::Failed(reason.clone());
                    run.memory.fail_plan_step(&reason);
                    mark_remaining_skipped(plan, index + 1);
                    return PlanOutcome::StepFailed(reason);
                }
                StepResult::Cancelled => {
                    mark_remaining_skipped(plan, index + 1);
                    return PlanOutcome::Cancelled("cancelled during execution".into());
                }
                StepResult::Aborted(reason) => return PlanOutcome::Aborted(reason),
            }
        }
        PlanOutcome::Completed
    }

    /// Execute one step with retries, recording every attempt.
    async fn run_step(&self, run: &mut TaskRun, plan: &Plan, index: usize) -> StepResult {
        let step = &plan.steps[index];
        let total = plan.steps.len();
        let mut attempt = 1u32;

        loop {
            self.transition(
                run,
                TaskState::Executing,
                Some(format!(
                    "step {}/{} attempt {attempt}: {}",
                    index + 1,
                    total,
                    step.description
                )),
            )
            .await;
            run.memory.add_action(&step.action.to_string());

            // The action runs to completion even if cancellation arrives.
            let result = self.navigator.execute(step).await;

            self.transition(run, TaskState::Observing, None).await;
            let cancel_requested = run.is_cancelled();
            let (outcome, observation, settled) = match &result {
                Ok(obs) if obs.partial => (Outcome::Partial, obs.summary.clone(), true),
                Ok(obs) => (Outcome::Success, obs.summary.clone(), true),
                Err(e) => (
                    Outcome::Failure,
                    e.to_string(),
                    cancel_requested || !self.navigator.should_retry(e, attempt),
                ),
            };

            let episode = NewEpisode::new(
                run.workspace.id.clone(),
                plan.id.clone(),
                plan.goal.clone(),
                step.action.clone(),
                outcome,
            )
            .with_description(step.description.clone())
            .with_observation(observation)
            .at_step(index, total)
            .attempt(attempt, settled);

            match self.memory.append_episodic(&run.workspace.id, episode).await {
                Ok(record) => run.report.write().await.episodes.push(record.sequence_no),
                Err(e) => {
                    warn!(task_id = %run.task_id, error = %e, "Failed to record observation");
                    return StepResult::Aborted(format!("failed to record observation: {e}"));
                }
            }

            let error = match result {
                Ok(observation) => {
                    run.memory.add_observation(&observation.summary);
                    return StepResult::Succeeded(observation);
                }
                Err(e) => e,
            };
            run.memory.add_observation(&format!("error: {error}"));

            if cancel_requested {
                return StepResult::Cancelled;
            }
            if !error.is_retryable() {
                // Page drifted; retrying the same step is pointless.
                run.memory
                    .record_failure(&step.description, &step.action, &error.to_string(), attempt);
                return StepResult::Failed(error.to_string());
            }
            if !self.navigator.should_retry(&error, attempt) {
                run.memory
                    .record_failure(&step.description, &step.action, &error.to_string(), attempt);
                return StepResult::Failed(format!(
                    "step '{}' failed after {attempt} attempt(s): {error}",
                    step.description
                ));
            }

            let delay = self.navigator.backoff(attempt);
            debug!(
                task_id = %run.task_id,
                step_id = %step.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying step"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(&mut run.cancel) => return StepResult::Cancelled,
            }
            if let Some(page) = self.navigator.reobserve().await {
                run.memory.add_observation(&format!("page before retry: {page}"));
            }
            attempt += 1;
        }
    }

    async fn workflow_feedback(&self, run: &TaskRun, plan: &Plan, success: bool) {
        let Some(workflow_id) = &plan.workflow_id else {
            return;
        };
        match self
            .memory
            .record_workflow_use(&run.workspace.id, workflow_id, success, Some(&plan.id))
            .await
        {
            Ok(workflow) => debug!(
                workflow_id = %workflow.id,
                success,
                success_count = workflow.success_count,
                failure_count = workflow.failure_count,
                "Workflow use recorded"
            ),
            Err(e) => warn!(workflow_id = %workflow_id, error = %e, "Failed to record workflow use"),
        }
    }

    async fn transition(&self, run: &TaskRun, state: TaskState, reason: Option<String>) {
        run.report.write().await.record(state, reason.clone());
        debug!(task_id = %run.task_id, state = %state, "Task state changed");
        self.publish_state(&run.task_id, &run.workspace.id, state, reason);
    }

    fn publish_state(
        &self,
        task_id: &str,
        workspace_id: &WorkspaceId,
        state: TaskState,
        reason: Option<String>,
    ) {
        self.events.publish(DomainEvent::TaskStateChanged {
            task_id: task_id.to_string(),
            workspace_id: workspace_id.to_string(),
            state,
            reason,
            timestamp: Utc::now(),
        });
    }
}

fn mark_remaining_skipped(plan: &mut Plan, from: usize) {
    for step in plan.steps.iter_mut().skip(from) {
        if matches!(step.status, StepStatus::Pending | StepStatus::AwaitingApproval) {
            step.status = StepStatus::Skipped;
        }
    }
}

/// Drop the oldest finished tasks once more than [`RETAINED_TASKS`] are held.
async fn prune_finished(tasks: &mut HashMap<String, TaskEntry>) {
    if tasks.len() < RETAINED_TASKS {
        return;
    }
    let mut finished = Vec::new();
    for (id, entry) in tasks.iter() {
        let report = entry.report.read().await;
        if let Some(at) = report.finished_at {
            finished.push((at, id.clone()));
        }
    }
    finished.sort();
    let excess = tasks.len() + 1 - RETAINED_TASKS;
    for (_, id) in finished.into_iter().take(excess) {
        tasks.remove(&id);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
