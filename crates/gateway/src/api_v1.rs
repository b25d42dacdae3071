//! HTTP API v1 - the JSON surface a UI drives Waymark through.
//!
//! Endpoints:
//!
//! - `GET    /v1/status`                                - Runtime summary
//! - `GET    /v1/events`                                - SSE domain event stream
//! - `GET    /v1/workspaces`                            - List workspaces
//! - `POST   /v1/workspaces`                            - Create a workspace
//! - `GET    /v1/workspaces/{id}`                       - Get a workspace
//! - `PATCH  /v1/workspaces/{id}`                       - Update policy
//! - `DELETE /v1/workspaces/{id}`                       - Delete with cascade
//! - `POST   /v1/workspaces/{id}/context`               - Assemble a context pack
//! - `GET    /v1/workspaces/{id}/context/pins`          - Pinned items
//! - `POST   /v1/workspaces/{id}/context/pins`          - Pin an item from the last pack
//! - `POST   /v1/workspaces/{id}/context/notes`         - Pin a user note
//! - `DELETE /v1/workspaces/{id}/context/pins/{item}`   - Unpin
//! - `PATCH  /v1/workspaces/{id}/context/items/{item}`  - Edit an item's content
//! - `GET    /v1/workspaces/{id}/memory/episodic`       - Episodic window
//! - `GET    /v1/workspaces/{id}/memory/semantic`       - Ranked facts
//! - `POST   /v1/workspaces/{id}/memory/semantic/{fact}/feedback` - Correct a fact
//! - `GET    /v1/workspaces/{id}/memory/procedural`     - Matching workflows
//! - `GET    /v1/workspaces/{id}/memory/stats`          - Tier counts and cursors
//! - `POST   /v1/workspaces/{id}/memory/promote`        - Run promotion now
//! - `POST   /v1/workspaces/{id}/tasks`                 - Start a task
//! - `GET    /v1/tasks`                                 - List tasks
//! - `GET    /v1/tasks/{id}`                            - Task report
//! - `POST   /v1/tasks/{id}/cancel`                     - Cancel a task
//! - `GET    /v1/approvals`                             - Pending approvals
//! - `POST   /v1/approvals/{id}`                        - Approve or reject

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use waymark_agent::context::token::estimate_tokens;
use waymark_agent::{TaskReport, TaskRequest};
use waymark_core::context::{ContextItem, ContextPack, Tier};
use waymark_core::error::{
    ApprovalError, CapabilityError, ContextError, Error, MemoryError, OrchestratorError,
    WorkspaceError,
};
use waymark_core::memory::{
    Correction, EpisodeWindow, EpisodicRecord, ProceduralWorkflow, SemanticFact,
};
use waymark_core::plan::ApprovalRequest;
use waymark_core::signature::goal_signature;
use waymark_core::workspace::{Workspace, WorkspaceId, WorkspacePatch};
use waymark_memory::{MemoryStats, PromotionReport};

use crate::SharedState;

// ── Errors ────────────────────────────────────────────────────────────────

/// An error rendered as `{"error": "..."}` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Workspace(WorkspaceError::NotFound(_)) => StatusCode::NOT_FOUND,
        Error::Workspace(WorkspaceError::Invalid(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Memory(MemoryError::IsolationViolation { .. }) => StatusCode::FORBIDDEN,
        Error::Memory(MemoryError::FactNotFound(_) | MemoryError::WorkflowNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        Error::Memory(MemoryError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Context(ContextError::BudgetExceeded { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Context(ContextError::ItemNotFound(_)) => StatusCode::NOT_FOUND,
        Error::Context(ContextError::NotEditable(..)) => StatusCode::CONFLICT,
        Error::Capability(CapabilityError::NotConfigured(_)) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Capability(_) | Error::Automation(_) => StatusCode::BAD_GATEWAY,
        Error::Approval(ApprovalError::NotFound(_)) => StatusCode::NOT_FOUND,
        Error::Approval(_) => StatusCode::CONFLICT,
        Error::Orchestrator(OrchestratorError::WorkspaceBusy { .. }) => StatusCode::CONFLICT,
        Error::Orchestrator(OrchestratorError::TaskNotFound(_)) => StatusCode::NOT_FOUND,
        Error::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Config { .. } | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let status = status_for(&error);
        if status.is_server_error() {
            warn!(error = %error, status = status.as_u16(), "Request failed");
        }
        Self::new(status, error.to_string())
    }
}

macro_rules! from_domain_error {
    ($($ty:ty),+ $(,)?) => {
        $(impl From<$ty> for ApiError {
            fn from(error: $ty) -> Self {
                Error::from(error).into()
            }
        })+
    };
}

from_domain_error!(
    WorkspaceError,
    MemoryError,
    ContextError,
    CapabilityError,
    ApprovalError,
    OrchestratorError,
);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedState) -> axum::Router {
    let workspace_routes = Router::new()
        .route("/", get(list_workspaces_handler).post(create_workspace_handler))
        .route(
            "/{id}",
            get(get_workspace_handler)
                .patch(update_workspace_handler)
                .delete(delete_workspace_handler),
        )
        .route("/{id}/context", post(assemble_handler))
        .route("/{id}/context/pins", get(list_pins_handler).post(pin_handler))
        .route("/{id}/context/notes", post(pin_note_handler))
        .route(
            "/{id}/context/pins/{item_id}",
            axum::routing::delete(unpin_handler),
        )
        .route("/{id}/context/items/{item_id}", patch(edit_item_handler))
        .route("/{id}/memory/episodic", get(episodic_handler))
        .route("/{id}/memory/semantic", get(semantic_handler))
        .route(
            "/{id}/memory/semantic/{fact_id}/feedback",
            post(feedback_handler),
        )
        .route("/{id}/memory/procedural", get(procedural_handler))
        .route("/{id}/memory/stats", get(stats_handler))
        .route("/{id}/memory/promote", post(promote_handler))
        .route("/{id}/tasks", post(start_task_handler));

    Router::new()
        .route("/status", get(status_handler))
        .route("/events", get(event_stream_handler))
        .nest("/workspaces", workspace_routes)
        .route("/tasks", get(list_tasks_handler))
        .route("/tasks/{id}", get(get_task_handler))
        .route("/tasks/{id}/cancel", post(cancel_task_handler))
        .route("/approvals", get(list_approvals_handler))
        .route("/approvals/{id}", post(resolve_approval_handler))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateWorkspaceRequest {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    autonomy_level: Option<u8>,
    #[serde(default)]
    context_token_budget: Option<usize>,
    #[serde(default)]
    approval_timeout_secs: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct WorkspaceListResponse {
    workspaces: Vec<Workspace>,
    count: usize,
}

/// A caller-supplied context item. Defaults to the path workspace and the
/// external tier.
#[derive(Deserialize)]
struct ItemInput {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    workspace_id: Option<String>,
    content: String,
    #[serde(default = "default_priority")]
    priority: f32,
    #[serde(default)]
    pinned: bool,
}

fn default_priority() -> f32 {
    0.5
}

impl ItemInput {
    fn into_item(self, workspace_id: &WorkspaceId) -> ContextItem {
        ContextItem {
            id: self
                .id
                .unwrap_or_else(|| format!("external:{}", Uuid::new_v4())),
            workspace_id: self
                .workspace_id
                .as_deref()
                .map(WorkspaceId::from)
                .unwrap_or_else(|| workspace_id.clone()),
            tier: Tier::External,
            token_count: estimate_tokens(&self.content),
            content: self.content,
            priority_score: self.priority.clamp(0.0, 1.0),
            pinned: self.pinned,
            source_ref: None,
            compressed: false,
            sequence_no: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Deserialize)]
struct AssembleRequest {
    #[serde(default)]
    goal: String,
    #[serde(default)]
    extra: Vec<ItemInput>,
}

#[derive(Deserialize)]
struct PinRequest {
    item_id: String,
}

#[derive(Deserialize)]
struct EditRequest {
    content: String,
}

#[derive(Serialize, Deserialize)]
struct PinListResponse {
    items: Vec<ContextItem>,
    total_tokens: usize,
}

#[derive(Deserialize)]
struct SemanticQuery {
    #[serde(default)]
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

#[derive(Deserialize)]
struct ProceduralQuery {
    /// Goal text; its signature selects workflows. Empty matches all.
    #[serde(default)]
    goal: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Deserialize)]
struct StartTaskRequest {
    goal: String,
    #[serde(default)]
    extra: Vec<ItemInput>,
}

#[derive(Serialize, Deserialize)]
struct StartTaskResponse {
    task_id: String,
    workspace_id: String,
}

#[derive(Deserialize)]
struct WorkspaceFilter {
    #[serde(default)]
    workspace_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct TaskListResponse {
    tasks: Vec<TaskReport>,
    count: usize,
}

#[derive(Deserialize)]
struct ResolveApprovalRequest {
    approved: bool,
}

#[derive(Serialize, Deserialize)]
struct StatusResponse {
    version: String,
    uptime_secs: i64,
    workspaces: usize,
    model: String,
    executor: String,
    memory_backend: String,
    pending_approvals: usize,
}

// ── Workspaces ────────────────────────────────────────────────────────────

async fn list_workspaces_handler(State(state): State<SharedState>) -> Json<WorkspaceListResponse> {
    let mut workspaces = state.workspaces.list().await;
    workspaces.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    let count = workspaces.len();
    Json(WorkspaceListResponse { workspaces, count })
}

async fn create_workspace_handler(
    State(state): State<SharedState>,
    Json(req): Json<CreateWorkspaceRequest>,
) -> ApiResult<(StatusCode, Json<Workspace>)> {
    let mut config = state.config.workspace_defaults.config_for(req.name);
    config.id = req.id.as_deref().map(WorkspaceId::from);
    if let Some(level) = req.autonomy_level {
        config.autonomy_level = level;
    }
    if let Some(budget) = req.context_token_budget {
        config.context_token_budget = budget;
    }
    if let Some(timeout) = req.approval_timeout_secs {
        config.approval_timeout_secs = timeout;
    }
    let workspace = state.workspaces.create(config).await?;
    Ok((StatusCode::CREATED, Json(workspace)))
}

async fn get_workspace_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Workspace>> {
    Ok(Json(state.workspaces.get(&WorkspaceId::from(&id)).await?))
}

async fn update_workspace_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(patch): Json<WorkspacePatch>,
) -> ApiResult<Json<Workspace>> {
    Ok(Json(
        state
            .workspaces
            .update(&WorkspaceId::from(&id), patch)
            .await?,
    ))
}

async fn delete_workspace_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .orchestrator
        .delete_workspace(&WorkspaceId::from(&id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Context ───────────────────────────────────────────────────────────────

async fn assemble_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<AssembleRequest>,
) -> ApiResult<Json<ContextPack>> {
    let ws = WorkspaceId::from(&id);
    let extra = req.extra.into_iter().map(|i| i.into_item(&ws)).collect();
    Ok(Json(state.assembler.assemble(&ws, &req.goal, extra).await?))
}

async fn list_pins_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PinListResponse>> {
    let ws = WorkspaceId::from(&id);
    state.workspaces.get(&ws).await?;
    let items = state.assembler.pins().pinned(&ws).await;
    let total_tokens = items.iter().map(|i| i.token_count).sum();
    Ok(Json(PinListResponse {
        items,
        total_tokens,
    }))
}

async fn pin_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<PinRequest>,
) -> ApiResult<Json<ContextItem>> {
    Ok(Json(
        state
            .assembler
            .pin(&WorkspaceId::from(&id), &req.item_id)
            .await?,
    ))
}

async fn pin_note_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ItemInput>,
) -> ApiResult<(StatusCode, Json<ContextItem>)> {
    let ws = WorkspaceId::from(&id);
    state.workspaces.get(&ws).await?;
    let item = req.into_item(&ws);
    let pinned = state.assembler.pins().pin_item(&ws, item).await?;
    Ok((StatusCode::CREATED, Json(pinned)))
}

async fn unpin_handler(
    State(state): State<SharedState>,
    Path((id, item_id)): Path<(String, String)>,
) -> ApiResult<Json<ContextItem>> {
    Ok(Json(
        state
            .assembler
            .unpin(&WorkspaceId::from(&id), &item_id)
            .await?,
    ))
}

async fn edit_item_handler(
    State(state): State<SharedState>,
    Path((id, item_id)): Path<(String, String)>,
    Json(req): Json<EditRequest>,
) -> ApiResult<Json<ContextItem>> {
    Ok(Json(
        state
            .assembler
            .edit(&WorkspaceId::from(&id), &item_id, &req.content)
            .await?,
    ))
}

// ── Memory ────────────────────────────────────────────────────────────────

/// Memory partitions are created lazily, so check the workspace first.
async fn existing(state: &SharedState, id: &str) -> ApiResult<WorkspaceId> {
    let ws = WorkspaceId::from(id);
    state.workspaces.get(&ws).await?;
    Ok(ws)
}

async fn episodic_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(window): Query<EpisodeWindow>,
) -> ApiResult<Json<Vec<EpisodicRecord>>> {
    let ws = existing(&state, &id).await?;
    Ok(Json(state.memory.query_episodic(&ws, &window).await?))
}

async fn semantic_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(q): Query<SemanticQuery>,
) -> ApiResult<Json<Vec<SemanticFact>>> {
    let ws = existing(&state, &id).await?;
    Ok(Json(state.memory.query_semantic(&ws, &q.query, q.limit).await?))
}

async fn feedback_handler(
    State(state): State<SharedState>,
    Path((id, fact_id)): Path<(String, String)>,
    Json(correction): Json<Correction>,
) -> ApiResult<Json<SemanticFact>> {
    let ws = existing(&state, &id).await?;
    let fact = state
        .memory
        .record_feedback(&ws, &fact_id, correction)
        .await?;
    info!(workspace_id = %ws, fact_id = %fact_id, "Fact corrected via API");
    Ok(Json(fact))
}

async fn procedural_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(q): Query<ProceduralQuery>,
) -> ApiResult<Json<Vec<ProceduralWorkflow>>> {
    let ws = existing(&state, &id).await?;
    let signature = goal_signature(&q.goal);
    Ok(Json(
        state
            .memory
            .query_procedural(&ws, &signature, q.limit)
            .await?,
    ))
}

async fn stats_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MemoryStats>> {
    let ws = existing(&state, &id).await?;
    Ok(Json(state.memory.stats(&ws).await?))
}

async fn promote_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PromotionReport>> {
    let ws = existing(&state, &id).await?;
    Ok(Json(state.memory.promote(&ws).await?))
}

// ── Tasks ─────────────────────────────────────────────────────────────────

async fn start_task_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<StartTaskRequest>,
) -> ApiResult<(StatusCode, Json<StartTaskResponse>)> {
    let ws = WorkspaceId::from(&id);
    if req.goal.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "goal must not be empty",
        ));
    }
    let extra = req.extra.into_iter().map(|i| i.into_item(&ws)).collect();
    let handle = state
        .orchestrator
        .spawn_task(TaskRequest::new(ws, req.goal).with_extra(extra))
        .await?;
    // The task keeps running detached; its report stays queryable.
    Ok((
        StatusCode::ACCEPTED,
        Json(StartTaskResponse {
            task_id: handle.task_id().to_string(),
            workspace_id: id,
        }),
    ))
}

async fn list_tasks_handler(
    State(state): State<SharedState>,
    Query(filter): Query<WorkspaceFilter>,
) -> Json<TaskListResponse> {
    let ws = filter.workspace_id.as_deref().map(WorkspaceId::from);
    let tasks = state.orchestrator.tasks(ws.as_ref()).await;
    let count = tasks.len();
    Json(TaskListResponse { tasks, count })
}

async fn get_task_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskReport>> {
    Ok(Json(state.orchestrator.task_status(&id).await?))
}

async fn cancel_task_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.cancel(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

// ── Approvals ─────────────────────────────────────────────────────────────

async fn list_approvals_handler(
    State(state): State<SharedState>,
    Query(filter): Query<WorkspaceFilter>,
) -> Json<Vec<ApprovalRequest>> {
    let ws = filter.workspace_id.as_deref().map(WorkspaceId::from);
    Json(state.orchestrator.pending_approvals(ws.as_ref()).await)
}

async fn resolve_approval_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ResolveApprovalRequest>,
) -> ApiResult<Json<ApprovalRequest>> {
    Ok(Json(
        state
            .orchestrator
            .resolve_approval(&id, req.approved)
            .await?,
    ))
}

// ── Events & status ───────────────────────────────────────────────────────

/// `GET /v1/events` - SSE stream of domain events, optionally for one
/// workspace. Events without a workspace are always sent.
async fn event_stream_handler(
    State(state): State<SharedState>,
    Query(filter): Query<WorkspaceFilter>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
        .filter_map(|result| result.ok())
        .filter(move |event| match (&filter.workspace_id, event.workspace_id()) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        })
        .map(|event| {
            let value = serde_json::to_value(event.as_ref()).unwrap_or_default();
            let name = value
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("event")
                .to_string();
            Ok(SseEvent::default().event(name).data(value.to_string()))
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn status_handler(State(state): State<SharedState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: (Utc::now() - state.start_time).num_seconds(),
        workspaces: state.workspaces.list().await.len(),
        model: state.model_name.clone(),
        executor: state.executor_name.clone(),
        memory_backend: state.memory.persistence_name().to_string(),
        pending_approvals: state.orchestrator.pending_approvals(None).await.len(),
    })
}
