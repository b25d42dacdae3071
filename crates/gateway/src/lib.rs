//! HTTP gateway for Waymark.
//!
//! Exposes the UI contracts over JSON: workspace CRUD, context read and
//! pin/unpin/edit, memory queries and feedback, task start/cancel/status,
//! approval resolution, and an SSE stream of domain events.
//!
//! Built on Axum.

pub mod api_v1;

use async_trait::async_trait;
use axum::extract::DefaultBodyLimit;
use axum::{Router, response::Json, routing::get};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use waymark_agent::{ContextAssembler, Orchestrator, PinBoard};
use waymark_config::AppConfig;
use waymark_core::error::{AutomationError, Error};
use waymark_core::event::EventBus;
use waymark_core::executor::{ActionExecutor, Observation, PageState};
use waymark_core::memory::MemoryPersistence;
use waymark_core::plan::Step;
use waymark_core::provider::LanguageModel;
use waymark_memory::{MemorySettings, MemoryStore};
use waymark_workspace::WorkspaceManager;

/// Everything the handlers need, wired once at startup.
pub struct AppState {
    pub config: AppConfig,
    pub workspaces: Arc<WorkspaceManager>,
    pub memory: MemoryStore,
    pub assembler: Arc<ContextAssembler>,
    pub orchestrator: Arc<Orchestrator>,
    pub events: Arc<EventBus>,
    /// Name of the model behind planning and summarization.
    pub model_name: String,
    pub executor_name: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the runtime from explicit collaborators.
    pub async fn build(
        config: AppConfig,
        persistence: Arc<dyn MemoryPersistence>,
        model: Arc<dyn LanguageModel>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Result<Self, Error> {
        let events = Arc::new(EventBus::default());

        let memory = MemoryStore::new(persistence, MemorySettings::from_config(&config.memory))
            .with_summarizer(model.clone())
            .with_events(events.clone());
        let restored = memory.hydrate().await?;

        let workspaces = Arc::new(WorkspaceManager::new().with_events(events.clone()));
        let pins = Arc::new(PinBoard::new());
        workspaces.register_cascade(Arc::new(memory.clone())).await;
        workspaces.register_cascade(pins.clone()).await;
        let seeded = workspaces.seed(config.seed_configs()).await?;

        let assembler = Arc::new(ContextAssembler::new(
            memory.clone(),
            workspaces.clone(),
            pins,
            config.context.clone(),
        ));
        let model_name = model.name().to_string();
        let executor_name = executor.name().to_string();
        let orchestrator = Arc::new(Orchestrator::new(
            workspaces.clone(),
            memory.clone(),
            assembler.clone(),
            model,
            executor,
            events.clone(),
            config.orchestrator.clone(),
        ));

        info!(
            seeded,
            restored_partitions = restored,
            model = %model_name,
            executor = %executor_name,
            "Runtime ready"
        );

        Ok(Self {
            config,
            workspaces,
            memory,
            assembler,
            orchestrator,
            events,
            model_name,
            executor_name,
            start_time: chrono::Utc::now(),
        })
    }

    /// Wire the runtime from configuration: persistence backend, model
    /// selector and browser bridge.
    pub async fn from_config(config: AppConfig) -> Result<Self, Error> {
        let persistence = waymark_memory::build_from_config(&config.memory).await?;
        let model: Arc<dyn LanguageModel> =
            Arc::new(waymark_providers::build_from_config(&config));
        let executor: Arc<dyn ActionExecutor> = match waymark_providers::build_executor(&config) {
            Some(executor) => Arc::new(executor),
            None => {
                warn!("No executor.url configured; browser steps will fail as unavailable");
                Arc::new(DetachedExecutor)
            }
        };
        Self::build(config, persistence, model, executor).await
    }
}

/// Stands in when no browser bridge is configured.
pub struct DetachedExecutor;

#[async_trait]
impl ActionExecutor for DetachedExecutor {
    fn name(&self) -> &str {
        "detached"
    }

    async fn execute(&self, _step: &Step) -> Result<Observation, AutomationError> {
        Err(AutomationError::Unavailable("no browser bridge configured".into()))
    }

    async fn observe(&self) -> Result<PageState, AutomationError> {
        Err(AutomationError::Unavailable("no browser bridge configured".into()))
    }
}

/// Build the full router: `/health` plus the v1 API.
///
/// Layers applied:
/// - CORS limited to the local UI origin
/// - Request body size limit (1 MB)
/// - HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    let origin = format!("http://localhost:{}", state.config.gateway.port);
    let cors = match origin.parse::<axum::http::HeaderValue>() {
        Ok(origin) => CorsLayer::new().allow_origin(origin),
        Err(_) => CorsLayer::new(),
    }
    .allow_methods([
        axum::http::Method::GET,
        axum::http::Method::POST,
        axum::http::Method::PATCH,
        axum::http::Method::DELETE,
    ])
    .allow_headers([axum::http::header::CONTENT_TYPE])
    .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(state))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
///
/// Refuses non-loopback hosts unless `gateway.allow_public_bind` is set.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    if !is_loopback(&config.gateway.host) && !config.gateway.allow_public_bind {
        return Err(format!(
            "refusing to bind {} without gateway.allow_public_bind = true",
            config.gateway.host
        )
        .into());
    }
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let state = Arc::new(AppState::from_config(config).await?);
    let app = build_router(state);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn is_loopback(host: &str) -> bool {
    host == "localhost"
        || host
            .parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use waymark_memory::NoopPersistence;
    use waymark_providers::CapabilitySelector;

    async fn state() -> SharedState {
        Arc::new(
            AppState::build(
                AppConfig::default(),
                Arc::new(NoopPersistence),
                Arc::new(CapabilitySelector::new()),
                Arc::new(DetachedExecutor),
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = build_router(state().await);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn seeds_configured_workspaces() {
        let mut config = AppConfig::default();
        config.workspaces.push(waymark_config::WorkspaceSeed {
            id: Some("shopping".into()),
            name: "Shopping".into(),
            autonomy_level: Some(2),
            context_token_budget: None,
            approval_timeout_secs: None,
        });
        let state = AppState::build(
            config,
            Arc::new(NoopPersistence),
            Arc::new(CapabilitySelector::new()),
            Arc::new(DetachedExecutor),
        )
        .await
        .unwrap();
        let ws = state
            .workspaces
            .get(&waymark_core::workspace::WorkspaceId::from("shopping"))
            .await
            .unwrap();
        assert_eq!(ws.autonomy_level.value(), 2);
        assert_eq!(state.executor_name, "detached");
    }

    #[test]
    fn only_loopback_hosts_are_private() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("localhost"));
        assert!(is_loopback("::1"));
        assert!(!is_loopback("0.0.0.0"));
        assert!(!is_loopback("192.168.1.10"));
    }

    #[tokio::test]
    async fn public_bind_requires_opt_in() {
        let mut config = AppConfig::default();
        config.gateway.host = "0.0.0.0".into();
        let err = start(config).await.unwrap_err();
        assert!(err.to_string().contains("allow_public_bind"));
    }

    #[tokio::test]
    async fn detached_executor_is_unavailable() {
        let err = DetachedExecutor.observe().await.unwrap_err();
        assert!(matches!(err, AutomationError::Unavailable(_)));
    }
}
