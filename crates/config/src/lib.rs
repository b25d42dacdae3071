//! Configuration loading, validation, and management for Waymark.
//!
//! Loads configuration from `~/.waymark/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use waymark_core::workspace::{AutonomyLevel, WorkspaceConfig, WorkspaceId};

/// The root configuration structure.
///
/// Maps directly to `~/.waymark/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// LLM capabilities (on-device and cloud)
    #[serde(default)]
    pub llm: LlmConfig,

    /// Memory tiers, promotion and persistence
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Context assembly weights and limits
    #[serde(default)]
    pub context: ContextConfig,

    /// Planner/Navigator loop bounds
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Policy applied to workspaces created without explicit values
    #[serde(default)]
    pub workspace_defaults: WorkspaceDefaults,

    /// Browser action executor endpoint
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// HTTP gateway
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Workspaces created at startup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<WorkspaceSeed>,
}

fn default_true() -> bool {
    true
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

// ── LLM ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Local model, tried first.
    #[serde(default = "default_on_device", skip_serializing_if = "Option::is_none")]
    pub on_device: Option<ModelEndpointConfig>,

    /// Hosted model, used when the local one is unavailable.
    #[serde(default = "default_cloud", skip_serializing_if = "Option::is_none")]
    pub cloud: Option<ModelEndpointConfig>,

    #[serde(default = "default_llm_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_on_device() -> Option<ModelEndpointConfig> {
    Some(ModelEndpointConfig {
        api_url: "http://localhost:11434/v1".into(),
        model: "llama3.2".into(),
        api_key: None,
    })
}
fn default_cloud() -> Option<ModelEndpointConfig> {
    Some(ModelEndpointConfig {
        api_url: "https://api.openai.com/v1".into(),
        model: "gpt-4o-mini".into(),
        api_key: None,
    })
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.2
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            on_device: default_on_device(),
            cloud: default_cloud(),
            request_timeout_secs: default_llm_timeout(),
            temperature: default_temperature(),
        }
    }
}

/// An OpenAI-compatible chat-completions endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct ModelEndpointConfig {
    pub api_url: String,

    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl std::fmt::Debug for ModelEndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEndpointConfig")
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

// ── Memory ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// "none", "jsonl" or "sqlite".
    #[serde(default = "default_memory_backend")]
    pub backend: String,

    /// Defaults to `~/.waymark/memory`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Maximum episodic records kept per workspace.
    #[serde(default = "default_episodic_cap")]
    pub episodic_cap: usize,

    /// Promote after this many new episodic records.
    #[serde(default = "default_promote_every")]
    pub promote_every: usize,

    /// Promote when this much time has passed since the last promotion.
    #[serde(default = "default_promote_interval")]
    pub promote_interval_secs: u64,

    /// Successful runs needed before a workflow is induced.
    #[serde(default = "default_workflow_min_runs")]
    pub workflow_min_runs: usize,

    /// Similarity at or above which two facts are the same fact.
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f32,

    #[serde(default = "default_retire_min_samples")]
    pub retire_min_samples: u32,

    #[serde(default = "default_retire_floor")]
    pub retire_success_floor: f32,

    #[serde(default = "default_half_life")]
    pub recency_half_life_secs: u64,

    /// Share of recency in query ranking, `[0, 1]`.
    #[serde(default = "default_recency_mix")]
    pub recency_mix: f32,

    /// Summarize episodic history into semantic facts with the LLM.
    #[serde(default = "default_true")]
    pub summarize: bool,
}

fn default_memory_backend() -> String {
    "jsonl".into()
}
fn default_episodic_cap() -> usize {
    200
}
fn default_promote_every() -> usize {
    20
}
fn default_promote_interval() -> u64 {
    300
}
fn default_workflow_min_runs() -> usize {
    3
}
fn default_dedup_threshold() -> f32 {
    0.85
}
fn default_retire_min_samples() -> u32 {
    5
}
fn default_retire_floor() -> f32 {
    0.4
}
fn default_half_life() -> u64 {
    86_400
}
fn default_recency_mix() -> f32 {
    0.3
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            data_dir: None,
            episodic_cap: default_episodic_cap(),
            promote_every: default_promote_every(),
            promote_interval_secs: default_promote_interval(),
            workflow_min_runs: default_workflow_min_runs(),
            dedup_threshold: default_dedup_threshold(),
            retire_min_samples: default_retire_min_samples(),
            retire_success_floor: default_retire_floor(),
            recency_half_life_secs: default_half_life(),
            recency_mix: default_recency_mix(),
            summarize: true,
        }
    }
}

impl MemoryConfig {
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("memory"))
    }
}

// ── Context ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Tokens held back from the workspace budget for the prompt scaffold.
    #[serde(default = "default_reserved_overhead")]
    pub reserved_overhead: usize,

    /// Compressed items smaller than this are dropped.
    #[serde(default = "default_min_useful_tokens")]
    pub min_useful_tokens: usize,

    #[serde(default = "default_weight_recency")]
    pub weight_recency: f32,

    #[serde(default = "default_weight_relevance")]
    pub weight_relevance: f32,

    #[serde(default = "default_weight_priority")]
    pub weight_priority: f32,

    #[serde(default = "default_semantic_limit")]
    pub semantic_limit: usize,

    #[serde(default = "default_procedural_limit")]
    pub procedural_limit: usize,

    /// Most recent episodic records offered as candidates.
    #[serde(default = "default_episodic_window")]
    pub episodic_window: usize,
}

fn default_reserved_overhead() -> usize {
    256
}
fn default_min_useful_tokens() -> usize {
    16
}
fn default_weight_recency() -> f32 {
    0.3
}
fn default_weight_relevance() -> f32 {
    0.5
}
fn default_weight_priority() -> f32 {
    0.2
}
fn default_semantic_limit() -> usize {
    8
}
fn default_procedural_limit() -> usize {
    3
}
fn default_episodic_window() -> usize {
    10
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            reserved_overhead: default_reserved_overhead(),
            min_useful_tokens: default_min_useful_tokens(),
            weight_recency: default_weight_recency(),
            weight_relevance: default_weight_relevance(),
            weight_priority: default_weight_priority(),
            semantic_limit: default_semantic_limit(),
            procedural_limit: default_procedural_limit(),
            episodic_window: default_episodic_window(),
        }
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_step_attempts")]
    pub max_step_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_max_replans")]
    pub max_replans: u32,

    #[serde(default = "default_max_planning_attempts")]
    pub max_planning_attempts: u32,

    /// Per-call bound on a single browser action.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    /// Per-call bound on a single planning request.
    #[serde(default = "default_planning_timeout")]
    pub planning_timeout_secs: u64,
}

fn default_max_step_attempts() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    500
}
fn default_backoff_max() -> u64 {
    8_000
}
fn default_max_replans() -> u32 {
    3
}
fn default_max_planning_attempts() -> u32 {
    2
}
fn default_step_timeout() -> u64 {
    30
}
fn default_planning_timeout() -> u64 {
    90
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: default_max_step_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            max_replans: default_max_replans(),
            max_planning_attempts: default_max_planning_attempts(),
            step_timeout_secs: default_step_timeout(),
            planning_timeout_secs: default_planning_timeout(),
        }
    }
}

// ── Workspaces ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceDefaults {
    #[serde(default = "default_autonomy_level")]
    pub autonomy_level: u8,

    #[serde(default = "default_context_budget")]
    pub context_token_budget: usize,

    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,
}

fn default_autonomy_level() -> u8 {
    2
}
fn default_context_budget() -> usize {
    4096
}
fn default_approval_timeout() -> u64 {
    30
}

impl Default for WorkspaceDefaults {
    fn default() -> Self {
        Self {
            autonomy_level: default_autonomy_level(),
            context_token_budget: default_context_budget(),
            approval_timeout_secs: default_approval_timeout(),
        }
    }
}

impl WorkspaceDefaults {
    /// A creation request for `name` using these defaults.
    pub fn config_for(&self, name: impl Into<String>) -> WorkspaceConfig {
        WorkspaceConfig {
            id: None,
            name: name.into(),
            autonomy_level: self.autonomy_level,
            context_token_budget: self.context_token_budget,
            approval_timeout_secs: self.approval_timeout_secs,
        }
    }
}

/// A workspace declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSeed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomy_level: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_token_budget: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout_secs: Option<u64>,
}

// ── Executor / Gateway ────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Base URL of the browser bridge. No executor when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_executor_timeout")]
    pub timeout_secs: u64,
}

fn default_executor_timeout() -> u64 {
    30
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_secs: default_executor_timeout(),
        }
    }
}

impl std::fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("url", &self.url)
            .field("api_key", &redact(&self.api_key))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default)]
    pub allow_public_bind: bool,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            allow_public_bind: false,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from the default path (~/.waymark/config.toml).
    ///
    /// Environment variables override the file:
    /// - `WAYMARK_CLOUD_API_KEY`
    /// - `WAYMARK_CLOUD_MODEL`
    /// - `WAYMARK_ON_DEVICE_URL`
    /// - `WAYMARK_EXECUTOR_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("WAYMARK_CLOUD_API_KEY") {
            self.llm
                .cloud
                .get_or_insert_with(|| default_cloud().unwrap_or_else(empty_endpoint))
                .api_key = Some(key);
        }
        if let Some(model) = lookup("WAYMARK_CLOUD_MODEL") {
            self.llm
                .cloud
                .get_or_insert_with(|| default_cloud().unwrap_or_else(empty_endpoint))
                .model = model;
        }
        if let Some(url) = lookup("WAYMARK_ON_DEVICE_URL") {
            self.llm
                .on_device
                .get_or_insert_with(|| default_on_device().unwrap_or_else(empty_endpoint))
                .api_url = url;
        }
        if let Some(url) = lookup("WAYMARK_EXECUTOR_URL") {
            self.executor.url = Some(url);
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".waymark")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::ValidationError(
                "llm.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if !matches!(self.memory.backend.as_str(), "none" | "jsonl" | "sqlite") {
            return Err(ConfigError::ValidationError(format!(
                "memory.backend must be one of none, jsonl, sqlite (got {})",
                self.memory.backend
            )));
        }
        if self.memory.episodic_cap == 0 {
            return Err(ConfigError::ValidationError(
                "memory.episodic_cap must be > 0".into(),
            ));
        }
        if self.memory.workflow_min_runs == 0 {
            return Err(ConfigError::ValidationError(
                "memory.workflow_min_runs must be > 0".into(),
            ));
        }
        for (name, value) in [
            ("memory.dedup_threshold", self.memory.dedup_threshold),
            ("memory.retire_success_floor", self.memory.retire_success_floor),
            ("memory.recency_mix", self.memory.recency_mix),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be between 0.0 and 1.0"
                )));
            }
        }
        if self.memory.recency_half_life_secs == 0 {
            return Err(ConfigError::ValidationError(
                "memory.recency_half_life_secs must be > 0".into(),
            ));
        }

        let c = &self.context;
        if c.weight_recency < 0.0 || c.weight_relevance < 0.0 || c.weight_priority < 0.0 {
            return Err(ConfigError::ValidationError(
                "context weights must be non-negative".into(),
            ));
        }
        if c.weight_recency + c.weight_relevance + c.weight_priority <= 0.0 {
            return Err(ConfigError::ValidationError(
                "context weights must not all be zero".into(),
            ));
        }

        if self.orchestrator.max_step_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.max_step_attempts must be > 0".into(),
            ));
        }
        if self.orchestrator.max_planning_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.max_planning_attempts must be > 0".into(),
            ));
        }

        AutonomyLevel::new(self.workspace_defaults.autonomy_level)
            .map_err(|e| ConfigError::ValidationError(format!("workspace_defaults: {e}")))?;
        if self.workspace_defaults.context_token_budget <= c.reserved_overhead {
            return Err(ConfigError::ValidationError(
                "workspace_defaults.context_token_budget must exceed context.reserved_overhead"
                    .into(),
            ));
        }

        for seed in &self.workspaces {
            self.seed_config(seed)
                .into_workspace()
                .map_err(|e| ConfigError::ValidationError(format!("workspace {}: {e}", seed.name)))?;
        }

        Ok(())
    }

    /// Resolve a seed against the workspace defaults.
    pub fn seed_config(&self, seed: &WorkspaceSeed) -> WorkspaceConfig {
        let d = &self.workspace_defaults;
        WorkspaceConfig {
            id: seed.id.as_deref().map(WorkspaceId::from),
            name: seed.name.clone(),
            autonomy_level: seed.autonomy_level.unwrap_or(d.autonomy_level),
            context_token_budget: seed.context_token_budget.unwrap_or(d.context_token_budget),
            approval_timeout_secs: seed.approval_timeout_secs.unwrap_or(d.approval_timeout_secs),
        }
    }

    /// Creation requests for every `[[workspaces]]` entry.
    pub fn seed_configs(&self) -> Vec<WorkspaceConfig> {
        self.workspaces.iter().map(|s| self.seed_config(s)).collect()
    }

    /// Whether a cloud model with credentials is configured.
    pub fn has_cloud_key(&self) -> bool {
        self.llm.cloud.as_ref().is_some_and(|c| c.api_key.is_some())
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn empty_endpoint() -> ModelEndpointConfig {
    ModelEndpointConfig {
        api_url: String::new(),
        model: String::new(),
        api_key: None,
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
