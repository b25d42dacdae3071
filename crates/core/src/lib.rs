//! # Waymark Core
//!
//! Domain types, traits, and error definitions for Waymark, the memory and
//! orchestration layer of an LLM-driven web-automation agent.
//! This crate has **zero framework dependencies** - it defines the domain model
//! that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external seam is defined as a trait here. Implementations live in
//! their respective crates:
//! - [`LanguageModel`] in `waymark-providers` (on-device and cloud)
//! - [`ActionExecutor`] in `waymark-providers` (HTTP browser bridge)
//! - [`MemoryPersistence`] in `waymark-memory` (none, JSONL, SQLite)
//! - [`WorkspaceCascade`] by every component holding per-workspace state

pub mod context;
pub mod error;
pub mod event;
pub mod executor;
pub mod memory;
pub mod plan;
pub mod provider;
pub mod signature;
pub mod task;
pub mod workspace;

// Re-export key types at crate root for ergonomics
pub use context::{AssemblyMetadata, ContextItem, ContextPack, DropInfo, Tier};
pub use error::{Error, Result};
pub use event::{DomainEvent, EventBus};
pub use executor::{ActionExecutor, Observation, PageState};
pub use memory::{
    Correction, CorrectionSource, EpisodeWindow, EpisodicRecord, MemoryPersistence, NewEpisode,
    Outcome, PersistedPartition, ProceduralWorkflow, PromotionState, SemanticFact, StepTemplate,
};
pub use plan::{
    ActionKind, ApprovalRequest, BrowserAction, Plan, Resolution, RiskLevel, Step, StepStatus,
};
pub use provider::{GenerateOptions, GenerateRequest, GenerateResponse, LanguageModel, ModelKind};
pub use signature::goal_signature;
pub use task::{TaskState, Termination};
pub use workspace::{
    AutonomyLevel, Workspace, WorkspaceCascade, WorkspaceConfig, WorkspaceId, WorkspacePatch,
};
