//! Workspace-partitioned memory for Waymark.
//!
//! Three tiers per workspace: an append-only episodic log, semantic facts
//! condensed from it, and procedural workflows induced from repeated runs.

pub mod jsonl;
pub mod persistence;
pub mod promotion;
pub mod ranking;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use jsonl::JsonlPersistence;
pub use persistence::{NoopPersistence, build_from_config};
pub use promotion::{PromotionReport, PromotionSettings};
pub use ranking::{blended_score, cosine_similarity, recency, text_similarity};
pub use store::{MemorySettings, MemorySnapshot, MemoryStats, MemoryStore};

#[cfg(feature = "sqlite")]
pub use sqlite::SqlitePersistence;
