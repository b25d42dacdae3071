//! Budgeted context assembly.
//!
//! Turns a workspace's memory into a bounded prompt context.
//!
//! # Candidate sources (forced first, then by score)
//!
//! | Source | Tier | Selection |
//! |--------|------|-----------|
//! | Pin board + pinned extras | any | Always included, never truncated |
//! | Semantic facts | semantic | Top `semantic_limit` by relevance and recency |
//! | Procedural workflows | procedural | Top `procedural_limit` matching the goal signature |
//! | Episodic log | episodic | Newest `episodic_window` records |
//! | Caller-supplied items | external | All |

pub mod assembler;
pub mod pins;
pub mod token;
pub mod working_memory;

pub use assembler::ContextAssembler;
pub use pins::PinBoard;
pub use working_memory::WorkingMemory;
