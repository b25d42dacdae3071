//! LLM capability and action executor implementations for Waymark.
//!
//! Models implement `waymark_core::LanguageModel`; the selector picks the
//! on-device model first and falls back to the cloud. The HTTP executor
//! implements `waymark_core::ActionExecutor` against a browser bridge.

pub mod executor_http;
pub mod openai_compat;
pub mod router;
pub mod selector;
pub mod structured;

pub use executor_http::HttpActionExecutor;
pub use openai_compat::ChatCompletionsModel;
pub use router::{build_executor, build_from_config};
pub use selector::{CapabilitySelector, SelectedModel};
pub use structured::StructuredGenerator;
