//! Language model capability - the abstraction over on-device and cloud LLMs.
//!
//! The orchestrator and the promotion pipeline only need plain generation,
//! optionally constrained by a JSON schema. Implementations: an
//! OpenAI-compatible chat-completions client (used for both roles), and
//! scripted fakes in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CapabilityError;

/// Where a model runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    OnDevice,
    Cloud,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OnDevice => write!(f, "on-device"),
            Self::Cloud => write!(f, "cloud"),
        }
    }
}

/// Sampling options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.2
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

/// A single generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// JSON schema the output must satisfy. When set, the response text is
    /// expected to be a JSON document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,

    #[serde(default)]
    pub options: GenerateOptions,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            response_schema: None,
            options: GenerateOptions::default(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A complete response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    /// Which model actually responded.
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// The core language model trait.
///
/// Callers never know whether they talk to a local or a hosted model.
/// `generate` returns [`CapabilityError::Unavailable`] when the model
/// cannot serve right now, which lets selectors fall back.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Name used in logs (e.g., "ollama/llama3.2", "openai/gpt-4o-mini").
    fn name(&self) -> &str;

    fn kind(&self) -> ModelKind;

    /// Can the model serve requests right now?
    async fn probe(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> std::result::Result<GenerateResponse, CapabilityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder() {
        let req = GenerateRequest::new("plan this")
            .with_system("you are a planner")
            .with_schema(serde_json::json!({"type": "object"}));
        assert_eq!(req.system.as_deref(), Some("you are a planner"));
        assert!(req.response_schema.is_some());
        assert!((req.options.temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let req: GenerateRequest = serde_json::from_str(r#"{"prompt":"hi"}"#).unwrap();
        assert!(req.system.is_none());
        assert!(req.options.max_tokens.is_none());
    }

    #[test]
    fn model_kind_display() {
        assert_eq!(ModelKind::OnDevice.to_string(), "on-device");
        assert_eq!(ModelKind::Cloud.to_string(), "cloud");
    }
}
