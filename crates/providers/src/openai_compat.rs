//! OpenAI-compatible chat-completions model.
//!
//! Serves both capability roles: point it at a local Ollama / llama.cpp /
//! vLLM server for the on-device role, or at OpenAI, OpenRouter or any other
//! hosted endpoint for the cloud role.
//!
//! Only non-streaming completions are used. When a request carries a
//! response schema, the schema is appended to the system text and JSON
//! output is requested through `response_format`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use waymark_core::error::CapabilityError;
use waymark_core::provider::*;

/// A language model behind an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionsModel {
    name: String,
    kind: ModelKind,
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ChatCompletionsModel {
    /// Create a new model client.
    pub fn new(
        kind: ModelKind,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });

        let model = model.into();
        let name = match kind {
            ModelKind::OnDevice => format!("on-device/{model}"),
            ModelKind::Cloud => format!("cloud/{model}"),
        };

        Self {
            name,
            kind,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model,
            api_key,
            client,
        }
    }

    /// A local Ollama server (convenience constructor).
    pub fn ollama(model: impl Into<String>) -> Self {
        Self::new(
            ModelKind::OnDevice,
            "http://localhost:11434/v1",
            model,
            None,
            Duration::from_secs(120),
        )
    }

    /// Build the request body.
    fn to_body(&self, request: &GenerateRequest) -> serde_json::Value {
        let mut system = request.system.clone().unwrap_or_default();
        if let Some(schema) = &request.response_schema {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str("Respond with a single JSON document matching this JSON schema:\n");
            system.push_str(&schema.to_string());
        }

        let mut messages = Vec::with_capacity(2);
        if !system.is_empty() {
            messages.push(ApiMessage {
                role: "system".into(),
                content: Some(system),
            });
        }
        messages.push(ApiMessage {
            role: "user".into(),
            content: Some(request.prompt.clone()),
        });

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.options.temperature,
            "stream": false,
        });
        if let Some(max_tokens) = request.options.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if request.response_schema.is_some() {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }

    /// Map a transport failure. A local server that is not running is
    /// unavailable; a hosted one is a network problem.
    fn transport_error(&self, e: reqwest::Error) -> CapabilityError {
        if e.is_timeout() {
            return CapabilityError::Timeout(format!("{}: {e}", self.name));
        }
        match self.kind {
            ModelKind::OnDevice => CapabilityError::Unavailable(format!("{}: {e}", self.name)),
            ModelKind::Cloud if e.is_connect() => {
                CapabilityError::Unavailable(format!("{}: {e}", self.name))
            }
            ModelKind::Cloud => CapabilityError::Network(e.to_string()),
        }
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ModelKind {
        self.kind
    }

    async fn probe(&self) -> bool {
        if self.kind == ModelKind::Cloud && self.api_key.is_none() {
            return false;
        }
        let url = format!("{}/models", self.base_url);
        match self.with_auth(self.client.get(&url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(model = %self.name, error = %e, "Probe failed");
                false
            }
        }
    }

    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> std::result::Result<GenerateResponse, CapabilityError> {
        if self.kind == ModelKind::Cloud && self.api_key.is_none() {
            return Err(CapabilityError::NotConfigured(format!(
                "{} has no API key",
                self.name
            )));
        }

        let url = format!("{}/chat/completions", self.base_url);
        let body = self.to_body(&request);

        debug!(model = %self.name, "Sending completion request");

        let response = self
            .with_auth(self.client.post(&url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status().as_u16();

        if status == 503 || status == 429 || (self.kind == ModelKind::OnDevice && status == 404) {
            let error_body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Unavailable(format!(
                "{} returned {status}: {error_body}",
                self.name
            )));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, model = %self.name, body = %error_body, "Model returned error");
            return Err(CapabilityError::Api {
                status_code: status,
                message: error_body,
            });
        }

        let api_response: ApiResponse =
            response.json().await.map_err(|e| CapabilityError::Api {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        parse_response(api_response)
    }
}

fn parse_response(api_response: ApiResponse) -> Result<GenerateResponse, CapabilityError> {
    let choice = api_response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| CapabilityError::Api {
            status_code: 200,
            message: "No choices in response".into(),
        })?;

    Ok(GenerateResponse {
        text: choice.message.content.unwrap_or_default(),
        model: api_response.model,
        usage: api_response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }),
    })
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud(key: Option<&str>) -> ChatCompletionsModel {
        ChatCompletionsModel::new(
            ModelKind::Cloud,
            "https://api.openai.com/v1/",
            "gpt-4o-mini",
            key.map(String::from),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn ollama_constructor() {
        let model = ChatCompletionsModel::ollama("llama3.2");
        assert_eq!(model.name(), "on-device/llama3.2");
        assert_eq!(model.kind(), ModelKind::OnDevice);
        assert!(model.base_url.contains("localhost:11434"));
    }

    #[test]
    fn trailing_slash_trimmed() {
        assert_eq!(cloud(None).base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn body_includes_system_and_schema() {
        let request = GenerateRequest::new("Plan: buy milk")
            .with_system("You plan browser steps.")
            .with_schema(serde_json::json!({"type": "object"}));
        let body = cloud(Some("sk")).to_body(&request);

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        let system = messages[0]["content"].as_str().unwrap();
        assert!(system.starts_with("You plan browser steps."));
        assert!(system.contains("{\"type\":\"object\"}"));
        assert_eq!(messages[1]["content"], "Plan: buy milk");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["model"], "gpt-4o-mini");
    }

    #[test]
    fn body_without_system_has_only_user_message() {
        let body = cloud(Some("sk")).to_body(&GenerateRequest::new("hi"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert!(body.get("response_format").is_none());
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn parse_completion_response() {
        let data = r#"{
            "model": "gpt-4o-mini",
            "choices": [{"message": {"role": "assistant", "content": "{\"steps\":[]}"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
        }"#;
        let parsed: ApiResponse = serde_json::from_str(data).unwrap();
        let response = parse_response(parsed).unwrap();
        assert_eq!(response.text, "{\"steps\":[]}");
        assert_eq!(response.usage.unwrap().completion_tokens, 4);
    }

    #[test]
    fn empty_choices_is_api_error() {
        let parsed: ApiResponse =
            serde_json::from_str(r#"{"model":"m","choices":[],"usage":null}"#).unwrap();
        assert!(matches!(
            parse_response(parsed),
            Err(CapabilityError::Api { .. })
        ));
    }

    #[tokio::test]
    async fn cloud_without_key_is_not_configured() {
        let model = cloud(None);
        assert!(!model.probe().await);
        let err = model.generate(GenerateRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, CapabilityError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn unreachable_on_device_model_is_unavailable() {
        let model = ChatCompletionsModel::new(
            ModelKind::OnDevice,
            "http://127.0.0.1:1/v1",
            "llama3.2",
            None,
            Duration::from_secs(2),
        );
        let err = model.generate(GenerateRequest::new("hi")).await.unwrap_err();
        assert!(
            matches!(err, CapabilityError::Unavailable(_) | CapabilityError::Timeout(_)),
            "got {err:?}"
        );
    }
}
