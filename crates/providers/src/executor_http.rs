//! HTTP client for an external browser bridge.
//!
//! The bridge owns the browser. This client forwards one step at a time as
//! JSON and maps the bridge's status codes onto [`AutomationError`]:
//!
//! | Status | Error |
//! |--------|-------|
//! | 2xx | observation |
//! | 409, 412 | `PreconditionFailed` (page drifted) |
//! | 408, 504 | `Timeout` |
//! | 503 | `Unavailable` |
//! | other | `ActionFailed` |

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use waymark_core::error::AutomationError;
use waymark_core::executor::{ActionExecutor, Observation, PageState};
use waymark_core::plan::{BrowserAction, Step};

pub struct HttpActionExecutor {
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ExecuteBody<'a> {
    step_id: &'a str,
    description: &'a str,
    action: &'a BrowserAction,
}

impl HttpActionExecutor {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            timeout,
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> AutomationError {
        if e.is_timeout() {
            AutomationError::Timeout(self.timeout.as_secs())
        } else if e.is_connect() {
            AutomationError::Unavailable(format!("{}: {e}", self.base_url))
        } else {
            AutomationError::ActionFailed(e.to_string())
        }
    }
}

fn status_error(status: u16, body: String, timeout_secs: u64) -> AutomationError {
    match status {
        409 | 412 => AutomationError::PreconditionFailed(body),
        408 | 504 => AutomationError::Timeout(timeout_secs),
        503 => AutomationError::Unavailable(body),
        _ => AutomationError::ActionFailed(format!("bridge returned {status}: {body}")),
    }
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, step: &Step) -> Result<Observation, AutomationError> {
        let url = format!("{}/execute", self.base_url);
        let body = ExecuteBody {
            step_id: &step.id,
            description: &step.description,
            action: &step.action,
        };

        debug!(step_id = %step.id, action = %step.action, "Forwarding step to bridge");

        let response = self
            .with_auth(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, text, self.timeout.as_secs()));
        }

        response
            .json::<Observation>()
            .await
            .map_err(|e| AutomationError::ActionFailed(format!("invalid observation: {e}")))
    }

    async fn observe(&self) -> Result<PageState, AutomationError> {
        let url = format!("{}/observe", self.base_url);
        let response = self
            .with_auth(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, text, self.timeout.as_secs()));
        }

        response
            .json::<PageState>()
            .await
            .map_err(|e| AutomationError::ActionFailed(format!("invalid page state: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waymark_core::plan::ActionKind;

    #[test]
    fn status_mapping() {
        assert!(matches!(
            status_error(409, "button gone".into(), 30),
            AutomationError::PreconditionFailed(ref s) if s == "button gone"
        ));
        assert!(matches!(status_error(504, String::new(), 30), AutomationError::Timeout(30)));
        assert!(matches!(
            status_error(503, String::new(), 30),
            AutomationError::Unavailable(_)
        ));
        assert!(matches!(
            status_error(500, "boom".into(), 30),
            AutomationError::ActionFailed(_)
        ));
    }

    #[test]
    fn execute_body_shape() {
        let step = Step::new(
            "Search for shoes",
            BrowserAction::new(ActionKind::Type)
                .with_target("#q")
                .with_value("shoes"),
        );
        let body = ExecuteBody {
            step_id: &step.id,
            description: &step.description,
            action: &step.action,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["action"]["kind"], "type");
        assert_eq!(json["action"]["target"], "#q");
        assert_eq!(json["description"], "Search for shoes");
    }

    #[tokio::test]
    async fn unreachable_bridge_is_unavailable() {
        let executor = HttpActionExecutor::new("http://127.0.0.1:1/", None, Duration::from_secs(2));
        assert_eq!(executor.base_url(), "http://127.0.0.1:1");
        let err = executor.observe().await.unwrap_err();
        assert!(
            matches!(err, AutomationError::Unavailable(_) | AutomationError::Timeout(_)),
            "got {err:?}"
        );
    }
}
