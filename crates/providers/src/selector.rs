//! Capability selection - on-device first, cloud as fallback.
//!
//! The selector holds at most one model per role, each with its own
//! per-call timeout. Generation tries the on-device model and only falls
//! back to the cloud model when the local one is unavailable or too slow;
//! any other error is surfaced as-is.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use waymark_core::error::CapabilityError;
use waymark_core::provider::*;

/// The model chosen by [`CapabilitySelector::select`].
#[derive(Clone)]
pub enum SelectedModel {
    OnDevice(Arc<dyn LanguageModel>),
    Cloud(Arc<dyn LanguageModel>),
}

impl SelectedModel {
    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        match self {
            Self::OnDevice(m) | Self::Cloud(m) => m,
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Self::OnDevice(_) => ModelKind::OnDevice,
            Self::Cloud(_) => ModelKind::Cloud,
        }
    }
}

impl std::fmt::Debug for SelectedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SelectedModel::{:?}({})", self.kind(), self.model().name())
    }
}

/// A single role in the selector.
struct Entry {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
}

/// Routes generation to the on-device model, falling back to the cloud.
pub struct CapabilitySelector {
    on_device: Option<Entry>,
    cloud: Option<Entry>,
}

impl CapabilitySelector {
    /// Create a selector with no models.
    pub fn new() -> Self {
        Self {
            on_device: None,
            cloud: None,
        }
    }

    pub fn with_on_device(mut self, model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        self.on_device = Some(Entry { model, timeout });
        self
    }

    pub fn with_cloud(mut self, model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        self.cloud = Some(Entry { model, timeout });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_device.is_none() && self.cloud.is_none()
    }

    /// Configured models, on-device first.
    pub fn models(&self) -> Vec<Arc<dyn LanguageModel>> {
        self.entries().map(|(_, e)| e.model.clone()).collect()
    }

    fn entries(&self) -> impl Iterator<Item = (ModelKind, &Entry)> {
        self.on_device
            .iter()
            .map(|e| (ModelKind::OnDevice, e))
            .chain(self.cloud.iter().map(|e| (ModelKind::Cloud, e)))
    }

    /// Probe availability and return the first model that can serve.
    pub async fn select(&self) -> Result<SelectedModel, CapabilityError> {
        for (kind, entry) in self.entries() {
            let available = tokio::time::timeout(entry.timeout, entry.model.probe())
                .await
                .unwrap_or(false);
            if available {
                info!(model = %entry.model.name(), %kind, "Selected capability");
                return Ok(match kind {
                    ModelKind::OnDevice => SelectedModel::OnDevice(entry.model.clone()),
                    ModelKind::Cloud => SelectedModel::Cloud(entry.model.clone()),
                });
            }
            warn!(model = %entry.model.name(), %kind, "Capability unavailable");
        }
        if self.is_empty() {
            Err(CapabilityError::NotConfigured("No language model configured".into()))
        } else {
            Err(CapabilityError::Unavailable("No language model is reachable".into()))
        }
    }
}

impl Default for CapabilitySelector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for CapabilitySelector {
    fn name(&self) -> &str {
        "selector"
    }

    fn kind(&self) -> ModelKind {
        if self.on_device.is_some() {
            ModelKind::OnDevice
        } else {
            ModelKind::Cloud
        }
    }

    async fn probe(&self) -> bool {
        self.select().await.is_ok()
    }

    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> std::result::Result<GenerateResponse, CapabilityError> {
        let mut last_error = CapabilityError::NotConfigured("No language model configured".into());

        for (kind, entry) in self.entries() {
            let model_name = entry.model.name().to_string();

            info!(model = %model_name, %kind, "Trying capability");

            match tokio::time::timeout(entry.timeout, entry.model.generate(request.clone())).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(CapabilityError::Unavailable(reason))) => {
                    warn!(
                        model = %model_name,
                        reason = %reason,
                        "Capability unavailable, trying next"
                    );
                    last_error = CapabilityError::Unavailable(reason);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(
                        model = %model_name,
                        timeout_secs = entry.timeout.as_secs(),
                        "Capability timed out, trying next"
                    );
                    last_error = CapabilityError::Timeout(format!(
                        "Model '{}' timed out after {}s",
                        model_name,
                        entry.timeout.as_secs()
                    ));
                }
            }
        }

        Err(last_error)
    }
}
