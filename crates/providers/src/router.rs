//! Builds the capability selector and action executor from configuration.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use waymark_config::AppConfig;
use waymark_core::provider::ModelKind;

use crate::executor_http::HttpActionExecutor;
use crate::openai_compat::ChatCompletionsModel;
use crate::selector::CapabilitySelector;

/// Build the on-device/cloud selector.
///
/// A cloud endpoint without an API key is left out entirely, so the
/// selector never falls back to a model that would reject every call.
pub fn build_from_config(config: &AppConfig) -> CapabilitySelector {
    let timeout = Duration::from_secs(config.llm.request_timeout_secs);
    let mut selector = CapabilitySelector::new();

    if let Some(local) = &config.llm.on_device {
        info!(url = %local.api_url, model = %local.model, "Configuring on-device model");
        selector = selector.with_on_device(
            Arc::new(ChatCompletionsModel::new(
                ModelKind::OnDevice,
                &local.api_url,
                &local.model,
                local.api_key.clone(),
                timeout,
            )),
            timeout,
        );
    }

    if let Some(cloud) = &config.llm.cloud
        && cloud.api_key.is_some()
    {
        info!(url = %cloud.api_url, model = %cloud.model, "Configuring cloud model");
        selector = selector.with_cloud(
            Arc::new(ChatCompletionsModel::new(
                ModelKind::Cloud,
                &cloud.api_url,
                &cloud.model,
                cloud.api_key.clone(),
                timeout,
            )),
            timeout,
        );
    }

    selector
}

/// Build the HTTP action executor, if a bridge URL is configured.
pub fn build_executor(config: &AppConfig) -> Option<HttpActionExecutor> {
    config.executor.url.as_ref().map(|url| {
        HttpActionExecutor::new(
            url,
            config.executor.api_key.clone(),
            Duration::from_secs(config.executor.timeout_secs),
        )
    })
}
