pub mod config_cmd;
pub mod doctor;
pub mod memory;
pub mod onboard;
pub mod run;
pub mod serve;
pub mod status;
pub mod workspaces;

use waymark_config::AppConfig;
use waymark_core::workspace::WorkspaceId;
use waymark_gateway::AppState;

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

pub fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

/// Wire the full runtime and resolve `workspace` against it.
pub async fn runtime_for(
    workspace: &str,
) -> Result<(AppState, WorkspaceId), Box<dyn std::error::Error>> {
    let state = AppState::from_config(load_config()?).await?;
    let id = WorkspaceId::from(workspace);
    if state.workspaces.get(&id).await.is_err() {
        return Err(format!(
            "Unknown workspace '{workspace}'. Add it under [[workspaces]] in {}",
            AppConfig::config_dir().join("config.toml").display()
        )
        .into());
    }
    Ok((state, id))
}
