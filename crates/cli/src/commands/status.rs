//! `waymark status` - Show resolved configuration.

use waymark_config::AppConfig;

use super::{CliResult, load_config};

pub async fn run() -> CliResult {
    let config = load_config()?;

    let endpoint = |e: &Option<waymark_config::ModelEndpointConfig>| match e {
        Some(e) => format!("{} @ {}", e.model, e.api_url),
        None => "(not configured)".into(),
    };

    println!("🧭 Waymark Status");
    println!("==================");
    println!("  Config dir:   {}", AppConfig::config_dir().display());
    println!("  On-device:    {}", endpoint(&config.llm.on_device));
    println!("  Cloud:        {}", endpoint(&config.llm.cloud));
    println!(
        "  Memory:       {} ({})",
        config.memory.backend,
        config.memory.resolved_data_dir().display()
    );
    println!(
        "  Browser:      {}",
        config.executor.url.as_deref().unwrap_or("(not configured)")
    );
    println!("  Gateway:      {}:{}", config.gateway.host, config.gateway.port);
    println!("  Workspaces:   {}", config.workspaces.len());
    println!(
        "  Defaults:     autonomy {}, budget {} tokens, approval {}s",
        config.workspace_defaults.autonomy_level,
        config.workspace_defaults.context_token_budget,
        config.workspace_defaults.approval_timeout_secs
    );

    let config_path = AppConfig::config_dir().join("config.toml");
    if config_path.exists() {
        println!("\n  ✅ Config file found");
    } else {
        println!("\n  ⚠️  No config file — run `waymark onboard` first");
    }

    Ok(())
}
