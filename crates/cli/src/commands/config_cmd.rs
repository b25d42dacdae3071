//! `waymark config` - Configuration management commands.

use waymark_config::AppConfig;

use super::{CliResult, load_config};

pub async fn validate() -> CliResult {
    println!("🔍 Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let mut warnings = Vec::new();
            if config.llm.on_device.is_none() && !config.has_cloud_key() {
                warnings.push("No usable model (configure llm.on_device or a cloud API key)");
            }
            if config.executor.url.is_none() {
                warnings.push("No executor.url; tasks will fail at the first browser step");
            }
            if config.gateway.host == "0.0.0.0" && !config.gateway.allow_public_bind {
                warnings.push("Gateway bound to 0.0.0.0 without allow_public_bind = true");
            }
            if config.memory.backend == "none" {
                warnings.push("memory.backend = \"none\" keeps nothing across restarts");
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Gateway:    {}:{}", config.gateway.host, config.gateway.port);
            println!("   Memory:     {}", config.memory.backend);
            println!("   Autonomy:   {}", config.workspace_defaults.autonomy_level);
            println!("   Workspaces: {}", config.workspaces.len());
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show() -> CliResult {
    let config = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> CliResult {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}
