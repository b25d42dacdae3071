//! `waymark doctor` - Diagnose model and browser connectivity.

use waymark_config::AppConfig;
use waymark_core::executor::ActionExecutor;

use super::CliResult;

pub async fn run() -> CliResult {
    println!("🩺 Waymark Doctor — System Diagnostics");
    println!("======================================\n");

    let mut issues = 0;

    let config_path = AppConfig::config_dir().join("config.toml");
    if !config_path.exists() {
        println!("  ⚠️  No config file — run `waymark onboard` (using defaults)");
        issues += 1;
    }
    let config = match AppConfig::load() {
        Ok(config) => {
            println!("  ✅ Configuration valid");
            config
        }
        Err(e) => {
            println!("  ❌ Configuration invalid: {e}");
            println!("\n  ⚠️  1 blocking issue found.");
            return Ok(());
        }
    };

    // Models
    let selector = waymark_providers::build_from_config(&config);
    if selector.is_empty() {
        println!("  ❌ No language model configured — add [llm.on_device] or [llm.cloud]");
        issues += 1;
    }
    for model in selector.models() {
        if model.probe().await {
            println!("  ✅ {} model '{}' reachable", model.kind(), model.name());
        } else {
            println!("  ⚠️  {} model '{}' unreachable", model.kind(), model.name());
            issues += 1;
        }
    }
    if config.llm.cloud.is_some() && !config.has_cloud_key() {
        println!("  ⚠️  Cloud model has no API key — set WAYMARK_CLOUD_API_KEY");
        issues += 1;
    }

    // Browser bridge
    match waymark_providers::build_executor(&config) {
        Some(executor) => match executor.observe().await {
            Ok(page) => println!("  ✅ Browser bridge at {} ({page})", executor.base_url()),
            Err(e) => {
                println!("  ❌ Browser bridge at {}: {e}", executor.base_url());
                issues += 1;
            }
        },
        None => {
            println!("  ⚠️  No browser bridge — set executor.url to run tasks");
            issues += 1;
        }
    }

    // Memory
    if config.memory.backend == "none" {
        println!("  ⚠️  memory.backend = \"none\": memory is lost on restart");
    } else {
        match waymark_memory::build_from_config(&config.memory).await {
            Ok(p) => println!("  ✅ Memory backend '{}' ready", p.name()),
            Err(e) => {
                println!("  ❌ Memory backend '{}': {e}", config.memory.backend);
                issues += 1;
            }
        }
    }

    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
