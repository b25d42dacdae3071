//! `waymark workspaces` - List configured workspaces.

use super::{CliResult, load_config};

pub async fn list() -> CliResult {
    let config = load_config()?;

    if config.workspaces.is_empty() {
        println!("No workspaces configured. Add a [[workspaces]] entry to config.toml.");
        return Ok(());
    }

    println!("{:<20} {:<24} {:>8} {:>8} {:>9}", "ID", "NAME", "AUTONOMY", "BUDGET", "APPROVAL");
    for seed in &config.workspaces {
        let ws = config
            .seed_config(seed)
            .into_workspace()
            .map_err(|e| format!("workspace {}: {e}", seed.name))?;
        println!(
            "{:<20} {:<24} {:>8} {:>8} {:>8}s",
            ws.id,
            ws.name,
            ws.autonomy_level.value(),
            ws.context_token_budget,
            ws.approval_timeout_secs
        );
    }
    Ok(())
}
