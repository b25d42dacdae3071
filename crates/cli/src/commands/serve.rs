//! `waymark serve` - Start the HTTP API server.

use super::{CliResult, load_config};

pub async fn run(port_override: Option<u16>) -> CliResult {
    let mut config = load_config()?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("🧭 Waymark Gateway");
    println!("   Listening:  {}:{}", config.gateway.host, config.gateway.port);
    println!("   Memory:     {}", config.memory.backend);
    println!("   Workspaces: {} seeded", config.workspaces.len());

    waymark_gateway::start(config).await?;

    Ok(())
}
