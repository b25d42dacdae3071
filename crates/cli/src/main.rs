//! Waymark CLI - the main entry point.
//!
//! Commands:
//! - `onboard`    - Write a starter config
//! - `serve`      - Start the HTTP gateway
//! - `run`        - Pursue one goal in a workspace from the terminal
//! - `workspaces` - List configured workspaces
//! - `memory`     - Inspect or promote a workspace's memory
//! - `config`     - Validate, show or locate the config file
//! - `status`     - Show the resolved configuration
//! - `doctor`     - Diagnose model and browser connectivity

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "waymark",
    about = "Waymark — workspace-scoped memory and orchestration for web-automation agents",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "WAYMARK_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration
    Onboard,

    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Pursue a goal in a workspace, prompting for approvals
    Run {
        /// Workspace id
        #[arg(short, long)]
        workspace: String,

        /// What the agent should accomplish
        goal: String,

        /// Approve every gated step without asking
        #[arg(long)]
        yes: bool,
    },

    /// List configured workspaces
    Workspaces,

    /// Inspect a workspace's memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Configuration file commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show resolved configuration
    Status,

    /// Diagnose model and browser connectivity
    Doctor,
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Tier counts and cursors
    Stats {
        #[arg(short, long)]
        workspace: String,
    },
    /// Search semantic facts
    Search {
        #[arg(short, long)]
        workspace: String,
        query: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Run episodic → semantic/procedural promotion now
    Promote {
        #[arg(short, long)]
        workspace: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Check the config file for errors
    Validate,
    /// Print the resolved config as TOML
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    match cli.command {
        Commands::Onboard => commands::onboard::run().await?,
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Run {
            workspace,
            goal,
            yes,
        } => commands::run::run(workspace, goal, yes).await?,
        Commands::Workspaces => commands::workspaces::list().await?,
        Commands::Memory { action } => match action {
            MemoryAction::Stats { workspace } => commands::memory::stats(&workspace).await?,
            MemoryAction::Search {
                workspace,
                query,
                limit,
            } => commands::memory::search(&workspace, &query, limit).await?,
            MemoryAction::Promote { workspace } => commands::memory::promote(&workspace).await?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Validate => commands::config_cmd::validate().await?,
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
        },
        Commands::Status => commands::status::run().await?,
        Commands::Doctor => commands::doctor::run().await?,
    }

    Ok(())
}
