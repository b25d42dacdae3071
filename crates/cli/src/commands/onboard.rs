//! `waymark onboard` - First-time setup.

use waymark_config::AppConfig;

use super::CliResult;

pub async fn run() -> CliResult {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("🧭 Waymark — First-Time Setup");
    println!("=============================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("✅ Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    let data_dir = AppConfig::default().memory.resolved_data_dir();
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
        println!("✅ Created memory directory: {}", data_dir.display());
    }

    if config_path.exists() {
        println!("\n⚠️  Config already exists at: {}", config_path.display());
        println!("   Edit it manually or delete and re-run onboard.\n");
        return Ok(());
    }

    let mut toml = AppConfig::default_toml();
    toml.push_str(concat!(
        "\n# Each workspace keeps its own memory, pins and autonomy policy.\n",
        "[[workspaces]]\n",
        "id = \"default\"\n",
        "name = \"Default\"\n",
    ));
    std::fs::write(&config_path, toml)?;
    println!("✅ Created config.toml at: {}", config_path.display());
    println!("\n📝 Next steps:");
    println!("   1. Point [llm.on_device] at a local model or set WAYMARK_CLOUD_API_KEY");
    println!("   2. Set executor.url to your browser bridge");
    println!("   3. Run: waymark doctor");
    println!("   4. Run: waymark run -w default \"<goal>\"\n");

    Ok(())
}
