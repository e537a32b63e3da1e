use std::{env, path::PathBuf};

use clap::Parser;

mod cli;

use cli::{Cli, CliContext, default_command, execute};
use comfy_pilot::config::{ConfigManager, EnvConfigManager};

/// Resolve the comfy_pilot root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("COMFY_PILOT_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./comfy_pilot")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();
    let config_manager = ConfigManager(EnvConfigManager::new(root.join(".env")));
    let context = CliContext::new(root, config_manager);

    execute(&context, cli.command.unwrap_or_else(default_command)).await
}
