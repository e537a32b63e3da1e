use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod call;
pub mod run;
pub mod schema;

use call::CallArgs;
use run::RunArgs;
use schema::SchemaArgs;

use comfy_pilot::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(
    name = "comfy_pilot",
    about = "Drive an embedded workflow editor from an external controller",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the bridge
    Run(RunArgs),

    /// Send one request to a running bridge and print the reply
    Call(CallArgs),

    /// Emit JSON‐Schema for the wire messages
    Schema(SchemaArgs),
}

#[derive(Clone)]
pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(root: PathBuf, config_manager: ConfigManager) -> Self {
        Self {
            root,
            config_manager,
        }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Call(args) => call::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}
