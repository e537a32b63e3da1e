use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tokio::signal;
use tracing::{error, info};
use url::Url;

use super::CliContext;
use comfy_pilot::apps::{App, AppOptions};
use comfy_pilot::config::BridgeSettings;
use comfy_pilot::logger::init_tracing;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Address for the websocket endpoint (overrides COMFY_PILOT_LISTEN)
    #[arg(long)]
    pub listen: Option<String>,

    /// ComfyUI base url (overrides COMFY_PILOT_COMFY_URL)
    #[arg(long)]
    pub comfy_url: Option<String>,

    /// Workflow JSON file to seed the graph from
    #[arg(long)]
    pub workflow: Option<PathBuf>,

    /// Reload the workflow file when it changes
    #[arg(long, requires = "workflow")]
    pub watch: bool,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Only log to stdout
    #[arg(long)]
    pub no_log_files: bool,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self {
            listen: None,
            comfy_url: None,
            workflow: None,
            watch: false,
            log_level: "info".to_string(),
            no_log_files: false,
        }
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    init_tracing(&context.root, &args.log_level, !args.no_log_files)?;

    let mut settings = BridgeSettings::load(&context.config_manager).await?;
    if let Some(listen) = args.listen {
        settings.listen = listen;
    }
    if let Some(comfy_url) = args.comfy_url {
        settings.comfy_url =
            Url::parse(&comfy_url).with_context(|| format!("invalid --comfy-url `{comfy_url}`"))?;
    }

    let mut options = AppOptions::new(settings);
    options.workflow = args.workflow;
    options.watch = args.watch;

    info!("comfy-pilot bridge starting up…");
    let mut app = App::new();
    if let Err(err) = app.bootstrap(options).await {
        error!("Failed to bootstrap bridge: {:#}", err);
        app.shutdown().await;
        return Err(err);
    }

    if let Some(url) = app.url() {
        println!("comfy-pilot bridge listening on {url}; press Ctrl‐C to exit");
    }

    signal::ctrl_c().await?;

    println!("\nShutting down…");
    info!("comfy-pilot bridge shutting down");
    app.shutdown().await;
    println!("Goodbye!");
    Ok(())
}
