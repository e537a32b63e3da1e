use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use clap::Args;
use pilot_bridge::{Namespace, ReplyKind, RequestKind};
use pilot_ws::BridgeClient;
use serde_json::Value;

use super::CliContext;
use comfy_pilot::config::BridgeSettings;
use comfy_pilot::logger::init_tracing;

/// Slack on top of the bridge's own execution timeout.
const EXECUTE_SLACK: Duration = Duration::from_secs(10);

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Command without namespace: ping, get-workflow, set-workflow,
    /// execute-workflow or new-workflow
    pub command: String,

    /// JSON payload
    #[arg(long)]
    pub payload: Option<String>,

    /// Bridge url (default: ws://<COMFY_PILOT_LISTEN>)
    #[arg(long)]
    pub url: Option<String>,

    /// Origin header to present
    #[arg(long)]
    pub origin: Option<String>,

    /// Seconds to wait for the reply
    #[arg(long)]
    pub timeout: Option<u64>,
}

pub async fn execute(args: CallArgs, context: &CliContext) -> anyhow::Result<()> {
    init_tracing(&context.root, "warn", false)?;
    let settings = BridgeSettings::load(&context.config_manager).await?;

    let kind: RequestKind = args
        .command
        .parse()
        .map_err(|_| anyhow!("unknown command `{}`", args.command))?;
    let payload: Option<Value> = args
        .payload
        .as_deref()
        .map(|raw| serde_json::from_str::<Value>(raw))
        .transpose()
        .context("--payload is not valid JSON")?;
    let timeout = match args.timeout {
        Some(secs) => Duration::from_secs(secs),
        None if kind == RequestKind::ExecuteWorkflow => {
            settings.bridge.execution_timeout + EXECUTE_SLACK
        }
        None => Duration::from_secs(30),
    };
    let url = args
        .url
        .unwrap_or_else(|| format!("ws://{}", settings.listen));
    let namespace = Namespace::new(&settings.bridge.namespace);

    let client = BridgeClient::connect(&url, namespace.clone(), args.origin.as_deref())
        .await
        .with_context(|| format!("could not connect to {url}"))?;
    let reply = client.call(kind, payload, timeout).await;
    client.close().await;
    let reply = reply?;

    println!("{}", serde_json::to_string_pretty(&reply)?);
    if reply.kind == namespace.qualify(ReplyKind::Error) {
        bail!(
            "bridge replied with an error: {}",
            reply.payload["message"].as_str().unwrap_or("unknown")
        );
    }
    Ok(())
}
