use std::{fs, path::Path};

use anyhow::{Context, Result};
use pilot_bridge::{
    message::{AckPayload, ErrorPayload, ExecuteParams, ExecutionResult, PongPayload},
    output::OutputRecord,
    InboundMessage, OutboundMessage,
};
use schemars::{JsonSchema, schema_for};

use crate::config::SettingsKeys;

fn write_one<T: JsonSchema>(out_dir: &Path, name: &str) -> Result<String> {
    let schema = schema_for!(T);
    let json = serde_json::to_string_pretty(&schema)?;
    let file = format!("{name}.schema.json");
    let path = out_dir.join(&file);
    fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(file)
}

/// Writes one `<name>.schema.json` per wire type into `out_dir` and returns
/// the file names.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    Ok(vec![
        write_one::<InboundMessage>(out_dir, "inbound-message")?,
        write_one::<OutboundMessage>(out_dir, "outbound-message")?,
        write_one::<ExecuteParams>(out_dir, "execute-params")?,
        write_one::<ExecutionResult>(out_dir, "execution-result")?,
        write_one::<OutputRecord>(out_dir, "output-record")?,
        write_one::<PongPayload>(out_dir, "pong")?,
        write_one::<AckPayload>(out_dir, "ack")?,
        write_one::<ErrorPayload>(out_dir, "error")?,
        write_one::<SettingsKeys>(out_dir, "config")?,
    ])
}
