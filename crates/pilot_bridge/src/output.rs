//! Turns a raw history record into the stable output shape controllers see.

use std::{collections::BTreeMap, sync::Arc};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::form_urlencoded;

use crate::error::{BridgeError, BridgeResult};
use crate::host::{ExecutionService, HistoryEntry};

/// An image output with a retrieval url built from its location.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ImageRef {
    pub filename: String,
    pub subfolder: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

impl ImageRef {
    pub fn new(filename: &str, subfolder: &str, kind: &str) -> Self {
        Self {
            filename: filename.to_string(),
            subfolder: subfolder.to_string(),
            kind: kind.to_string(),
            url: view_url(filename, subfolder, kind),
        }
    }
}

/// Outputs of one node. Media other than images is passed through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct NodeOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gifs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub videos: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputRecord {
    pub prompt_id: String,
    pub outputs: BTreeMap<String, NodeOutput>,
    pub status: Value,
}

/// `/view?filename=..&subfolder=..&type=..` with form-encoded values.
pub fn view_url(filename: &str, subfolder: &str, kind: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("filename", filename)
        .append_pair("subfolder", subfolder)
        .append_pair("type", kind)
        .finish();
    format!("/view?{query}")
}

pub fn format_outputs(prompt_id: &str, entry: HistoryEntry) -> BridgeResult<OutputRecord> {
    let mut outputs = BTreeMap::new();
    for (node_id, raw) in entry.outputs {
        let Value::Object(mut raw) = raw else {
            return Err(BridgeError::OutputRetrieval(format!(
                "output of node {node_id} is not an object"
            )));
        };
        let images = match raw.remove("images") {
            Some(Value::Array(images)) => Some(
                images
                    .iter()
                    .map(|image| normalize_image(&node_id, image))
                    .collect::<BridgeResult<Vec<_>>>()?,
            ),
            Some(Value::Null) | None => None,
            Some(_) => {
                return Err(BridgeError::OutputRetrieval(format!(
                    "images of node {node_id} is not a list"
                )));
            }
        };
        let node = NodeOutput {
            images,
            gifs: raw.remove("gifs"),
            videos: raw.remove("videos"),
            audio: raw.remove("audio"),
        };
        outputs.insert(node_id, node);
    }

    Ok(OutputRecord {
        prompt_id: prompt_id.to_string(),
        outputs,
        status: entry.status,
    })
}

fn normalize_image(node_id: &str, image: &Value) -> BridgeResult<ImageRef> {
    let filename = image
        .get("filename")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            BridgeError::OutputRetrieval(format!("image of node {node_id} has no filename"))
        })?;
    let subfolder = image.get("subfolder").and_then(Value::as_str).unwrap_or("");
    let kind = image.get("type").and_then(Value::as_str).unwrap_or("output");
    Ok(ImageRef::new(filename, subfolder, kind))
}

/// Reads a prompt's history from the execution service and formats it.
#[derive(Clone)]
pub struct OutputFormatter {
    service: Arc<dyn ExecutionService>,
}

impl OutputFormatter {
    pub fn new(service: Arc<dyn ExecutionService>) -> Self {
        Self { service }
    }

    pub async fn fetch(&self, prompt_id: Option<&str>) -> BridgeResult<OutputRecord> {
        let prompt_id = prompt_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BridgeError::OutputRetrieval("missing prompt id".to_string()))?;

        let entry = self
            .service
            .get_history(prompt_id)
            .await
            .map_err(|err| BridgeError::OutputRetrieval(err.to_string()))?
            .ok_or_else(|| {
                BridgeError::OutputRetrieval(format!("no history for prompt {prompt_id}"))
            })?;

        format_outputs(prompt_id, entry)
    }
}
