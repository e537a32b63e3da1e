//! Execution service backed by a ComfyUI server.

pub mod events;

use std::{sync::Mutex, time::Duration};

use async_trait::async_trait;
use pilot_bridge::{
    BridgeError, BridgeResult, ExecutionEvent, ExecutionService, HistoryEntry, QueuedPrompt,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

/// Bound on every HTTP call to the execution service.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Response of `POST /prompt`.
#[derive(Debug, Deserialize)]
struct PromptResponse {
    prompt_id: String,
    #[serde(default)]
    number: Option<i64>,
}

pub struct ComfyClient {
    http: Client,
    base: Url,
    client_id: String,
    events: broadcast::Sender<ExecutionEvent>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ComfyClient {
    pub fn new(base: Url) -> BridgeResult<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(collaborator)?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            http,
            base: base_dir(base),
            client_id: Uuid::new_v4().to_string(),
            events,
            reader: Mutex::new(None),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Starts following the `/ws` status stream. Calling it again is a no-op.
    pub fn start_events(&self, cancel: CancellationToken) {
        let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        if reader.is_some() {
            return;
        }
        let url = events::ws_url(&self.base, &self.client_id);
        info!("following execution events at {}", url);
        *reader = Some(tokio::spawn(events::run_event_reader(
            url,
            self.events.clone(),
            cancel,
        )));
    }

    pub fn stop_events(&self) {
        if let Some(handle) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// `path` is relative, so a prefix on the base url is kept.
    fn endpoint(&self, path: &str) -> BridgeResult<Url> {
        self.base
            .join(path)
            .map_err(|err| BridgeError::Collaborator(format!("invalid url for {path}: {err}")))
    }
}

/// The base url as a directory: trailing slash, no query or fragment.
pub fn base_dir(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.set_query(None);
    base.set_fragment(None);
    base
}

/// Body of `POST /prompt`.
///
/// A snapshot carrying an `output` key (editor graph converted for execution)
/// sends `output` as the prompt and keeps `workflow` as metadata. Anything
/// else is sent as the prompt as-is. Priority `-1` queues at the front, `0`
/// appends, any other value is sent as the queue number.
pub fn prompt_body(client_id: &str, priority: i64, snapshot: Value) -> Value {
    let mut body = Map::new();
    body.insert("client_id".to_string(), json!(client_id));

    match snapshot {
        Value::Object(mut fields) if fields.contains_key("output") => {
            let output = fields.remove("output").unwrap_or(Value::Null);
            body.insert("prompt".to_string(), output);
            if let Some(workflow) = fields.remove("workflow") {
                body.insert(
                    "extra_data".to_string(),
                    json!({"extra_pnginfo": {"workflow": workflow}}),
                );
            }
        }
        other => {
            body.insert("prompt".to_string(), other);
        }
    }

    match priority {
        -1 => {
            body.insert("front".to_string(), json!(true));
        }
        0 => {}
        n => {
            body.insert("number".to_string(), json!(n));
        }
    }
    Value::Object(body)
}

/// Pulls a readable message out of an error response body.
fn error_message(status: reqwest::StatusCode, body: &Value) -> String {
    let error = body.get("error");
    error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .or_else(|| error.and_then(Value::as_str))
        .map(str::to_owned)
        .unwrap_or_else(|| format!("execution service returned {status}"))
}

fn collaborator(err: reqwest::Error) -> BridgeError {
    BridgeError::Collaborator(err.to_string())
}

#[async_trait]
impl ExecutionService for ComfyClient {
    async fn queue_prompt(&self, priority: i64, snapshot: Value) -> BridgeResult<QueuedPrompt> {
        let body = prompt_body(&self.client_id, priority, snapshot);
        let response = self
            .http
            .post(self.endpoint("prompt")?)
            .json(&body)
            .send()
            .await
            .map_err(collaborator)?;

        let status = response.status();
        let body: Value = response.json().await.map_err(collaborator)?;
        if !status.is_success() || body.get("error").is_some() {
            return Err(BridgeError::Collaborator(error_message(status, &body)));
        }
        let queued: PromptResponse = serde_json::from_value(body)?;
        debug!("queued prompt {} (number {:?})", queued.prompt_id, queued.number);
        Ok(QueuedPrompt {
            prompt_id: queued.prompt_id,
            number: queued.number,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    async fn get_history(&self, prompt_id: &str) -> BridgeResult<Option<HistoryEntry>> {
        let response = self
            .http
            .get(self.endpoint(&format!("history/{prompt_id}"))?)
            .send()
            .await
            .map_err(collaborator)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = response
            .error_for_status()
            .map_err(collaborator)?
            .json()
            .await
            .map_err(collaborator)?;
        match body.get(prompt_id) {
            Some(entry) => Ok(Some(serde_json::from_value(entry.clone())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_snapshot_is_sent_as_prompt() {
        let body = prompt_body("c1", 0, json!({"3": {"class_type": "KSampler"}}));
        assert_eq!(
            body,
            json!({"client_id": "c1", "prompt": {"3": {"class_type": "KSampler"}}})
        );
    }

    #[test]
    fn converted_graph_keeps_workflow_metadata() {
        let body = prompt_body(
            "c1",
            -1,
            json!({"output": {"1": {}}, "workflow": {"nodes": []}}),
        );
        assert_eq!(body["prompt"], json!({"1": {}}));
        assert_eq!(
            body["extra_data"]["extra_pnginfo"]["workflow"],
            json!({"nodes": []})
        );
        assert_eq!(body["front"], json!(true));
        assert!(body.get("number").is_none());

        let body = prompt_body("c1", 7, json!({}));
        assert_eq!(body["number"], json!(7));
    }

    #[test]
    fn endpoints_keep_the_base_path() {
        let client = ComfyClient::new(Url::parse("http://host:8188/comfy").unwrap()).unwrap();
        assert_eq!(client.base_url().as_str(), "http://host:8188/comfy/");
        assert_eq!(
            client.endpoint("prompt").unwrap().as_str(),
            "http://host:8188/comfy/prompt"
        );
        assert_eq!(
            client.endpoint("history/abc").unwrap().as_str(),
            "http://host:8188/comfy/history/abc"
        );

        let client = ComfyClient::new(Url::parse("http://127.0.0.1:8188").unwrap()).unwrap();
        assert_eq!(
            client.endpoint("prompt").unwrap().as_str(),
            "http://127.0.0.1:8188/prompt"
        );
    }

    #[test]
    fn error_bodies_are_summarised() {
        let status = reqwest::StatusCode::BAD_REQUEST;
        assert_eq!(
            error_message(status, &json!({"error": {"message": "Prompt outputs failed validation"}})),
            "Prompt outputs failed validation"
        );
        assert_eq!(error_message(status, &json!({"error": "no prompt"})), "no prompt");
        assert_eq!(
            error_message(status, &json!({})),
            "execution service returned 400 Bad Request"
        );
    }
}
