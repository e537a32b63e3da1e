//! ComfyUI `/ws` status stream.

use std::time::Duration;

use futures_util::StreamExt;
use pilot_bridge::ExecutionEvent;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMsg};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
pub const INTERRUPTED_ERROR: &str = "execution interrupted";

#[derive(Debug, Deserialize)]
struct StatusFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Maps a text frame to an execution outcome. Progress and status frames
/// yield `None`.
pub fn parse_event(text: &str) -> Option<ExecutionEvent> {
    let frame: StatusFrame = serde_json::from_str(text).ok()?;
    let prompt_id = frame.data.get("prompt_id")?.as_str()?.to_string();
    match frame.kind.as_str() {
        "execution_success" => Some(ExecutionEvent::Success { prompt_id }),
        "execution_error" => Some(ExecutionEvent::Error {
            prompt_id,
            exception_message: frame
                .data
                .get("exception_message")
                .and_then(Value::as_str)
                .map(str::to_owned),
        }),
        "execution_interrupted" => Some(ExecutionEvent::Error {
            prompt_id,
            exception_message: Some(INTERRUPTED_ERROR.to_string()),
        }),
        _ => None,
    }
}

/// `ws(s)://host/<prefix>/ws?clientId=<id>` for an `http(s)` base url.
pub fn ws_url(base: &Url, client_id: &str) -> Url {
    let mut url = super::base_dir(base.clone());
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    // http -> ws and https -> wss are both allowed scheme changes
    let _ = url.set_scheme(scheme);
    let path = format!("{}ws", url.path());
    url.set_path(&path);
    url.query_pairs_mut().append_pair("clientId", client_id);
    url
}

/// Reads the status stream until `cancel` fires, reconnecting after drops.
pub async fn run_event_reader(
    url: Url,
    events: broadcast::Sender<ExecutionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            connected = connect_async(url.as_str()) => connected,
        };
        match connected {
            Ok((mut ws, _)) => {
                info!("connected to execution events at {}", url);
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => return,
                        frame = ws.next() => frame,
                    };
                    match frame {
                        Some(Ok(WsMsg::Text(text))) => {
                            if let Some(event) = parse_event(text.as_str()) {
                                debug!("execution event {:?}", event);
                                let _ = events.send(event);
                            }
                        }
                        Some(Ok(WsMsg::Close(_))) | None => break,
                        // binary frames carry previews
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!("execution event stream failed: {}", err);
                            break;
                        }
                    }
                }
                warn!("execution event stream disconnected");
            }
            Err(err) => warn!("could not connect to {}: {}", url, err),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
    info!("execution event reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_frames_are_mapped() {
        assert_eq!(
            parse_event(r#"{"type": "execution_success", "data": {"prompt_id": "abc", "timestamp": 1}}"#),
            Some(ExecutionEvent::Success {
                prompt_id: "abc".into()
            })
        );
        assert_eq!(
            parse_event(
                r#"{"type": "execution_error", "data": {"prompt_id": "abc", "node_id": "4", "exception_message": "boom"}}"#
            ),
            Some(ExecutionEvent::Error {
                prompt_id: "abc".into(),
                exception_message: Some("boom".into())
            })
        );
        assert_eq!(
            parse_event(r#"{"type": "execution_interrupted", "data": {"prompt_id": "abc"}}"#)
                .and_then(|e| match e {
                    ExecutionEvent::Error {
                        exception_message, ..
                    } => exception_message,
                    _ => None,
                }),
            Some(INTERRUPTED_ERROR.to_string())
        );
    }

    #[test]
    fn other_frames_are_ignored() {
        assert_eq!(parse_event(r#"{"type": "progress", "data": {"prompt_id": "abc", "value": 3}}"#), None);
        assert_eq!(parse_event(r#"{"type": "status", "data": {"status": {}}}"#), None);
        assert_eq!(parse_event(r#"{"type": "execution_success", "data": {}}"#), None);
        assert_eq!(parse_event("not json"), None);
    }

    #[test]
    fn ws_url_follows_base_scheme() {
        let url = ws_url(&Url::parse("http://127.0.0.1:8188/").unwrap(), "c1");
        assert_eq!(url.as_str(), "ws://127.0.0.1:8188/ws?clientId=c1");
        let url = ws_url(&Url::parse("https://comfy.example/api?x=1").unwrap(), "c2");
        assert_eq!(url.as_str(), "wss://comfy.example/api/ws?clientId=c2");
    }
}
