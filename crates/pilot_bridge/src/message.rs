use std::collections::BTreeMap;

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::output::NodeOutput;

pub const DEFAULT_NAMESPACE: &str = "comfy-pilot";
pub const BRIDGE_VERSION: &str = "1.0.0";

/// The reserved `<namespace>:` prefix every message type carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    pub fn new(name: &str) -> Self {
        let name = name.trim_end_matches(':');
        Self {
            prefix: format!("{name}:"),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the un-prefixed command, or `None` if `kind` is outside the namespace.
    pub fn strip<'a>(&self, kind: &'a str) -> Option<&'a str> {
        kind.strip_prefix(self.prefix.as_str())
    }

    pub fn qualify(&self, kind: impl AsRef<str>) -> String {
        format!("{}{}", self.prefix, kind.as_ref())
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace::new(DEFAULT_NAMESPACE)
    }
}

/// Commands a controller can send to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum RequestKind {
    GetWorkflow,
    SetWorkflow,
    ExecuteWorkflow,
    Ping,
    NewWorkflow,
}

/// Message types the bridge sends back, either as replies or as notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ReplyKind {
    WorkflowData,
    WorkflowSet,
    ExecutionResult,
    Pong,
    WorkflowCreated,
    Error,
    TabChanged,
    WorkflowChanged,
}

/// A message as it arrives from the controller.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl InboundMessage {
    pub fn new(kind: impl Into<String>, payload: Option<Value>, request_id: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            request_id,
        }
    }

    /// Lenient decoding of whatever arrived on the channel.
    ///
    /// Anything that is not an object with a string `type` yields `None`.
    /// A `null` payload counts as absent, an empty `requestId` counts as absent
    /// and a numeric `requestId` is kept in its decimal form.
    pub fn from_value(data: &Value) -> Option<Self> {
        let obj = data.as_object()?;
        let kind = obj.get("type")?.as_str()?.to_string();
        let payload = obj.get("payload").filter(|p| !p.is_null()).cloned();
        let request_id = match obj.get("requestId") {
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };
        Some(Self {
            kind,
            payload,
            request_id,
        })
    }
}

/// A reply or notification sent to the controller.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl OutboundMessage {
    pub fn new(kind: impl Into<String>, payload: Value, request_id: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            request_id,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PongPayload {
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AckPayload {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteParams {
    #[serde(default)]
    pub batch_count: Option<u32>,
}

/// Payload of an `execution-result` reply.
///
/// `outputs` is tri-state on the wire: absent on failure, `null` when the
/// execution succeeded but its outputs could not be read, an object otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Option<BTreeMap<String, NodeOutput>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(prompt_id: impl Into<String>, outputs: BTreeMap<String, NodeOutput>) -> Self {
        Self {
            success: true,
            prompt_id: Some(prompt_id.into()),
            outputs: Some(Some(outputs)),
            output_error: None,
            error: None,
        }
    }

    /// The prompt ran, reading its outputs back did not.
    pub fn outputs_unavailable(prompt_id: impl Into<String>, output_error: impl Into<String>) -> Self {
        Self {
            success: true,
            prompt_id: Some(prompt_id.into()),
            outputs: Some(None),
            output_error: Some(output_error.into()),
            error: None,
        }
    }

    pub fn failed(prompt_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            prompt_id,
            outputs: None,
            output_error: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn namespace_strips_and_qualifies() {
        let ns = Namespace::default();
        assert_eq!(ns.strip("comfy-pilot:ping"), Some("ping"));
        assert_eq!(ns.strip("other:ping"), None);
        assert_eq!(ns.qualify(ReplyKind::Pong), "comfy-pilot:pong");
        assert_eq!(Namespace::new("x:").prefix(), "x:");
    }

    #[test]
    fn kinds_use_kebab_case() {
        let kind: RequestKind = "execute-workflow".parse().unwrap();
        assert_eq!(kind, RequestKind::ExecuteWorkflow);
        assert_eq!(ReplyKind::WorkflowCreated.as_ref(), "workflow-created");
        assert!("executeWorkflow".parse::<RequestKind>().is_err());
    }

    #[test]
    fn inbound_decoding_is_lenient() {
        let msg = InboundMessage::from_value(&json!({
            "type": "comfy-pilot:set-workflow",
            "payload": null,
            "requestId": ""
        }))
        .unwrap();
        assert_eq!(msg.payload, None);
        assert_eq!(msg.request_id, None);

        let msg = InboundMessage::from_value(&json!({"type": "x", "requestId": 42})).unwrap();
        assert_eq!(msg.request_id.as_deref(), Some("42"));

        assert!(InboundMessage::from_value(&json!({"payload": {}})).is_none());
        assert!(InboundMessage::from_value(&json!({"type": 3})).is_none());
        assert!(InboundMessage::from_value(&json!("comfy-pilot:ping")).is_none());
    }

    #[test]
    fn outbound_omits_missing_request_id() {
        let msg = OutboundMessage::new("comfy-pilot:workflow-changed", json!({}), None);
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("requestId").is_none());
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn execution_result_wire_shapes() {
        let ok = serde_json::to_value(ExecutionResult::outputs_unavailable("p1", "gone")).unwrap();
        assert_eq!(
            ok,
            json!({"success": true, "promptId": "p1", "outputs": null, "outputError": "gone"})
        );

        let failed = serde_json::to_value(ExecutionResult::failed(None, "timeout")).unwrap();
        assert_eq!(failed, json!({"success": false, "error": "timeout"}));
    }
}
