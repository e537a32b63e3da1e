use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::message::{ErrorPayload, Namespace, OutboundMessage, ReplyKind};

/// Where a reply goes: the context that sent the original request, or the
/// parent that receives notifications.
pub trait ReplyTarget: Send + Sync {
    fn post(&self, message: OutboundMessage) -> BridgeResult<()>;

    /// Short label for logs.
    fn describe(&self) -> String {
        "target".to_string()
    }
}

pub type Source = Arc<dyn ReplyTarget>;

/// A reply target backed by an unbounded channel. Transports hand the
/// receiving end to whatever writes frames out.
#[derive(Debug, Clone)]
pub struct ChannelTarget {
    id: String,
    tx: UnboundedSender<OutboundMessage>,
}

impl ChannelTarget {
    pub fn new(id: impl Into<String>) -> (Self, UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = unbounded_channel();
        (Self { id: id.into(), tx }, rx)
    }

    pub fn from_sender(id: impl Into<String>, tx: UnboundedSender<OutboundMessage>) -> Self {
        Self { id: id.into(), tx }
    }
}

impl ReplyTarget for ChannelTarget {
    fn post(&self, message: OutboundMessage) -> BridgeResult<()> {
        self.tx
            .send(message)
            .map_err(|_| BridgeError::ChannelClosed(self.id.clone()))
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

/// Builds namespaced, timestamped replies that echo the caller's `requestId`.
///
/// Delivery is best effort: a target that went away is logged and otherwise
/// ignored.
#[derive(Debug, Clone, Default)]
pub struct Correlator {
    namespace: Namespace,
}

impl Correlator {
    pub fn new(namespace: Namespace) -> Self {
        Self { namespace }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn send_response<P: Serialize>(
        &self,
        target: &dyn ReplyTarget,
        kind: ReplyKind,
        payload: P,
        request_id: Option<&str>,
    ) {
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("could not encode {} payload: {}", kind, err);
                self.send_error(target, &err.to_string(), request_id);
                return;
            }
        };
        let message = OutboundMessage::new(
            self.namespace.qualify(kind),
            payload,
            request_id.map(str::to_owned),
        );
        self.deliver(target, message);
    }

    pub fn send_error(&self, target: &dyn ReplyTarget, message: &str, request_id: Option<&str>) {
        let payload = ErrorPayload {
            message: message.to_string(),
        };
        let message = OutboundMessage::new(
            self.namespace.qualify(ReplyKind::Error),
            json!(payload),
            request_id.map(str::to_owned),
        );
        self.deliver(target, message);
    }

    /// Unsolicited message; never carries a `requestId`.
    pub fn notify<P: Serialize>(&self, target: &dyn ReplyTarget, kind: ReplyKind, payload: P) {
        self.send_response(target, kind, payload, None);
    }

    fn deliver(&self, target: &dyn ReplyTarget, message: OutboundMessage) {
        let kind = message.kind.clone();
        match target.post(message) {
            Ok(()) => debug!("sent {} to {}", kind, target.describe()),
            Err(err) => warn!("could not deliver {} to {}: {}", kind, target.describe(), err),
        }
    }
}
