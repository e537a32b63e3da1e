use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::correlator::{Correlator, Source};
use crate::host::{GraphEvent, GraphHost};
use crate::message::ReplyKind;

/// Pushes the active graph to the parent whenever the host reports a change.
///
/// Tab switches always produce `tab-changed`. Graph mutations produce
/// `workflow-changed`, but only when the serialized graph differs from the
/// last one pushed. Events that queue up while a notification is being built
/// are folded into the next one.
pub struct ChangeNotifier {
    graph: Arc<dyn GraphHost>,
    parent: Source,
    correlator: Correlator,
    events: broadcast::Receiver<GraphEvent>,
    last_sent: Option<Value>,
}

impl ChangeNotifier {
    /// Subscribes immediately, so nothing published after construction is missed.
    pub fn new(graph: Arc<dyn GraphHost>, parent: Source, correlator: Correlator) -> Self {
        let events = graph.subscribe();
        Self {
            graph,
            parent,
            correlator,
            events,
            last_sent: None,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("change notifier started for {}", self.parent.describe());
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv() => event,
            };
            let mut batch = match first {
                Ok(event) => vec![event],
                Err(RecvError::Lagged(skipped)) => {
                    warn!("change notifier skipped {} graph events", skipped);
                    vec![GraphEvent::Loaded]
                }
                Err(RecvError::Closed) => break,
            };
            loop {
                match self.events.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(TryRecvError::Lagged(_)) => batch.push(GraphEvent::Loaded),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
            self.publish(&batch).await;
        }
        info!("change notifier stopped");
    }

    /// Sends at most one notification for `batch`. Returns the kind sent.
    pub async fn publish(&mut self, batch: &[GraphEvent]) -> Option<ReplyKind> {
        let tab_changed = batch.iter().any(GraphEvent::is_tab_change);
        let graph_changed = batch.iter().any(GraphEvent::is_graph_change);
        if !tab_changed && !graph_changed {
            return None;
        }

        let workflow = match self.graph.serialize().await {
            Ok(workflow) => workflow,
            Err(err) => {
                warn!("could not serialize graph for change notification: {}", err);
                return None;
            }
        };

        let kind = if tab_changed {
            ReplyKind::TabChanged
        } else if self.last_sent.as_ref() != Some(&workflow) {
            ReplyKind::WorkflowChanged
        } else {
            debug!("graph unchanged, no notification");
            return None;
        };

        self.correlator
            .notify(self.parent.as_ref(), kind, &workflow);
        self.last_sent = Some(workflow);
        Some(kind)
    }
}
