//! The narrow interface the bridge needs from its host.
//!
//! The host owns the graph and the execution engine. The bridge only ever
//! serializes, restores or clears the graph, queues prompts, listens for
//! their outcome and reads their history.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::error::BridgeResult;

/// Published by the graph host once a mutation has fully completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphEvent {
    /// The graph was replaced through `configure`.
    Configured,
    /// The graph was (re)loaded from outside, e.g. from disk.
    Loaded,
    Cleared,
    NodeAdded,
    NodeRemoved,
    TabSelected,
    TabAdded,
    TabRemoved { was_current: bool },
}

impl GraphEvent {
    pub fn is_tab_change(&self) -> bool {
        match self {
            GraphEvent::TabSelected | GraphEvent::TabAdded => true,
            GraphEvent::TabRemoved { was_current } => *was_current,
            _ => false,
        }
    }

    pub fn is_graph_change(&self) -> bool {
        matches!(
            self,
            GraphEvent::Configured
                | GraphEvent::Loaded
                | GraphEvent::Cleared
                | GraphEvent::NodeAdded
                | GraphEvent::NodeRemoved
        )
    }
}

/// The editor's graph component.
#[async_trait]
pub trait GraphHost: Send + Sync + 'static {
    /// Snapshot of the active graph.
    async fn serialize(&self) -> BridgeResult<Value>;
    /// Replace the active graph with `snapshot`.
    async fn configure(&self, snapshot: Value) -> BridgeResult<()>;
    /// Reset the active graph to an empty one.
    async fn clear(&self) -> BridgeResult<()>;
    /// Stream of completed mutations.
    fn subscribe(&self) -> broadcast::Receiver<GraphEvent>;
}

/// What the execution service hands back for a queued prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedPrompt {
    pub prompt_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<i64>,
}

/// Outcome events published by the execution service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    Success {
        prompt_id: String,
    },
    Error {
        prompt_id: String,
        exception_message: Option<String>,
    },
}

impl ExecutionEvent {
    pub fn prompt_id(&self) -> &str {
        match self {
            ExecutionEvent::Success { prompt_id } => prompt_id,
            ExecutionEvent::Error { prompt_id, .. } => prompt_id,
        }
    }
}

/// One record of the execution history, as returned for a single prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub status: Value,
}

/// The prompt queue plus its event stream and history.
#[async_trait]
pub trait ExecutionService: Send + Sync + 'static {
    async fn queue_prompt(&self, priority: i64, snapshot: Value) -> BridgeResult<QueuedPrompt>;
    fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent>;
    async fn get_history(&self, prompt_id: &str) -> BridgeResult<Option<HistoryEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removing_a_background_tab_is_not_a_change() {
        assert!(!GraphEvent::TabRemoved { was_current: false }.is_tab_change());
        assert!(GraphEvent::TabRemoved { was_current: true }.is_tab_change());
        assert!(GraphEvent::NodeAdded.is_graph_change());
        assert!(!GraphEvent::TabAdded.is_graph_change());
    }
}
