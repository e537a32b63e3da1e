//! In-memory graph host with tabs.
//!
//! Every mutation goes through this type, so it can publish a [`GraphEvent`]
//! only once the new state is in place.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use pilot_bridge::{BridgeError, BridgeResult, GraphEvent, GraphHost};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::debug;

pub const DEFAULT_TAB: &str = "Unsaved Workflow";

pub fn empty_workflow() -> Value {
    json!({
        "last_node_id": 0,
        "last_link_id": 0,
        "nodes": [],
        "links": [],
        "groups": [],
        "config": {},
        "extra": {},
        "version": 0.4
    })
}

#[derive(Debug, Clone)]
struct Tab {
    name: String,
    workflow: Value,
}

#[derive(Debug)]
struct Tabs {
    open: Vec<Tab>,
    current: usize,
}

impl Tabs {
    fn current(&self) -> &Tab {
        &self.open[self.current]
    }

    fn current_mut(&mut self) -> &mut Tab {
        &mut self.open[self.current]
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.open.iter().position(|tab| tab.name == name)
    }
}

pub struct InMemoryGraph {
    tabs: RwLock<Tabs>,
    events: broadcast::Sender<GraphEvent>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::with_workflow(empty_workflow())
    }

    pub fn with_workflow(workflow: Value) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            tabs: RwLock::new(Tabs {
                open: vec![Tab {
                    name: DEFAULT_TAB.to_string(),
                    workflow,
                }],
                current: 0,
            }),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tabs> {
        self.tabs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tabs> {
        self.tabs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: GraphEvent) {
        debug!("graph event {:?}", event);
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn tab_names(&self) -> Vec<String> {
        self.read().open.iter().map(|tab| tab.name.clone()).collect()
    }

    pub fn current_tab(&self) -> String {
        self.read().current().name.clone()
    }

    /// Opens a new tab holding `workflow` and makes it current.
    pub fn add_tab(&self, name: &str, workflow: Value) -> BridgeResult<()> {
        {
            let mut tabs = self.write();
            if tabs.position(name).is_some() {
                return Err(BridgeError::Collaborator(format!("tab `{name}` is already open")));
            }
            tabs.open.push(Tab {
                name: name.to_string(),
                workflow,
            });
            tabs.current = tabs.open.len() - 1;
        }
        self.publish(GraphEvent::TabAdded);
        Ok(())
    }

    pub fn select_tab(&self, name: &str) -> BridgeResult<()> {
        {
            let mut tabs = self.write();
            let index = tabs
                .position(name)
                .ok_or_else(|| BridgeError::Collaborator(format!("no tab named `{name}`")))?;
            if index == tabs.current {
                return Ok(());
            }
            tabs.current = index;
        }
        self.publish(GraphEvent::TabSelected);
        Ok(())
    }

    /// Closes a tab. The last open tab cannot be closed.
    pub fn remove_tab(&self, name: &str) -> BridgeResult<()> {
        let was_current = {
            let mut tabs = self.write();
            let index = tabs
                .position(name)
                .ok_or_else(|| BridgeError::Collaborator(format!("no tab named `{name}`")))?;
            if tabs.open.len() == 1 {
                return Err(BridgeError::Collaborator("cannot close the last tab".to_string()));
            }
            let was_current = index == tabs.current;
            tabs.open.remove(index);
            if index < tabs.current || tabs.current >= tabs.open.len() {
                tabs.current = tabs.current.saturating_sub(1);
            }
            was_current
        };
        self.publish(GraphEvent::TabRemoved { was_current });
        Ok(())
    }

    /// Appends `node` to the current workflow, assigning an id if it has none.
    pub fn add_node(&self, mut node: Value) -> BridgeResult<i64> {
        let id = {
            let mut tabs = self.write();
            let workflow = &mut tabs.current_mut().workflow;
            let id = match node.get("id").and_then(Value::as_i64) {
                Some(id) => id,
                None => workflow.get("last_node_id").and_then(Value::as_i64).unwrap_or(0) + 1,
            };
            if let Value::Object(fields) = &mut node {
                fields.insert("id".to_string(), json!(id));
            }
            nodes_mut(workflow)?.push(node);
            let last = workflow.get("last_node_id").and_then(Value::as_i64).unwrap_or(0);
            if let Value::Object(fields) = workflow {
                fields.insert("last_node_id".to_string(), json!(last.max(id)));
            }
            id
        };
        self.publish(GraphEvent::NodeAdded);
        Ok(id)
    }

    /// Returns whether a node with `id` existed.
    pub fn remove_node(&self, id: i64) -> BridgeResult<bool> {
        let removed = {
            let mut tabs = self.write();
            let nodes = nodes_mut(&mut tabs.current_mut().workflow)?;
            let before = nodes.len();
            nodes.retain(|node| node.get("id").and_then(Value::as_i64) != Some(id));
            nodes.len() != before
        };
        if removed {
            self.publish(GraphEvent::NodeRemoved);
        }
        Ok(removed)
    }

    /// Replaces the current workflow from an outside source such as a file.
    pub fn load(&self, workflow: Value) -> BridgeResult<()> {
        ensure_object(&workflow)?;
        self.write().current_mut().workflow = workflow;
        self.publish(GraphEvent::Loaded);
        Ok(())
    }
}

impl Default for InMemoryGraph {
    fn default() -> Self {
        InMemoryGraph::new()
    }
}

fn ensure_object(workflow: &Value) -> BridgeResult<()> {
    if workflow.is_object() {
        Ok(())
    } else {
        Err(BridgeError::MalformedRequest(
            "workflow must be a JSON object".to_string(),
        ))
    }
}

fn nodes_mut(workflow: &mut Value) -> BridgeResult<&mut Vec<Value>> {
    let Value::Object(fields) = workflow else {
        return Err(BridgeError::Collaborator("current workflow is not an object".to_string()));
    };
    let nodes = fields.entry("nodes").or_insert_with(|| json!([]));
    nodes
        .as_array_mut()
        .ok_or_else(|| BridgeError::Collaborator("workflow `nodes` is not a list".to_string()))
}

#[async_trait]
impl GraphHost for InMemoryGraph {
    async fn serialize(&self) -> BridgeResult<Value> {
        Ok(self.read().current().workflow.clone())
    }

    async fn configure(&self, snapshot: Value) -> BridgeResult<()> {
        ensure_object(&snapshot)?;
        self.write().current_mut().workflow = snapshot;
        self.publish(GraphEvent::Configured);
        Ok(())
    }

    async fn clear(&self) -> BridgeResult<()> {
        self.write().current_mut().workflow = empty_workflow();
        self.publish(GraphEvent::Cleared);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.events.subscribe()
    }
}
