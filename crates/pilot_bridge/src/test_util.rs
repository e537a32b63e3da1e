//! In-memory collaborators for tests.

use std::sync::{
    Mutex, RwLock,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use crate::error::{BridgeError, BridgeResult};
use crate::host::{
    ExecutionEvent, ExecutionService, GraphEvent, GraphHost, HistoryEntry, QueuedPrompt,
};

pub fn empty_graph() -> Value {
    json!({"nodes": [], "links": []})
}

/// Graph host that stores the snapshot as-is.
pub struct MemoryGraph {
    graph: RwLock<Value>,
    events: broadcast::Sender<GraphEvent>,
    broken: AtomicBool,
}

impl MemoryGraph {
    pub fn new(initial: Value) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            graph: RwLock::new(initial),
            events,
            broken: AtomicBool::new(false),
        }
    }

    /// Publish an event as if the host had mutated the graph itself.
    pub fn emit(&self, event: GraphEvent) {
        let _ = self.events.send(event);
    }

    /// Replace the stored graph without publishing anything.
    pub fn replace_silently(&self, graph: Value) {
        *self.graph.write().unwrap() = graph;
    }

    /// Make every later call fail.
    pub fn break_host(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> BridgeResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(BridgeError::Collaborator("graph host unavailable".into()));
        }
        Ok(())
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        MemoryGraph::new(empty_graph())
    }
}

#[async_trait]
impl GraphHost for MemoryGraph {
    async fn serialize(&self) -> BridgeResult<Value> {
        self.check()?;
        Ok(self.graph.read().unwrap().clone())
    }

    async fn configure(&self, snapshot: Value) -> BridgeResult<()> {
        self.check()?;
        *self.graph.write().unwrap() = snapshot;
        self.emit(GraphEvent::Configured);
        Ok(())
    }

    async fn clear(&self) -> BridgeResult<()> {
        self.check()?;
        *self.graph.write().unwrap() = empty_graph();
        self.emit(GraphEvent::Cleared);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.events.subscribe()
    }
}

/// Execution service whose prompts only finish when a test says so.
///
/// Prompt ids are handed out as `p1`, `p2`, ...
pub struct FakeExecutionService {
    events: Mutex<Option<broadcast::Sender<ExecutionEvent>>>,
    next_id: AtomicU64,
    queued: Mutex<Vec<(i64, Value)>>,
    history: DashMap<String, HistoryEntry>,
    /// Fails every queue call once this many prompts have been queued.
    queue_error: Mutex<Option<(usize, String)>>,
    stall_queue: AtomicBool,
    stall_history: AtomicBool,
}

impl FakeExecutionService {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events: Mutex::new(Some(events)),
            next_id: AtomicU64::new(1),
            queued: Mutex::new(vec![]),
            history: DashMap::new(),
            queue_error: Mutex::new(None),
            stall_queue: AtomicBool::new(false),
            stall_history: AtomicBool::new(false),
        }
    }

    /// Returns how many subscribers saw the event.
    pub fn emit(&self, event: ExecutionEvent) -> usize {
        match self.events.lock().unwrap().as_ref() {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        }
    }

    pub fn succeed(&self, prompt_id: &str) -> usize {
        self.emit(ExecutionEvent::Success {
            prompt_id: prompt_id.to_string(),
        })
    }

    pub fn fail(&self, prompt_id: &str, message: Option<&str>) -> usize {
        self.emit(ExecutionEvent::Error {
            prompt_id: prompt_id.to_string(),
            exception_message: message.map(str::to_owned),
        })
    }

    /// Drop the event sender, closing every subscription.
    pub fn close_events(&self) {
        self.events.lock().unwrap().take();
    }

    pub fn set_history(&self, prompt_id: &str, entry: HistoryEntry) {
        self.history.insert(prompt_id.to_string(), entry);
    }

    pub fn fail_queue_with(&self, message: &str) {
        self.fail_queue_after(0, message);
    }

    /// Let `count` prompts through, then fail.
    pub fn fail_queue_after(&self, count: usize, message: &str) {
        *self.queue_error.lock().unwrap() = Some((count, message.to_string()));
    }

    /// Queue calls never return.
    pub fn stall_queue(&self) {
        self.stall_queue.store(true, Ordering::SeqCst);
    }

    /// History lookups never return.
    pub fn stall_history(&self) {
        self.stall_history.store(true, Ordering::SeqCst);
    }

    pub fn queued(&self) -> Vec<(i64, Value)> {
        self.queued.lock().unwrap().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for FakeExecutionService {
    fn default() -> Self {
        FakeExecutionService::new()
    }
}

#[async_trait]
impl ExecutionService for FakeExecutionService {
    async fn queue_prompt(&self, priority: i64, snapshot: Value) -> BridgeResult<QueuedPrompt> {
        if self.stall_queue.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        if let Some((after, message)) = self.queue_error.lock().unwrap().clone() {
            if self.queued.lock().unwrap().len() >= after {
                return Err(BridgeError::Collaborator(message));
            }
        }
        self.queued.lock().unwrap().push((priority, snapshot));
        let number = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(QueuedPrompt {
            prompt_id: format!("p{number}"),
            number: Some(number as i64),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        match self.events.lock().unwrap().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    async fn get_history(&self, prompt_id: &str) -> BridgeResult<Option<HistoryEntry>> {
        if self.stall_history.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        Ok(self.history.get(prompt_id).map(|entry| entry.value().clone()))
    }
}
