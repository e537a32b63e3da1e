//! Execution monitor.
//!
//! Every `execute-workflow` request gets its own [`ExecutionHandle`]. A handle
//! moves `Idle -> Pending` once the prompt is queued and then reaches exactly
//! one terminal state:
//!
//! ```text
//!                 ┌──────────── success event (same prompt id) ──► Succeeded
//!                 │
//! Idle ──queue──► Pending ───── error event (same prompt id) ────► Failed
//!  │              │
//!  │              ├──────────── timer expired ───────────────────► TimedOut
//!  │              │
//!  │              └──────────── shutdown token cancelled ────────► Cancelled
//!  │
//!  ├── queue rejected ────────────────────────────────────────────► Failed
//!  ├── timer expired while queueing ──────────────────────────────► TimedOut
//!  └── shutdown token cancelled while queueing ───────────────────► Cancelled
//! ```
//!
//! The timer is armed when the handle is created, so a queue call that never
//! returns still ends in `TimedOut`. The `responded` flag is the only arbiter:
//! whichever transition flips it first sends the single `execution-result`
//! reply, every later attempt is a no-op. The event subscription and the timer
//! live inside the watcher task and are dropped together when it finishes.

use std::{
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use serde_json::Value;
use strum_macros::Display;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::correlator::{Correlator, Source};
use crate::error::{BridgeError, BridgeResult};
use crate::host::{ExecutionEvent, ExecutionService, QueuedPrompt};
use crate::message::{ExecutionResult, ReplyKind};
use crate::output::OutputFormatter;

pub const FALLBACK_ERROR: &str = "execution failed";
pub const TIMEOUT_ERROR: &str = "timeout";
pub const CANCELLED_ERROR: &str = "cancelled";
pub const STREAM_CLOSED_ERROR: &str = "execution event stream closed";

/// Bound on reading a finished prompt's history back.
pub const HISTORY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ExecutionState {
    Idle,
    Pending,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionState::Idle | ExecutionState::Pending)
    }
}

/// The ways a handle can finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed { error: String },
    TimedOut,
    Cancelled,
}

impl Outcome {
    fn state(&self) -> ExecutionState {
        match self {
            Outcome::Succeeded => ExecutionState::Succeeded,
            Outcome::Failed { .. } => ExecutionState::Failed,
            Outcome::TimedOut => ExecutionState::TimedOut,
            Outcome::Cancelled => ExecutionState::Cancelled,
        }
    }
}

/// What to hand to the execution service.
#[derive(Debug, Clone)]
pub struct QueuePlan {
    pub priority: i64,
    pub snapshot: Value,
    pub batch_count: u32,
}

type Registry = Arc<DashMap<String, Arc<ExecutionHandle>>>;

/// Ephemeral state for one in-flight `execute-workflow` request.
pub struct ExecutionHandle {
    id: String,
    request_id: String,
    prompt_id: OnceLock<String>,
    responded: AtomicBool,
    state: Mutex<ExecutionState>,
    /// Cancelled on the terminal transition, or by the monitor on shutdown.
    token: CancellationToken,
    target: Source,
    correlator: Correlator,
    formatter: OutputFormatter,
    registry: Registry,
}

impl ExecutionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn prompt_id(&self) -> Option<&str> {
        self.prompt_id.get().map(String::as_str)
    }

    pub fn state(&self) -> ExecutionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ExecutionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Moves the handle to its terminal state and sends the reply.
    ///
    /// Returns `false` if another transition already won.
    pub async fn resolve(&self, outcome: Outcome) -> bool {
        if self
            .responded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(
                "request {} already answered, dropping {:?}",
                self.request_id, outcome
            );
            return false;
        }

        self.token.cancel();
        self.registry.remove(&self.id);
        self.set_state(outcome.state());

        let prompt_id = self.prompt_id().map(str::to_owned);
        let result = match outcome {
            Outcome::Succeeded => {
                let fetch = self.formatter.fetch(prompt_id.as_deref());
                match tokio::time::timeout(HISTORY_TIMEOUT, fetch).await {
                    Ok(Ok(record)) => ExecutionResult::succeeded(record.prompt_id, record.outputs),
                    Ok(Err(err)) => {
                        warn!(
                            "prompt {:?} succeeded but outputs are unavailable: {}",
                            prompt_id, err
                        );
                        ExecutionResult::outputs_unavailable(
                            prompt_id.clone().unwrap_or_default(),
                            err.to_string(),
                        )
                    }
                    Err(_) => {
                        warn!(
                            "history lookup for prompt {:?} took longer than {:?}",
                            prompt_id, HISTORY_TIMEOUT
                        );
                        ExecutionResult::outputs_unavailable(
                            prompt_id.clone().unwrap_or_default(),
                            TIMEOUT_ERROR,
                        )
                    }
                }
            }
            Outcome::Failed { error } => ExecutionResult::failed(prompt_id.clone(), error),
            Outcome::TimedOut => ExecutionResult::failed(prompt_id.clone(), TIMEOUT_ERROR),
            Outcome::Cancelled => ExecutionResult::failed(prompt_id.clone(), CANCELLED_ERROR),
        };

        // target "request" feeds the json report log
        info!(
            target: "request",
            request_id = %self.request_id,
            prompt_id = ?prompt_id,
            state = %self.state(),
            "execution finished"
        );
        self.correlator.send_response(
            self.target.as_ref(),
            ReplyKind::ExecutionResult,
            &result,
            Some(&self.request_id),
        );
        true
    }

    async fn watch(self: Arc<Self>, mut events: broadcast::Receiver<ExecutionEvent>, deadline: Instant) {
        let Some(prompt_id) = self.prompt_id().map(str::to_owned) else {
            return;
        };

        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => Outcome::Cancelled,
            outcome = wait_for_outcome(&mut events, &prompt_id) => outcome,
            _ = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
        };
        drop(events);

        self.resolve(outcome).await;
    }
}

async fn wait_for_outcome(
    events: &mut broadcast::Receiver<ExecutionEvent>,
    prompt_id: &str,
) -> Outcome {
    loop {
        match events.recv().await {
            Ok(event) if event.prompt_id() == prompt_id => {
                return match event {
                    ExecutionEvent::Success { .. } => Outcome::Succeeded,
                    ExecutionEvent::Error {
                        exception_message, ..
                    } => Outcome::Failed {
                        error: exception_message
                            .filter(|m| !m.is_empty())
                            .unwrap_or_else(|| FALLBACK_ERROR.to_string()),
                    },
                };
            }
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!("prompt {} skipped {} execution events", prompt_id, skipped);
            }
            Err(RecvError::Closed) => {
                return Outcome::Failed {
                    error: STREAM_CLOSED_ERROR.to_string(),
                };
            }
        }
    }
}

/// Starts and tracks execution handles.
#[derive(Clone)]
pub struct ExecutionMonitor {
    service: Arc<dyn ExecutionService>,
    formatter: OutputFormatter,
    correlator: Correlator,
    timeout: Duration,
    in_flight: Registry,
    shutdown: CancellationToken,
}

impl ExecutionMonitor {
    pub fn new(
        service: Arc<dyn ExecutionService>,
        correlator: Correlator,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            formatter: OutputFormatter::new(service.clone()),
            service,
            correlator,
            timeout,
            in_flight: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Queues `plan` and follows the resulting prompt until it finishes.
    ///
    /// The subscription is taken before queueing so an outcome that arrives
    /// while the queue call is still returning is not lost.
    pub async fn start(&self, request_id: &str, target: Source, plan: QueuePlan) -> Arc<ExecutionHandle> {
        let deadline = Instant::now() + self.timeout;
        let handle = Arc::new(ExecutionHandle {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            prompt_id: OnceLock::new(),
            responded: AtomicBool::new(false),
            state: Mutex::new(ExecutionState::Idle),
            token: self.shutdown.child_token(),
            target,
            correlator: self.correlator.clone(),
            formatter: self.formatter.clone(),
            registry: self.in_flight.clone(),
        });
        self.in_flight.insert(handle.id.clone(), handle.clone());

        let events = self.service.subscribe();
        let queued = tokio::select! {
            biased;
            _ = handle.token.cancelled() => Err(Outcome::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                warn!("queue call for request {} outlived the execution timeout", request_id);
                Err(Outcome::TimedOut)
            }
            queued = self.enqueue(request_id, &plan) => queued.map_err(|err| {
                warn!("could not queue prompt for request {}: {}", request_id, err);
                Outcome::Failed {
                    error: err.to_string(),
                }
            }),
        };
        match queued {
            Ok(queued) => {
                info!(
                    request_id = %request_id,
                    prompt_id = %queued.prompt_id,
                    "prompt queued, waiting for outcome"
                );
                let _ = handle.prompt_id.set(queued.prompt_id);
                handle.set_state(ExecutionState::Pending);
                tokio::spawn(handle.clone().watch(events, deadline));
            }
            Err(outcome) => {
                drop(events);
                handle.resolve(outcome).await;
            }
        }
        handle
    }

    async fn enqueue(&self, request_id: &str, plan: &QueuePlan) -> BridgeResult<QueuedPrompt> {
        let wanted = plan.batch_count.max(1);
        let mut queued: Vec<QueuedPrompt> = Vec::new();
        for _ in 0..wanted {
            match self
                .service
                .queue_prompt(plan.priority, plan.snapshot.clone())
                .await
            {
                Ok(prompt) => queued.push(prompt),
                Err(err) => {
                    if !queued.is_empty() {
                        let ids: Vec<&str> = queued.iter().map(|q| q.prompt_id.as_str()).collect();
                        warn!(
                            request_id = %request_id,
                            queued = ?ids,
                            "batch stopped after {} of {} prompts",
                            queued.len(),
                            wanted
                        );
                    }
                    return Err(err);
                }
            }
        }
        queued
            .pop()
            .ok_or_else(|| BridgeError::Collaborator("nothing was queued".to_string()))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn handles(&self) -> Vec<Arc<ExecutionHandle>> {
        self.in_flight.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Cancels every pending handle; each sends a best-effort `cancelled` result.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::ChannelTarget;
    use crate::host::HistoryEntry;
    use crate::message::OutboundMessage;
    use crate::test_util::FakeExecutionService;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn monitor_with(service: Arc<FakeExecutionService>, timeout: Duration) -> ExecutionMonitor {
        ExecutionMonitor::new(service, Correlator::default(), timeout, CancellationToken::new())
    }

    fn plan() -> QueuePlan {
        QueuePlan {
            priority: 0,
            snapshot: json!({"nodes": []}),
            batch_count: 1,
        }
    }

    fn target() -> (Source, UnboundedReceiver<OutboundMessage>) {
        let (target, rx) = ChannelTarget::new("test");
        (Arc::new(target), rx)
    }

    #[tokio::test]
    async fn success_replies_with_outputs_and_drops_subscription() {
        let service = Arc::new(FakeExecutionService::new());
        let monitor = monitor_with(service.clone(), Duration::from_secs(60));
        let (target, mut rx) = target();

        let handle = monitor.start("r1", target, plan()).await;
        assert_eq!(handle.state(), ExecutionState::Pending);
        assert_eq!(handle.prompt_id(), Some("p1"));
        assert_eq!(service.subscriber_count(), 1);

        service.set_history(
            "p1",
            serde_json::from_value::<HistoryEntry>(json!({
                "outputs": {"9": {"images": [{"filename": "out.png", "subfolder": "", "type": "output"}]}},
                "status": {}
            }))
            .unwrap(),
        );
        service.succeed("p1");

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, "comfy-pilot:execution-result");
        assert_eq!(reply.request_id.as_deref(), Some("r1"));
        assert_eq!(reply.payload["success"], json!(true));
        assert_eq!(reply.payload["promptId"], json!("p1"));
        assert_eq!(
            reply.payload["outputs"]["9"]["images"][0]["url"],
            json!("/view?filename=out.png&subfolder=&type=output")
        );
        assert_eq!(handle.state(), ExecutionState::Succeeded);
        assert_eq!(service.subscriber_count(), 0);
        assert_eq!(monitor.in_flight(), 0);

        // further events no longer reach anyone
        assert_eq!(service.succeed("p1"), 0);
    }

    #[tokio::test]
    async fn events_for_other_prompts_are_ignored() {
        let service = Arc::new(FakeExecutionService::new());
        let monitor = monitor_with(service.clone(), Duration::from_secs(60));
        let (first_target, mut first_rx) = target();
        let (second_target, mut second_rx) = target();

        let first = monitor.start("a", first_target, plan()).await;
        let second = monitor.start("b", second_target, plan()).await;
        assert_eq!(first.prompt_id(), Some("p1"));
        assert_eq!(second.prompt_id(), Some("p2"));

        service.set_history("p1", HistoryEntry::default());
        service.succeed("p1");

        let reply = first_rx.recv().await.unwrap();
        assert_eq!(reply.payload["promptId"], json!("p1"));
        assert_eq!(first.state(), ExecutionState::Succeeded);

        tokio::task::yield_now().await;
        assert_eq!(second.state(), ExecutionState::Pending);
        assert!(second_rx.try_recv().is_err());
        assert_eq!(monitor.in_flight(), 1);
        assert_eq!(monitor.handles()[0].request_id(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_replies_exactly_once() {
        let service = Arc::new(FakeExecutionService::new());
        let monitor = monitor_with(service.clone(), Duration::from_secs(300));
        let (target, mut rx) = target();

        let handle = monitor.start("r1", target, plan()).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(
            reply.payload,
            json!({"success": false, "promptId": "p1", "error": "timeout"})
        );
        assert_eq!(handle.state(), ExecutionState::TimedOut);
        assert_eq!(service.subscriber_count(), 0);

        service.succeed("p1");
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn racing_transitions_reply_once() {
        let service = Arc::new(FakeExecutionService::new());
        let monitor = monitor_with(service.clone(), Duration::from_secs(60));
        let (target, mut rx) = target();
        service.set_history("p1", HistoryEntry::default());

        let handle = monitor.start("r1", target, plan()).await;
        let (a, b, c) = tokio::join!(
            handle.resolve(Outcome::Succeeded),
            handle.resolve(Outcome::TimedOut),
            handle.resolve(Outcome::Failed {
                error: "x".into()
            }),
        );
        assert_eq!([a, b, c].iter().filter(|won| **won).count(), 1);

        service.succeed("p1");
        assert!(rx.recv().await.is_some());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(rx.try_recv().is_err());
        assert!(handle.is_responded());
        assert!(handle.state().is_terminal());
    }

    #[tokio::test]
    async fn error_event_uses_exception_message_or_fallback() {
        let service = Arc::new(FakeExecutionService::new());
        let monitor = monitor_with(service.clone(), Duration::from_secs(60));
        let (target, mut rx) = target();

        monitor.start("r1", target.clone(), plan()).await;
        monitor.start("r2", target, plan()).await;
        service.fail("p1", Some("CUDA out of memory"));
        service.fail("p2", None);

        let mut replies = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        replies.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        assert_eq!(replies[0].payload["error"], json!("CUDA out of memory"));
        assert_eq!(replies[1].payload["error"], json!(FALLBACK_ERROR));
        assert_eq!(replies[1].payload["promptId"], json!("p2"));
    }

    #[tokio::test]
    async fn queue_failure_is_a_failed_result() {
        let service = Arc::new(FakeExecutionService::new());
        service.fail_queue_with("prompt has no outputs");
        let monitor = monitor_with(service.clone(), Duration::from_secs(60));
        let (target, mut rx) = target();

        let handle = monitor.start("r1", target, plan()).await;
        assert_eq!(handle.state(), ExecutionState::Failed);
        let reply = rx.recv().await.unwrap();
        assert_eq!(
            reply.payload,
            json!({"success": false, "error": "prompt has no outputs"})
        );
        assert_eq!(service.subscriber_count(), 0);
        assert_eq!(monitor.in_flight(), 0);
    }

    #[tokio::test]
    async fn missing_history_keeps_success() {
        let service = Arc::new(FakeExecutionService::new());
        let monitor = monitor_with(service.clone(), Duration::from_secs(60));
        let (target, mut rx) = target();

        monitor.start("r1", target, plan()).await;
        service.succeed("p1");

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.payload["success"], json!(true));
        assert_eq!(reply.payload["outputs"], Value::Null);
        assert!(reply.payload["outputError"].as_str().unwrap().contains("p1"));
    }

    #[tokio::test]
    async fn cancel_all_answers_pending_handles() {
        let service = Arc::new(FakeExecutionService::new());
        let monitor = monitor_with(service.clone(), Duration::from_secs(60));
        let (target, mut rx) = target();

        let handle = monitor.start("r1", target, plan()).await;
        monitor.cancel_all();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.payload["error"], json!(CANCELLED_ERROR));
        assert_eq!(handle.state(), ExecutionState::Cancelled);
    }

    #[tokio::test]
    async fn closed_event_stream_fails_the_handle() {
        let service = Arc::new(FakeExecutionService::new());
        let monitor = monitor_with(service.clone(), Duration::from_secs(60));
        let (target, mut rx) = target();

        monitor.start("r1", target, plan()).await;
        service.close_events();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.payload["error"], json!(STREAM_CLOSED_ERROR));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_queue_call_times_out() {
        let service = Arc::new(FakeExecutionService::new());
        service.stall_queue();
        let monitor = monitor_with(service.clone(), Duration::from_secs(300));
        let (target, mut rx) = target();

        let started = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.start("r1", target, plan()).await })
        };
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.request_id.as_deref(), Some("r1"));
        assert_eq!(reply.payload, json!({"success": false, "error": "timeout"}));

        let handle = started.await.unwrap();
        assert_eq!(handle.state(), ExecutionState::TimedOut);
        assert_eq!(handle.prompt_id(), None);
        assert_eq!(monitor.in_flight(), 0);
        assert_eq!(service.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_queue_call_is_cancelled_on_shutdown() {
        let service = Arc::new(FakeExecutionService::new());
        service.stall_queue();
        let monitor = monitor_with(service.clone(), Duration::from_secs(300));
        let (target, mut rx) = target();

        let started = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.start("r1", target, plan()).await })
        };
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(monitor.in_flight(), 1);
        assert!(rx.try_recv().is_err());

        monitor.cancel_all();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.payload, json!({"success": false, "error": "cancelled"}));
        assert_eq!(started.await.unwrap().state(), ExecutionState::Cancelled);
        assert_eq!(monitor.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_history_lookup_still_replies() {
        let service = Arc::new(FakeExecutionService::new());
        service.stall_history();
        let monitor = monitor_with(service.clone(), Duration::from_secs(300));
        let (target, mut rx) = target();

        let handle = monitor.start("r1", target, plan()).await;
        service.succeed("p1");

        let reply = rx.recv().await.unwrap();
        assert_eq!(
            reply.payload,
            json!({"success": true, "promptId": "p1", "outputs": null, "outputError": "timeout"})
        );
        assert_eq!(handle.state(), ExecutionState::Succeeded);
        assert!(handle.is_responded());
    }

    #[tokio::test]
    async fn partial_batch_failure_is_a_failed_result() {
        let service = Arc::new(FakeExecutionService::new());
        service.fail_queue_after(2, "queue is full");
        let monitor = monitor_with(service.clone(), Duration::from_secs(60));
        let (target, mut rx) = target();

        let handle = monitor
            .start(
                "r1",
                target,
                QueuePlan {
                    batch_count: 4,
                    ..plan()
                },
            )
            .await;
        assert_eq!(service.queued().len(), 2);
        assert_eq!(handle.state(), ExecutionState::Failed);
        assert_eq!(
            rx.recv().await.unwrap().payload,
            json!({"success": false, "error": "queue is full"})
        );
    }

    #[tokio::test]
    async fn batch_follows_the_last_prompt() {
        let service = Arc::new(FakeExecutionService::new());
        let monitor = monitor_with(service.clone(), Duration::from_secs(60));
        let (target, _rx) = target();

        let handle = monitor
            .start(
                "r1",
                target,
                QueuePlan {
                    batch_count: 3,
                    ..plan()
                },
            )
            .await;
        assert_eq!(service.queued().len(), 3);
        assert_eq!(handle.prompt_id(), Some("p3"));
    }
}
