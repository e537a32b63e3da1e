//! Inbound message router.
//!
//! One router serves every connected controller. Each message is checked for
//! an allowed origin and the namespace prefix, then dispatched to exactly one
//! handler. Handler errors become `error` replies to whoever sent the request.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, QueueMode};
use crate::correlator::{Correlator, Source};
use crate::error::{BridgeError, BridgeResult};
use crate::host::{ExecutionService, GraphHost};
use crate::message::{
    AckPayload, ExecuteParams, InboundMessage, Namespace, PongPayload, ReplyKind, RequestKind,
};
use crate::monitor::{ExecutionMonitor, QueuePlan};

/// A raw inbound message plus where it came from.
pub struct Envelope {
    pub data: Value,
    pub origin: Option<String>,
    pub source: Source,
}

impl Envelope {
    pub fn new(data: Value, origin: Option<String>, source: Source) -> Self {
        Self {
            data,
            origin,
            source,
        }
    }
}

pub struct BridgeRouter {
    config: BridgeConfig,
    namespace: Namespace,
    correlator: Correlator,
    graph: Arc<dyn GraphHost>,
    monitor: ExecutionMonitor,
}

impl BridgeRouter {
    /// `shutdown` is the parent of every execution handle's token.
    pub fn new(
        config: BridgeConfig,
        graph: Arc<dyn GraphHost>,
        service: Arc<dyn ExecutionService>,
        shutdown: CancellationToken,
    ) -> Self {
        let namespace = Namespace::new(&config.namespace);
        let correlator = Correlator::new(namespace.clone());
        let monitor = ExecutionMonitor::new(
            service,
            correlator.clone(),
            config.execution_timeout,
            shutdown,
        );
        Self {
            config,
            namespace,
            correlator,
            graph,
            monitor,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn monitor(&self) -> &ExecutionMonitor {
        &self.monitor
    }

    /// Serve envelopes until the channel closes or `cancel` fires.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Envelope>, cancel: CancellationToken) {
        info!("bridge router listening for {} messages", self.namespace.prefix());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("bridge router cancelled");
                    break;
                }
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.handle(envelope).await,
                    None => {
                        info!("bridge router channel closed");
                        break;
                    }
                }
            }
        }
        self.monitor.cancel_all();
    }

    pub async fn handle(&self, envelope: Envelope) {
        let Some(message) = InboundMessage::from_value(&envelope.data) else {
            return;
        };
        let Some(command) = self.namespace.strip(&message.kind) else {
            return;
        };
        if !self.config.origin_allowed(envelope.origin.as_deref()) {
            warn!(
                "dropping {} from disallowed origin {:?}",
                message.kind, envelope.origin
            );
            return;
        }

        let request_id = message.request_id.as_deref();
        let Ok(kind) = command.parse::<RequestKind>() else {
            if self.config.reject_unknown {
                self.correlator.send_error(
                    envelope.source.as_ref(),
                    &format!("unknown command: {command}"),
                    request_id,
                );
            } else {
                debug!("ignoring unknown command {}", message.kind);
            }
            return;
        };

        debug!("dispatching {} (request {:?})", kind, request_id);
        if let Err(err) = self.dispatch(kind, &message, &envelope.source).await {
            error!("{} failed: {}", kind, err);
            self.correlator
                .send_error(envelope.source.as_ref(), &err.to_string(), request_id);
        }
    }

    async fn dispatch(
        &self,
        kind: RequestKind,
        message: &InboundMessage,
        source: &Source,
    ) -> BridgeResult<()> {
        let request_id = message.request_id.as_deref();
        match kind {
            RequestKind::GetWorkflow => self.handle_get_workflow(source, request_id).await,
            RequestKind::SetWorkflow => {
                self.handle_set_workflow(source, message.payload.clone(), request_id)
                    .await
            }
            RequestKind::ExecuteWorkflow => {
                self.handle_execute_workflow(source, message.payload.as_ref(), request_id)
                    .await
            }
            RequestKind::Ping => self.handle_ping(source, request_id),
            RequestKind::NewWorkflow => self.handle_new_workflow(source, request_id).await,
        }
    }

    async fn handle_get_workflow(&self, source: &Source, request_id: Option<&str>) -> BridgeResult<()> {
        let workflow = self.graph.serialize().await?;
        self.correlator
            .send_response(source.as_ref(), ReplyKind::WorkflowData, &workflow, request_id);
        Ok(())
    }

    async fn handle_set_workflow(
        &self,
        source: &Source,
        payload: Option<Value>,
        request_id: Option<&str>,
    ) -> BridgeResult<()> {
        let workflow = payload
            .ok_or_else(|| BridgeError::MalformedRequest("missing workflow data".to_string()))?;
        self.graph.configure(workflow).await?;
        self.correlator.send_response(
            source.as_ref(),
            ReplyKind::WorkflowSet,
            AckPayload { success: true },
            request_id,
        );
        Ok(())
    }

    /// Validates and snapshots in order, then queues and monitors in the
    /// background so later messages are not held up by the queue call.
    async fn handle_execute_workflow(
        &self,
        source: &Source,
        payload: Option<&Value>,
        request_id: Option<&str>,
    ) -> BridgeResult<()> {
        let request_id = request_id.ok_or_else(|| {
            BridgeError::MalformedRequest("execute-workflow requires a requestId".to_string())
        })?;
        let params: ExecuteParams = match payload {
            Some(payload) => serde_json::from_value(payload.clone())
                .map_err(|err| BridgeError::MalformedRequest(format!("invalid payload: {err}")))?,
            None => ExecuteParams::default(),
        };
        let batch_count = match self.config.queue_mode {
            QueueMode::Snapshot => 1,
            QueueMode::Run => {
                let requested = params.batch_count.unwrap_or(1).max(1);
                let max = self.config.max_batch_count.max(1);
                if requested > max {
                    warn!("batchCount {} capped to {}", requested, max);
                }
                requested.min(max)
            }
        };
        let snapshot = self.graph.serialize().await?;
        let plan = QueuePlan {
            priority: self.config.priority,
            snapshot,
            batch_count,
        };

        let monitor = self.monitor.clone();
        let source = source.clone();
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            monitor.start(&request_id, source, plan).await;
        });
        Ok(())
    }

    fn handle_ping(&self, source: &Source, request_id: Option<&str>) -> BridgeResult<()> {
        self.correlator.send_response(
            source.as_ref(),
            ReplyKind::Pong,
            PongPayload {
                version: self.config.version.clone(),
            },
            request_id,
        );
        Ok(())
    }

    async fn handle_new_workflow(&self, source: &Source, request_id: Option<&str>) -> BridgeResult<()> {
        self.graph.clear().await?;
        self.correlator.send_response(
            source.as_ref(),
            ReplyKind::WorkflowCreated,
            AckPayload { success: true },
            request_id,
        );
        Ok(())
    }
}
