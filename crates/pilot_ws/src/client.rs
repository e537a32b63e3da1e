use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use pilot_bridge::{InboundMessage, Namespace, OutboundMessage, RequestKind};
use serde_json::Value;
use tokio::{
    sync::{
        broadcast,
        mpsc::{UnboundedSender, unbounded_channel},
        oneshot,
    },
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Message as WsMsg, client::IntoClientRequest, http::HeaderValue},
};
use tracing::debug;
use uuid::Uuid;

use crate::error::WsError;

type Pending = Arc<DashMap<String, oneshot::Sender<OutboundMessage>>>;

/// Controller side of the bridge.
///
/// Every call gets a fresh `requestId`; the reply carrying it completes the
/// call. Messages without a pending `requestId` are notifications and go to
/// [`BridgeClient::subscribe`] receivers.
pub struct BridgeClient {
    namespace: Namespace,
    out_tx: UnboundedSender<WsMsg>,
    pending: Pending,
    notifications: broadcast::Sender<OutboundMessage>,
    task: JoinHandle<()>,
}

impl BridgeClient {
    pub async fn connect(
        url: &str,
        namespace: Namespace,
        origin: Option<&str>,
    ) -> Result<Self, WsError> {
        let mut request = url.into_client_request()?;
        if let Some(origin) = origin {
            let value =
                HeaderValue::from_str(origin).map_err(|err| WsError::Header(err.to_string()))?;
            request.headers_mut().insert("origin", value);
        }
        let (ws, _) = connect_async(request).await?;
        let (mut write, mut read) = ws.split();

        let (out_tx, mut out_rx) = unbounded_channel::<WsMsg>();
        let pending: Pending = Arc::new(DashMap::new());
        let (notifications, _) = broadcast::channel(64);

        let task = {
            let pending = pending.clone();
            let notifications = notifications.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        outgoing = out_rx.recv() => match outgoing {
                            Some(frame) => {
                                if write.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = write.send(WsMsg::Close(None)).await;
                                break;
                            }
                        },
                        incoming = read.next() => match incoming {
                            Some(Ok(WsMsg::Text(text))) => {
                                match serde_json::from_str::<OutboundMessage>(text.as_str()) {
                                    Ok(message) => deliver(&pending, &notifications, message),
                                    Err(err) => debug!("ignoring unexpected frame: {}", err),
                                }
                            }
                            Some(Ok(WsMsg::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        }
                    }
                }
                // wakes every pending caller with `Closed`
                pending.clear();
            })
        };

        Ok(Self {
            namespace,
            out_tx,
            pending,
            notifications,
            task,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.notifications.subscribe()
    }

    pub async fn call(
        &self,
        kind: RequestKind,
        payload: Option<Value>,
        timeout: Duration,
    ) -> Result<OutboundMessage, WsError> {
        let request_id = Uuid::new_v4().to_string();
        let message = InboundMessage::new(
            self.namespace.qualify(kind),
            payload,
            Some(request_id.clone()),
        );
        let text = serde_json::to_string(&message)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);
        if self.out_tx.send(WsMsg::Text(text.into())).is_err() {
            self.pending.remove(&request_id);
            return Err(WsError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(WsError::Closed),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(WsError::Timeout(timeout))
            }
        }
    }

    pub async fn close(self) {
        let BridgeClient { out_tx, task, .. } = self;
        drop(out_tx);
        let _ = task.await;
    }
}

fn deliver(
    pending: &Pending,
    notifications: &broadcast::Sender<OutboundMessage>,
    message: OutboundMessage,
) {
    let waiter = message
        .request_id
        .as_ref()
        .and_then(|id| pending.remove(id))
        .map(|(_, tx)| tx);
    match waiter {
        Some(tx) => {
            let _ = tx.send(message);
        }
        None => {
            let _ = notifications.send(message);
        }
    }
}
