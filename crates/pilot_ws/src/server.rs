use std::{net::SocketAddr, sync::Arc};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use pilot_bridge::{BridgeError, BridgeResult, Envelope, OutboundMessage, ReplyTarget, Source};
use serde_json::Value;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinHandle,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        Message as WsMsg,
        handshake::server::{ErrorResponse, Request, Response},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WsError;

/// Commands sent to the manager task
enum Command {
    Register {
        peer: String,
        sender: UnboundedSender<WsMsg>,
    },
    Unregister {
        peer: String,
    },
    Send {
        peer: String,
        msg: WsMsg,
    },
    Broadcast {
        msg: WsMsg,
    },
}

type Peers = Arc<DashMap<String, UnboundedSender<WsMsg>>>;

/// Replies to the connection a request arrived on.
#[derive(Clone)]
pub struct PeerTarget {
    peer: String,
    cmd_tx: UnboundedSender<Command>,
}

impl ReplyTarget for PeerTarget {
    fn post(&self, message: OutboundMessage) -> BridgeResult<()> {
        let text = serde_json::to_string(&message)?;
        self.cmd_tx
            .send(Command::Send {
                peer: self.peer.clone(),
                msg: WsMsg::Text(text.into()),
            })
            .map_err(|_| BridgeError::ChannelClosed(self.peer.clone()))
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }
}

/// Sends to every connected controller. Used for change notifications.
#[derive(Clone)]
pub struct BroadcastTarget {
    cmd_tx: UnboundedSender<Command>,
}

impl ReplyTarget for BroadcastTarget {
    fn post(&self, message: OutboundMessage) -> BridgeResult<()> {
        let text = serde_json::to_string(&message)?;
        self.cmd_tx
            .send(Command::Broadcast {
                msg: WsMsg::Text(text.into()),
            })
            .map_err(|_| BridgeError::ChannelClosed("broadcast".to_string()))
    }

    fn describe(&self) -> String {
        "all controllers".to_string()
    }
}

/// A plain WebSocket server feeding the bridge router.
pub struct WsServer {
    local_addr: SocketAddr,
    cmd_tx: UnboundedSender<Command>,
    peers: Peers,
    shutdown: CancellationToken,
    manager_task: JoinHandle<()>,
    accept_task: JoinHandle<()>,
}

impl WsServer {
    /// Binds `addr` and starts accepting. Decoded frames are pushed to `inbound`.
    pub async fn bind(
        addr: &str,
        inbound: mpsc::Sender<Envelope>,
        shutdown: CancellationToken,
    ) -> Result<Self, WsError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = shutdown.child_token();

        let (cmd_tx, cmd_rx) = unbounded_channel();
        let peers: Peers = Arc::new(DashMap::new());
        let manager_task = tokio::spawn(manager_loop(cmd_rx, peers.clone(), shutdown.clone()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            cmd_tx.clone(),
            inbound,
            shutdown.clone(),
        ));
        info!("bridge websocket listening on {}", local_addr);

        Ok(Self {
            local_addr,
            cmd_tx,
            peers,
            shutdown,
            manager_task,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn broadcast_target(&self) -> Source {
        Arc::new(BroadcastTarget {
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Closes every connection and waits for the background tasks.
    pub async fn shutdown(self) {
        info!("bridge websocket shutting down");
        self.shutdown.cancel();
        let _ = self.accept_task.await;
        let _ = self.manager_task.await;
    }
}

/// Owns the peer map; all sends go through here so a reply can never overtake
/// the registration of its connection.
async fn manager_loop(
    mut cmd_rx: UnboundedReceiver<Command>,
    peers: Peers,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Register { peer, sender }) => {
                    peers.insert(peer, sender);
                }
                Some(Command::Unregister { peer }) => {
                    peers.remove(&peer);
                }
                Some(Command::Send { peer, msg }) => match peers.get(&peer) {
                    Some(tx) => {
                        let _ = tx.send(msg);
                    }
                    None => debug!("peer {} is gone, dropping frame", peer),
                },
                Some(Command::Broadcast { msg }) => {
                    for entry in peers.iter() {
                        let _ = entry.value().send(msg.clone());
                    }
                }
                None => break,
            }
        }
    }
    peers.clear();
}

async fn accept_loop(
    listener: TcpListener,
    cmd_tx: UnboundedSender<Command>,
    inbound: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(serve_connection(
                        stream,
                        addr.to_string(),
                        cmd_tx.clone(),
                        inbound.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(err) => warn!("accept failed: {}", err),
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: String,
    cmd_tx: UnboundedSender<Command>,
    inbound: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
) {
    let mut origin = None;
    let handshake = accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            origin = req
                .headers()
                .get("origin")
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            Ok(resp)
        },
    )
    .await;
    let ws = match handshake {
        Ok(ws) => ws,
        Err(err) => {
            warn!("websocket handshake with {} failed: {}", peer, err);
            return;
        }
    };

    let (mut write, mut read) = ws.split();
    let (tx_out, mut rx_out) = unbounded_channel();
    if cmd_tx
        .send(Command::Register {
            peer: peer.clone(),
            sender: tx_out,
        })
        .is_err()
    {
        return;
    }
    let source: Source = Arc::new(PeerTarget {
        peer: peer.clone(),
        cmd_tx: cmd_tx.clone(),
    });
    info!("controller {} connected (origin {:?})", peer, origin);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.send(WsMsg::Close(None)).await;
                break;
            }
            frame = read.next() => match frame {
                Some(Ok(WsMsg::Text(text))) => match serde_json::from_str::<Value>(text.as_str()) {
                    Ok(data) => {
                        let envelope = Envelope::new(data, origin.clone(), source.clone());
                        if inbound.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => debug!("ignoring non-json frame from {}: {}", peer, err),
                },
                Some(Ok(WsMsg::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("read from {} failed: {}", peer, err);
                    break;
                }
            },
            frame = rx_out.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = write.send(frame).await {
                        warn!("write to {} failed: {}", peer, err);
                        break;
                    }
                }
                None => break,
            }
        }
    }

    let _ = cmd_tx.send(Command::Unregister { peer: peer.clone() });
    info!("controller {} disconnected", peer);
}
