//! WebSocket transport for the bridge.
//!
//! Each controller connection is a peer. Text frames are decoded as JSON and
//! handed to the router as [`Envelope`](pilot_bridge::Envelope)s together with
//! the `Origin` header of the handshake. Replies go back through the peer
//! registry to the connection that sent the request.

pub mod client;
pub mod error;
pub mod server;

pub use client::BridgeClient;
pub use error::WsError;
pub use server::{BroadcastTarget, PeerTarget, WsServer};
