//! Relay-facing side of the signaling layer.
//!
//! A relay forwards opaque JSON messages between participants keyed by their
//! id. This crate defines the message envelopes that travel over it, the
//! [`SignalTransport`] port the session controller talks to, and two
//! implementations: an in-memory [`LocalRelay`] and a WebSocket client
//! ([`WsSignalTransport`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

mod local;
mod websocket;

pub use local::{LocalEndpoint, LocalRelay};
pub use websocket::{RelayFrame, WsSignalTransport};

/// Message handed to the relay for delivery to `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl OutboundMessage {
    pub fn new(to: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            to: to.into(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Message delivered by the relay, stamped with the sender id.
///
/// Every field is optional on the wire; absent fields decode to empty values
/// so a malformed frame never aborts the receive loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub from: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl InboundMessage {
    pub fn new(from: impl Into<String>, kind: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            from: from.into(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Lifecycle and delivery events emitted by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Connected,
    Disconnected,
    /// The relay told us which id other participants reach us by.
    IdentityAssigned(String),
    Message(InboundMessage),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("transport not connected")]
    NotConnected,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Bidirectional message channel to the relay.
///
/// `send` and `emit` are fire-and-forget: a successful return only means the
/// message was queued, never that it was delivered.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn connect(&self) -> BusResult<()>;
    async fn disconnect(&self) -> BusResult<()>;
    fn send(&self, message: OutboundMessage) -> BusResult<()>;
    /// Relay-level event outside the peer message flow (e.g. `readyToStream`).
    fn emit(&self, event: &str, data: Value) -> BusResult<()>;
    fn subscribe(&self) -> broadcast::Receiver<BusEvent>;
}
