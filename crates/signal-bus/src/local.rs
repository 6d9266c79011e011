use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::{BusError, BusEvent, BusResult, InboundMessage, OutboundMessage, SignalTransport};

const ENDPOINT_BUFFER: usize = 256;

/// In-memory relay for tests and single-process demos.
///
/// Each participant gets a [`LocalEndpoint`]; an endpoint only receives
/// messages while connected, mirroring a relay that forgets participants on
/// disconnect.
#[derive(Debug, Default, Clone)]
pub struct LocalRelay {
    inner: Arc<RelayInner>,
}

#[derive(Debug, Default)]
struct RelayInner {
    online: RwLock<HashMap<String, broadcast::Sender<BusEvent>>>,
}

impl RelayInner {
    fn route(&self, from: &str, message: OutboundMessage) {
        let target = self.online.read().get(&message.to).cloned();
        match target {
            Some(sender) => {
                let _ = sender.send(BusEvent::Message(InboundMessage {
                    from: from.to_string(),
                    kind: message.kind,
                    payload: Some(message.payload),
                }));
            }
            None => trace!(to = %message.to, "relay dropping message for offline participant"),
        }
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the endpoint a participant with `id` uses to reach the relay.
    pub fn endpoint(&self, id: impl Into<String>) -> LocalEndpoint {
        LocalEndpoint {
            id: id.into(),
            relay: Arc::clone(&self.inner),
            events: broadcast::channel(ENDPOINT_BUFFER).0,
            connected: AtomicBool::new(false),
            emitted: Mutex::new(Vec::new()),
        }
    }

    pub fn is_online(&self, id: &str) -> bool {
        self.inner.online.read().contains_key(id)
    }
}

#[derive(Debug)]
pub struct LocalEndpoint {
    id: String,
    relay: Arc<RelayInner>,
    events: broadcast::Sender<BusEvent>,
    connected: AtomicBool,
    emitted: Mutex<Vec<(String, Value)>>,
}

impl LocalEndpoint {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deliver `message` to this endpoint as if the relay had forwarded it.
    pub fn inject(&self, message: InboundMessage) {
        let _ = self.events.send(BusEvent::Message(message));
    }

    /// Relay-level events emitted so far, oldest first.
    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().clone()
    }
}

#[async_trait]
impl SignalTransport for LocalEndpoint {
    async fn connect(&self) -> BusResult<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.relay
            .online
            .write()
            .insert(self.id.clone(), self.events.clone());
        let _ = self.events.send(BusEvent::Connected);
        let _ = self.events.send(BusEvent::IdentityAssigned(self.id.clone()));
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.relay.online.write().remove(&self.id);
        let _ = self.events.send(BusEvent::Disconnected);
        Ok(())
    }

    fn send(&self, message: OutboundMessage) -> BusResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        self.relay.route(&self.id, message);
        Ok(())
    }

    fn emit(&self, event: &str, data: Value) -> BusResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        self.emitted.lock().push((event.to_string(), data));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn relay_forwards_between_connected_endpoints() {
        let relay = LocalRelay::new();
        let alice = relay.endpoint("alice");
        let bob = relay.endpoint("bob");
        let mut bob_events = bob.subscribe();
        alice.connect().await.expect("alice connects");
        bob.connect().await.expect("bob connects");

        assert_eq!(bob_events.recv().await.expect("connected"), BusEvent::Connected);
        assert_eq!(
            bob_events.recv().await.expect("identity"),
            BusEvent::IdentityAssigned("bob".into())
        );

        alice
            .send(OutboundMessage::new("bob", "offer", json!({"sdp": "v=0"})))
            .expect("send ok");
        let event = bob_events.recv().await.expect("message");
        assert_eq!(
            event,
            BusEvent::Message(InboundMessage::new("alice", "offer", Some(json!({"sdp": "v=0"}))))
        );
    }

    #[tokio::test]
    async fn offline_targets_are_dropped_silently() {
        let relay = LocalRelay::new();
        let alice = relay.endpoint("alice");
        alice.connect().await.expect("connect");
        alice
            .send(OutboundMessage::new("nobody", "init", Value::Null))
            .expect("fire and forget");
    }

    #[tokio::test]
    async fn send_requires_connection_and_disconnect_is_idempotent() {
        let relay = LocalRelay::new();
        let alice = relay.endpoint("alice");
        assert!(matches!(
            alice.send(OutboundMessage::new("bob", "init", Value::Null)),
            Err(BusError::NotConnected)
        ));
        alice.connect().await.expect("connect");
        assert!(relay.is_online("alice"));
        alice.disconnect().await.expect("first disconnect");
        alice.disconnect().await.expect("second disconnect");
        assert!(!relay.is_online("alice"));
    }

    #[tokio::test]
    async fn emit_records_relay_events() {
        let relay = LocalRelay::new();
        let alice = relay.endpoint("alice");
        alice.connect().await.expect("connect");
        alice
            .emit("readyToStream", json!({"name": "camera"}))
            .expect("emit");
        assert_eq!(
            alice.emitted(),
            vec![("readyToStream".to_string(), json!({"name": "camera"}))]
        );
    }
}
