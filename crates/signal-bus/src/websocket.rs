use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{error::ProtocolError, Error as WsError, Message};
use tracing::{debug, trace, warn};
use url::Url;

use crate::{BusError, BusEvent, BusResult, InboundMessage, OutboundMessage, SignalTransport};

const EVENT_BUFFER: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// One relay frame: an event name plus its data, one JSON object per
/// WebSocket text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl RelayFrame {
    pub const ID: &'static str = "id";
    pub const MESSAGE: &'static str = "message";

    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Translate a frame received from the relay into a bus event; frames
    /// with unknown event names or unusable data yield `None`.
    pub fn into_bus_event(self) -> Option<BusEvent> {
        match self.event.as_str() {
            Self::ID => self
                .data
                .as_str()
                .map(|id| BusEvent::IdentityAssigned(id.to_string())),
            Self::MESSAGE => serde_json::from_value::<InboundMessage>(self.data)
                .ok()
                .map(BusEvent::Message),
            _ => None,
        }
    }
}

/// One live relay connection. `id` tells a reader task whether the link it
/// belongs to is still the current one.
struct Link {
    id: u64,
    outbound: mpsc::UnboundedSender<Message>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// WebSocket client for a JSON relay.
pub struct WsSignalTransport {
    url: Url,
    events: broadcast::Sender<BusEvent>,
    link: Arc<Mutex<Option<Link>>>,
    next_link_id: AtomicU64,
}

impl WsSignalTransport {
    pub fn new(relay_url: &str) -> BusResult<Self> {
        Ok(Self {
            url: websocket_url(relay_url)?,
            events: broadcast::channel(EVENT_BUFFER).0,
            link: Arc::new(Mutex::new(None)),
            next_link_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().is_some()
    }

    fn queue_frame(&self, frame: RelayFrame) -> BusResult<()> {
        let guard = self.link.lock();
        let Some(link) = guard.as_ref() else {
            return Err(BusError::NotConnected);
        };
        let text = serde_json::to_string(&frame)
            .map_err(|err| BusError::Transport(format!("encode relay frame: {err}")))?;
        link.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| BusError::Closed)
    }
}

#[async_trait]
impl SignalTransport for WsSignalTransport {
    async fn connect(&self) -> BusResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| BusError::Transport(format!("websocket connect failed: {err}")))?;

        // Held until the link is stored; a reader only clears its own link.
        let mut current = self.link.lock();
        if current.is_some() {
            debug!(url = %self.url, "relay connected concurrently; dropping extra socket");
            return Ok(());
        }
        debug!(url = %self.url, "relay websocket connected");
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_write.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let events = self.events.clone();
        let link = Arc::clone(&self.link);
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text.to_string(),
                    Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                        Ok(text) => text.to_string(),
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!("relay websocket closed: {err}");
                            }
                            _ => warn!("relay websocket error: {err}"),
                        }
                        break;
                    }
                };
                trace!(len = text.len(), "relay frame in");
                let Ok(frame) = serde_json::from_str::<RelayFrame>(&text) else {
                    debug!("ignoring undecodable relay frame");
                    continue;
                };
                match frame.into_bus_event() {
                    Some(event) => {
                        let _ = events.send(event);
                    }
                    None => trace!("ignoring relay frame without a bus mapping"),
                }
            }
            let stale = {
                let mut guard = link.lock();
                if guard.as_ref().is_some_and(|current| current.id == id) {
                    guard.take()
                } else {
                    None
                }
            };
            // Dropping the sender ends the writer.
            drop(stale);
            let _ = events.send(BusEvent::Disconnected);
        });

        *current = Some(Link {
            id,
            outbound: send_tx,
            writer,
            reader,
        });
        drop(current);
        let _ = self.events.send(BusEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        let link = self.link.lock().take();
        let Some(Link {
            outbound,
            mut writer,
            reader,
            ..
        }) = link
        else {
            return Ok(());
        };
        let _ = outbound.send(Message::Close(None));
        drop(outbound);
        if timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            debug!(url = %self.url, "relay close frame not flushed in time");
            writer.abort();
        }
        reader.abort();
        debug!(url = %self.url, "relay websocket disconnected");
        Ok(())
    }

    fn send(&self, message: OutboundMessage) -> BusResult<()> {
        let data = serde_json::to_value(&message)
            .map_err(|err| BusError::Transport(format!("encode message: {err}")))?;
        self.queue_frame(RelayFrame::new(RelayFrame::MESSAGE, data))
    }

    fn emit(&self, event: &str, data: Value) -> BusResult<()> {
        self.queue_frame(RelayFrame::new(event, data))
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }
}

impl Drop for WsSignalTransport {
    fn drop(&mut self) {
        if let Some(link) = self.link.lock().take() {
            link.writer.abort();
            link.reader.abort();
        }
    }
}

/// Accept `ws`, `wss`, `http` and `https` relay URLs; http(s) map onto ws(s).
fn websocket_url(relay_url: &str) -> BusResult<Url> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| BusError::Transport(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(BusError::Transport(format!(
                "unsupported relay url scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| BusError::Transport("invalid websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    /// Relay that counts accepted sockets and closes each right after the
    /// handshake.
    async fn closing_relay() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                    let _ = ws.close(None).await;
                }
            }
        });
        (format!("ws://{addr}/"), accepted)
    }

    /// Relay that reports every close frame it receives from a client.
    async fn recording_relay() -> (String, mpsc::UnboundedReceiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let closed_tx = closed_tx.clone();
                tokio::spawn(async move {
                    while let Some(Ok(message)) = ws.next().await {
                        if matches!(message, Message::Close(_)) {
                            let _ = closed_tx.send(());
                            break;
                        }
                    }
                });
            }
        });
        (format!("ws://{addr}/"), closed_rx)
    }

    async fn wait_for_disconnect(events: &mut broadcast::Receiver<BusEvent>) {
        timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(BusEvent::Disconnected) => return,
                    Ok(_) => continue,
                    Err(err) => panic!("event stream ended: {err}"),
                }
            }
        })
        .await
        .expect("disconnect event");
    }

    #[test]
    fn http_urls_map_to_websocket_schemes() {
        assert_eq!(
            websocket_url("http://relay.local:3000/").expect("url").as_str(),
            "ws://relay.local:3000/"
        );
        assert_eq!(
            websocket_url("https://relay.local/signal#x").expect("url").as_str(),
            "wss://relay.local/signal"
        );
        assert!(websocket_url("ftp://relay.local").is_err());
    }

    #[test]
    fn id_frame_assigns_identity() {
        let frame: RelayFrame =
            serde_json::from_str(r#"{"event":"id","data":"r0Z049NKJF"}"#).expect("decode");
        assert_eq!(
            frame.into_bus_event(),
            Some(BusEvent::IdentityAssigned("r0Z049NKJF".into()))
        );
    }

    #[test]
    fn message_frame_carries_inbound_message() {
        let frame = RelayFrame::new(
            RelayFrame::MESSAGE,
            json!({"from": "peer", "type": "answer", "payload": {"type": "answer", "sdp": "v=0"}}),
        );
        assert_eq!(
            frame.into_bus_event(),
            Some(BusEvent::Message(InboundMessage::new(
                "peer",
                "answer",
                Some(json!({"type": "answer", "sdp": "v=0"}))
            )))
        );
    }

    #[test]
    fn unknown_events_have_no_mapping() {
        assert_eq!(RelayFrame::new("presence", json!({})).into_bus_event(), None);
        assert_eq!(RelayFrame::new(RelayFrame::ID, json!(42)).into_bus_event(), None);
    }

    #[test]
    fn send_before_connect_is_rejected() {
        let transport = WsSignalTransport::new("ws://127.0.0.1:9/").expect("transport");
        assert!(matches!(
            transport.send(OutboundMessage::new("x", "init", Value::Null)),
            Err(BusError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn reconnects_after_relay_closes_socket() {
        let (url, accepted) = closing_relay().await;
        let transport = WsSignalTransport::new(&url).expect("transport");
        let mut events = transport.subscribe();

        transport.connect().await.expect("first connect");
        wait_for_disconnect(&mut events).await;
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.emit("readyToStream", json!({"name": "x"})),
            Err(BusError::NotConnected)
        ));

        transport.connect().await.expect("second connect");
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        wait_for_disconnect(&mut events).await;
    }

    #[tokio::test]
    async fn disconnect_delivers_close_frame() {
        let (url, mut closed) = recording_relay().await;
        let transport = WsSignalTransport::new(&url).expect("transport");

        transport.connect().await.expect("connect");
        assert!(transport.is_connected());
        transport.disconnect().await.expect("disconnect");
        assert!(!transport.is_connected());

        timeout(WAIT, closed.recv())
            .await
            .expect("relay saw close in time")
            .expect("close frame");
        transport.disconnect().await.expect("second disconnect is a no-op");
    }
}
