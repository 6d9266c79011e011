//! Top-level session lifecycle.
//!
//! [`SessionController::open`] spawns a single actor that owns the peer
//! registry. Relay events, capability callbacks and control commands are
//! all funnelled into it and handled one at a time, to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use signal_bus::{BusEvent, SignalTransport};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::capability::{CapabilityFactory, PeerEvent};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::SignalError;
use crate::host::{HostListener, Status};
use crate::media::{LocalStream, MediaSource};
use crate::registry::{PeerRegistry, PeerSnapshot};

/// Relay event announcing that this participant is streaming.
pub const READY_TO_STREAM_EVENT: &str = "readyToStream";

const COMMAND_BUFFER: usize = 32;

enum Command {
    Start {
        stream: LocalStream,
        reply: oneshot::Sender<()>,
    },
    Peers(oneshot::Sender<Vec<PeerSnapshot>>),
    Stop(oneshot::Sender<Vec<PeerSnapshot>>),
}

pub struct SessionController {
    commands: mpsc::Sender<Command>,
    transport: Arc<dyn SignalTransport>,
    media: Arc<dyn MediaSource>,
    stream_name: Option<String>,
    local_id: Arc<RwLock<Option<String>>>,
    actor: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SessionController {
    /// Wire the transport into a fresh actor and connect to the relay.
    pub async fn open(
        config: &Config,
        transport: Arc<dyn SignalTransport>,
        capabilities: Arc<dyn CapabilityFactory>,
        media: Arc<dyn MediaSource>,
        host: Arc<dyn HostListener>,
    ) -> Result<Self, SignalError> {
        // Subscribe before connecting so the identity assignment is not missed.
        let bus = transport.subscribe();
        let (events_tx, capability_events) = mpsc::unbounded_channel();
        let registry = PeerRegistry::new(config.max_peers, capabilities, events_tx);
        let dispatcher = Dispatcher::new(registry, Arc::clone(&transport), Arc::clone(&host));
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let local_id = Arc::new(RwLock::new(None));

        let actor = SessionActor {
            dispatcher,
            commands: command_rx,
            bus,
            capability_events,
            host,
            local_id: Arc::clone(&local_id),
        };
        let handle = tokio::spawn(actor.run());

        if let Err(err) = transport.connect().await {
            handle.abort();
            return Err(err.into());
        }
        info!(max_peers = config.max_peers, "session opened");

        Ok(Self {
            commands,
            transport,
            media,
            stream_name: config.stream_name.clone(),
            local_id,
            actor: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Acquire local media, attach it to every peer registered from now on,
    /// and announce readiness to the relay if a stream name is configured.
    pub async fn start(&self) -> Result<(), SignalError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SignalError::Stopped);
        }
        let stream = self.media.acquire().await?;
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Start { stream, reply })
            .await
            .map_err(|_| SignalError::Stopped)?;
        done.await.map_err(|_| SignalError::Stopped)?;

        if let Some(name) = self.stream_name.as_deref() {
            self.transport
                .emit(READY_TO_STREAM_EVENT, json!({ "name": name }))?;
            debug!(name, "announced stream to relay");
        }
        Ok(())
    }

    /// Close every peer, release local media and disconnect from the relay.
    ///
    /// Safe before `start` and safe to call more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Stop(reply)).await.is_ok() {
            if let Ok(removed) = done.await {
                info!(peers = removed.len(), "session stopping");
            }
        }
        let handle = self.actor.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "session actor ended abnormally");
            }
        }
        self.media.release().await;
        if let Err(err) = self.transport.disconnect().await {
            warn!(error = %err, "relay disconnect failed");
        }
        info!("session stopped");
    }

    pub async fn peers(&self) -> Result<Vec<PeerSnapshot>, SignalError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Peers(reply))
            .await
            .map_err(|_| SignalError::Stopped)?;
        done.await.map_err(|_| SignalError::Stopped)
    }

    /// Id the relay assigned to us, once known.
    pub fn local_id(&self) -> Option<String> {
        self.local_id.read().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(handle) = self.actor.lock().take() {
            handle.abort();
        }
    }
}

struct SessionActor {
    dispatcher: Dispatcher,
    commands: mpsc::Receiver<Command>,
    bus: broadcast::Receiver<BusEvent>,
    capability_events: mpsc::UnboundedReceiver<PeerEvent>,
    host: Arc<dyn HostListener>,
    local_id: Arc<RwLock<Option<String>>>,
}

impl SessionActor {
    async fn run(mut self) {
        let mut bus_open = true;
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Stop(reply)) => {
                        let removed = self.dispatcher.shutdown().await;
                        let _ = reply.send(removed);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.dispatcher.shutdown().await;
                        break;
                    }
                },
                event = self.bus.recv(), if bus_open => match event {
                    Ok(event) => self.handle_bus_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "relay events dropped, receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("relay event stream closed");
                        bus_open = false;
                    }
                },
                Some(event) = self.capability_events.recv() => {
                    self.dispatcher.on_capability_event(event).await;
                }
            }
        }
        debug!("session actor exited");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { stream, reply } => {
                info!(label = %stream.label, tracks = stream.tracks.len(), "local stream ready");
                self.dispatcher.set_local_stream(stream);
                self.host.on_status_changed(Status::Streaming);
                let _ = reply.send(());
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.dispatcher.registry().snapshot());
            }
            Command::Stop(_) => {}
        }
    }

    async fn handle_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Connected => info!("connected to relay"),
            BusEvent::Disconnected => {
                warn!(peers = self.dispatcher.registry().len(), "relay connection lost");
            }
            BusEvent::IdentityAssigned(id) => {
                info!(local_id = %id, "relay assigned identity");
                *self.local_id.write() = Some(id.clone());
                self.host.on_ready(&id);
                self.host.on_status_changed(Status::Ready);
            }
            BusEvent::Message(message) => {
                let outcome = self.dispatcher.dispatch(message).await;
                trace!(?outcome, "inbound message handled");
            }
        }
    }
}
