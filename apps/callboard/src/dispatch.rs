//! Routes inbound signaling messages and capability callbacks onto peers.
//!
//! Each message kind maps to a planner: a pure function from the registry
//! and the inbound payload to a list of [`Effect`]s. The [`Dispatcher`]
//! executes those effects in order against the addressed peer and stops at
//! the first one that fails.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use signal_bus::{InboundMessage, SignalTransport};
use tracing::{debug, info, trace, warn};

use crate::capability::{CapabilityEvent, PeerEvent};
use crate::error::SignalError;
use crate::host::{HostListener, Status};
use crate::media::LocalStream;
use crate::negotiation::{self, ConnectivityOutcome};
use crate::protocol::{IceCandidate, MessageKind, PeerId, SdpKind, SessionDescription};
use crate::registry::{PeerRegistry, PeerSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    CreateOffer,
    SetRemoteDescription(SessionDescription),
    CreateAnswer,
    AddCandidate(IceCandidate),
    /// Candidate arrived before any remote description; not buffered.
    DropStaleCandidate(IceCandidate),
}

pub type Planner = fn(&PeerRegistry, &PeerId, Option<&Value>) -> Vec<Effect>;

fn plan_init(_: &PeerRegistry, _: &PeerId, _: Option<&Value>) -> Vec<Effect> {
    vec![Effect::CreateOffer]
}

fn plan_offer(_: &PeerRegistry, _: &PeerId, payload: Option<&Value>) -> Vec<Effect> {
    vec![
        Effect::SetRemoteDescription(SessionDescription::from_payload(payload, SdpKind::Offer)),
        Effect::CreateAnswer,
    ]
}

fn plan_answer(_: &PeerRegistry, _: &PeerId, payload: Option<&Value>) -> Vec<Effect> {
    vec![Effect::SetRemoteDescription(SessionDescription::from_payload(
        payload,
        SdpKind::Answer,
    ))]
}

fn plan_candidate(registry: &PeerRegistry, peer: &PeerId, payload: Option<&Value>) -> Vec<Effect> {
    let candidate = IceCandidate::from_payload(payload);
    let ready = registry
        .lookup(peer)
        .is_some_and(|peer| peer.negotiation().has_remote_description());
    if ready {
        vec![Effect::AddCandidate(candidate)]
    } else {
        vec![Effect::DropStaleCandidate(candidate)]
    }
}

/// Message kind to planner, fixed at construction.
pub struct CommandTable {
    planners: HashMap<MessageKind, Planner>,
}

impl CommandTable {
    pub fn standard() -> Self {
        let mut planners: HashMap<MessageKind, Planner> = HashMap::new();
        planners.insert(MessageKind::Init, plan_init);
        planners.insert(MessageKind::Offer, plan_offer);
        planners.insert(MessageKind::Answer, plan_answer);
        planners.insert(MessageKind::Candidate, plan_candidate);
        Self { planners }
    }

    pub fn planner(&self, kind: MessageKind) -> Option<Planner> {
        self.planners.get(&kind).copied()
    }

    pub fn plan(
        &self,
        kind: MessageKind,
        registry: &PeerRegistry,
        peer: &PeerId,
        payload: Option<&Value>,
    ) -> Vec<Effect> {
        self.planner(kind)
            .map(|planner| planner(registry, peer, payload))
            .unwrap_or_default()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched {
        peer: PeerId,
        kind: MessageKind,
        /// The message registered a new peer.
        registered: bool,
    },
    DroppedAtCapacity,
    UnknownType,
    Malformed,
    Failed {
        peer: PeerId,
        kind: MessageKind,
    },
}

pub struct Dispatcher {
    registry: PeerRegistry,
    table: CommandTable,
    transport: Arc<dyn SignalTransport>,
    host: Arc<dyn HostListener>,
    local_stream: Option<LocalStream>,
}

impl Dispatcher {
    pub fn new(
        registry: PeerRegistry,
        transport: Arc<dyn SignalTransport>,
        host: Arc<dyn HostListener>,
    ) -> Self {
        Self {
            registry,
            table: CommandTable::standard(),
            transport,
            host,
            local_stream: None,
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Stream attached to every peer registered from now on.
    pub fn set_local_stream(&mut self, stream: LocalStream) {
        self.local_stream = Some(stream);
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local_stream.as_ref()
    }

    pub async fn dispatch(&mut self, message: InboundMessage) -> DispatchOutcome {
        let from = PeerId::new(message.from);
        if from.is_empty() {
            warn!(kind = %message.kind, "dropping message without sender");
            return DispatchOutcome::Malformed;
        }
        let Some(kind) = MessageKind::parse(&message.kind) else {
            debug!(peer = %from, kind = %message.kind, "ignoring unknown message type");
            return DispatchOutcome::UnknownType;
        };
        if self.table.planner(kind).is_none() {
            return DispatchOutcome::UnknownType;
        }

        let mut registered = false;
        if self.registry.lookup(&from).is_none() {
            let Some(slot) = self.registry.find_free_slot() else {
                info!(peer = %from, %kind, capacity = self.registry.capacity(), "at capacity, dropping message");
                return DispatchOutcome::DroppedAtCapacity;
            };
            if let Err(err) = self.admit(from.clone(), slot).await {
                warn!(peer = %from, %kind, error = %err, "failed to register peer");
                return DispatchOutcome::Failed { peer: from, kind };
            }
            registered = true;
        }

        let effects = self
            .table
            .plan(kind, &self.registry, &from, message.payload.as_ref());
        match self.execute(&from, effects).await {
            Ok(()) => DispatchOutcome::Dispatched {
                peer: from,
                kind,
                registered,
            },
            Err(err) => {
                warn!(peer = %from, %kind, error = %err, "signaling step failed");
                DispatchOutcome::Failed { peer: from, kind }
            }
        }
    }

    async fn admit(&mut self, id: PeerId, slot: usize) -> Result<(), SignalError> {
        let peer = self.registry.register(id.clone(), slot).await?;
        if let Some(stream) = self.local_stream.as_ref() {
            if let Err(err) = peer.session().add_local_stream(stream).await {
                warn!(peer = %id, error = %err, "failed to attach local stream");
            }
        }
        self.host.on_incoming_call(&id);
        Ok(())
    }

    async fn execute(&mut self, id: &PeerId, effects: Vec<Effect>) -> Result<(), SignalError> {
        for effect in effects {
            let Some(peer) = self.registry.lookup_mut(id) else {
                return Ok(());
            };
            match effect {
                Effect::CreateOffer => {
                    let offer = peer.session().create_offer().await?;
                    negotiation::on_local_description(peer, offer, self.transport.as_ref()).await?;
                }
                Effect::CreateAnswer => {
                    let answer = peer.session().create_answer().await?;
                    negotiation::on_local_description(peer, answer, self.transport.as_ref()).await?;
                }
                Effect::SetRemoteDescription(desc) => {
                    negotiation::apply_remote_description(peer, desc).await?;
                }
                Effect::AddCandidate(candidate) => {
                    peer.session().add_ice_candidate(candidate).await?;
                    trace!(peer = %id, "remote candidate added");
                }
                Effect::DropStaleCandidate(candidate) => {
                    debug!(peer = %id, mid = %candidate.sdp_mid, "candidate before remote description, dropped");
                }
            }
        }
        Ok(())
    }

    /// Apply one engine callback. Callbacks for unknown peers or for an
    /// earlier registration of the same id are ignored.
    pub async fn on_capability_event(&mut self, event: PeerEvent) {
        let Some(peer) = self.registry.lookup_mut(&event.peer) else {
            trace!(peer = %event.peer, "callback for unregistered peer ignored");
            return;
        };
        if peer.generation() != event.generation {
            trace!(
                peer = %event.peer,
                current = peer.generation(),
                stale = event.generation,
                "stale callback ignored"
            );
            return;
        }

        match event.event {
            CapabilityEvent::LocalCandidate(candidate) => {
                if let Err(err) =
                    negotiation::on_local_candidate(peer, &candidate, self.transport.as_ref())
                {
                    warn!(peer = %event.peer, error = %err, "failed to send local candidate");
                }
            }
            CapabilityEvent::ConnectivityChanged(state) => {
                debug!(peer = %event.peer, ?state, "connectivity changed");
                let outcome = peer.negotiation_mut().connectivity_changed(state);
                match outcome {
                    ConnectivityOutcome::Lost => self.teardown(&event.peer).await,
                    ConnectivityOutcome::BecameConnected => {
                        info!(peer = %event.peer, "peer connected");
                        self.host.on_status_changed(Status::Connected);
                    }
                    ConnectivityOutcome::Unchanged => {}
                }
            }
            CapabilityEvent::RemoteStreamAdded(label) => {
                info!(peer = %event.peer, %label, "remote stream added");
            }
            CapabilityEvent::RemoteStreamRemoved(label) => {
                info!(peer = %event.peer, %label, "remote stream removed");
                peer.negotiation_mut().terminate();
                self.teardown(&event.peer).await;
            }
        }
    }

    async fn teardown(&mut self, id: &PeerId) {
        if self.registry.unregister(id).await.is_some() {
            self.host.on_status_changed(Status::Disconnected);
            self.host.on_call_ended(id);
        }
    }

    /// Close every peer and forget the local stream.
    pub async fn shutdown(&mut self) -> Vec<PeerSnapshot> {
        let removed = self.registry.close_all().await;
        for peer in &removed {
            self.host.on_call_ended(&peer.id);
        }
        self.local_stream = None;
        removed
    }
}
