//! Port to the media negotiation engine.
//!
//! One [`CapabilitySession`] per remote peer. Request/response calls are
//! async methods; engine-initiated callbacks (candidates, connectivity,
//! remote streams) are pushed through the [`PeerEvents`] handle the session
//! was opened with.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CapabilityError;
use crate::media::LocalStream;
use crate::protocol::{IceCandidate, PeerId, SessionDescription};

pub mod mock;
pub mod webrtc;

/// ICE connectivity as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// The transport could not be established or was lost.
    pub fn is_terminal_negative(self) -> bool {
        matches!(
            self,
            ConnectivityState::Disconnected | ConnectivityState::Failed | ConnectivityState::Closed
        )
    }

    pub fn is_connected(self) -> bool {
        matches!(self, ConnectivityState::Connected | ConnectivityState::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityEvent {
    LocalCandidate(IceCandidate),
    ConnectivityChanged(ConnectivityState),
    RemoteStreamAdded(String),
    RemoteStreamRemoved(String),
}

/// A callback tagged with the registration it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub peer: PeerId,
    pub generation: u64,
    pub event: CapabilityEvent,
}

/// Callback sink handed to a capability session; bound to one peer
/// registration.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    peer: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEvents {
    pub fn new(peer: PeerId, generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(CapabilityEvent::LocalCandidate(candidate));
    }

    pub fn connectivity_changed(&self, state: ConnectivityState) {
        self.emit(CapabilityEvent::ConnectivityChanged(state));
    }

    pub fn remote_stream_added(&self, label: impl Into<String>) {
        self.emit(CapabilityEvent::RemoteStreamAdded(label.into()));
    }

    pub fn remote_stream_removed(&self, label: impl Into<String>) {
        self.emit(CapabilityEvent::RemoteStreamRemoved(label.into()));
    }

    fn emit(&self, event: CapabilityEvent) {
        // The session actor may already be gone during shutdown.
        let _ = self.tx.send(PeerEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            event,
        });
    }
}

/// One negotiation context with one remote peer.
#[async_trait]
pub trait CapabilitySession: Send + Sync {
    /// Produce a local offer. The caller sends and commits it.
    async fn create_offer(&self) -> Result<SessionDescription, CapabilityError>;
    /// Produce a local answer to the current remote offer.
    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CapabilityError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CapabilityError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CapabilityError>;
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), CapabilityError>;
    async fn close(&self) -> Result<(), CapabilityError>;
}

/// Opens capability sessions; one call per peer registration.
#[async_trait]
pub trait CapabilityFactory: Send + Sync {
    async fn open(
        &self,
        peer: &PeerId,
        events: PeerEvents,
    ) -> Result<Box<dyn CapabilitySession>, CapabilityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_negative_states() {
        use ConnectivityState::*;
        let terminal: Vec<_> = [New, Checking, Connected, Completed, Disconnected, Failed, Closed]
            .into_iter()
            .filter(|s| s.is_terminal_negative())
            .collect();
        assert_eq!(terminal, vec![Disconnected, Failed, Closed]);
        assert!(Completed.is_connected());
        assert!(!Checking.is_connected());
    }

    #[test]
    fn peer_events_carry_peer_and_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = PeerEvents::new(PeerId::from("x"), 7, tx);
        events.connectivity_changed(ConnectivityState::Failed);
        let received = rx.try_recv().expect("event queued");
        assert_eq!(
            received,
            PeerEvent {
                peer: PeerId::from("x"),
                generation: 7,
                event: CapabilityEvent::ConnectivityChanged(ConnectivityState::Failed),
            }
        );
    }
}
