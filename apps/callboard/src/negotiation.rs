//! Per-peer negotiation state and the steps that advance it.

use std::fmt;

use serde::Serialize;
use signal_bus::{OutboundMessage, SignalTransport};
use tracing::{debug, trace};

use crate::capability::ConnectivityState;
use crate::error::SignalError;
use crate::protocol::{IceCandidate, MessageKind, SdpKind, SessionDescription};
use crate::registry::Peer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Created,
    HaveLocalOffer,
    HaveRemoteOffer,
    Negotiating,
    Connected,
    Disconnected,
}

impl NegotiationState {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Created => "created",
            NegotiationState::HaveLocalOffer => "have_local_offer",
            NegotiationState::HaveRemoteOffer => "have_remote_offer",
            NegotiationState::Negotiating => "negotiating",
            NegotiationState::Connected => "connected",
            NegotiationState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a connectivity report means for the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityOutcome {
    Unchanged,
    BecameConnected,
    /// Terminal negative; the peer must be torn down.
    Lost,
}

/// The slice of negotiation state this layer tracks; the engine owns the
/// rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    state: NegotiationState,
    has_remote_description: bool,
    connectivity: Option<ConnectivityState>,
}

impl Default for Negotiation {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiation {
    pub fn new() -> Self {
        Self {
            state: NegotiationState::Created,
            has_remote_description: false,
            connectivity: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    pub fn connectivity(&self) -> Option<ConnectivityState> {
        self.connectivity
    }

    pub fn is_terminated(&self) -> bool {
        self.state == NegotiationState::Disconnected
    }

    pub fn local_description_sent(&mut self, kind: SdpKind) {
        if self.is_terminated() {
            return;
        }
        match kind {
            SdpKind::Offer => self.state = NegotiationState::HaveLocalOffer,
            SdpKind::Answer | SdpKind::PrAnswer => self.advance_to_negotiating(),
            SdpKind::Rollback => self.state = NegotiationState::Created,
        }
    }

    pub fn remote_description_applied(&mut self, kind: SdpKind) {
        if self.is_terminated() {
            return;
        }
        match kind {
            SdpKind::Offer => {
                self.has_remote_description = true;
                self.state = NegotiationState::HaveRemoteOffer;
            }
            SdpKind::Answer | SdpKind::PrAnswer => {
                self.has_remote_description = true;
                self.advance_to_negotiating();
            }
            SdpKind::Rollback => {
                self.has_remote_description = false;
                self.state = NegotiationState::Created;
            }
        }
    }

    pub fn connectivity_changed(&mut self, connectivity: ConnectivityState) -> ConnectivityOutcome {
        if self.is_terminated() {
            return ConnectivityOutcome::Unchanged;
        }
        self.connectivity = Some(connectivity);
        if connectivity.is_terminal_negative() {
            self.state = NegotiationState::Disconnected;
            ConnectivityOutcome::Lost
        } else if connectivity.is_connected() && self.state != NegotiationState::Connected {
            self.state = NegotiationState::Connected;
            ConnectivityOutcome::BecameConnected
        } else {
            ConnectivityOutcome::Unchanged
        }
    }

    /// Marks the peer terminated without a connectivity report, e.g. when
    /// its remote stream goes away.
    pub fn terminate(&mut self) -> bool {
        let was_live = !self.is_terminated();
        self.state = NegotiationState::Disconnected;
        was_live
    }

    fn advance_to_negotiating(&mut self) {
        // Connectivity can be reported before the answer is committed.
        if self.state != NegotiationState::Connected {
            self.state = NegotiationState::Negotiating;
        }
    }
}

/// Send a freshly produced local description to the peer, then commit it.
///
/// The send happens first so the description always precedes candidates
/// gathered against it.
pub async fn on_local_description(
    peer: &mut Peer,
    desc: SessionDescription,
    transport: &dyn SignalTransport,
) -> Result<(), SignalError> {
    let kind = desc.kind;
    transport.send(OutboundMessage::new(
        peer.id().as_str(),
        kind.as_str(),
        desc.to_payload(),
    ))?;
    debug!(peer = %peer.id(), %kind, "local description sent");
    peer.session().set_local_description(desc).await?;
    peer.negotiation_mut().local_description_sent(kind);
    Ok(())
}

/// Relay a locally gathered candidate, whatever the negotiation state.
pub fn on_local_candidate(
    peer: &Peer,
    candidate: &IceCandidate,
    transport: &dyn SignalTransport,
) -> Result<(), SignalError> {
    transport.send(OutboundMessage::new(
        peer.id().as_str(),
        MessageKind::Candidate.as_str(),
        candidate.to_payload(),
    ))?;
    trace!(peer = %peer.id(), mid = %candidate.sdp_mid, "local candidate sent");
    Ok(())
}

pub async fn apply_remote_description(
    peer: &mut Peer,
    desc: SessionDescription,
) -> Result<(), SignalError> {
    let kind = desc.kind;
    peer.session().set_remote_description(desc).await?;
    peer.negotiation_mut().remote_description_applied(kind);
    debug!(peer = %peer.id(), %kind, state = %peer.negotiation().state(), "remote description applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_path_reaches_connected() {
        let mut n = Negotiation::new();
        n.local_description_sent(SdpKind::Offer);
        assert_eq!(n.state(), NegotiationState::HaveLocalOffer);
        assert!(!n.has_remote_description());

        n.remote_description_applied(SdpKind::Answer);
        assert_eq!(n.state(), NegotiationState::Negotiating);
        assert!(n.has_remote_description());

        assert_eq!(
            n.connectivity_changed(ConnectivityState::Checking),
            ConnectivityOutcome::Unchanged
        );
        assert_eq!(
            n.connectivity_changed(ConnectivityState::Connected),
            ConnectivityOutcome::BecameConnected
        );
        assert_eq!(
            n.connectivity_changed(ConnectivityState::Completed),
            ConnectivityOutcome::Unchanged
        );
        assert_eq!(n.state(), NegotiationState::Connected);
    }

    #[test]
    fn callee_path_passes_through_have_remote_offer() {
        let mut n = Negotiation::new();
        n.remote_description_applied(SdpKind::Offer);
        assert_eq!(n.state(), NegotiationState::HaveRemoteOffer);
        n.local_description_sent(SdpKind::Answer);
        assert_eq!(n.state(), NegotiationState::Negotiating);
    }

    #[test]
    fn remote_rollback_clears_the_candidate_gate() {
        let mut n = Negotiation::new();
        n.remote_description_applied(SdpKind::Offer);
        n.remote_description_applied(SdpKind::Rollback);
        assert_eq!(n.state(), NegotiationState::Created);
        assert!(!n.has_remote_description());
    }

    #[test]
    fn failure_before_negotiation_is_terminal_and_reported_once() {
        let mut n = Negotiation::new();
        assert_eq!(
            n.connectivity_changed(ConnectivityState::Failed),
            ConnectivityOutcome::Lost
        );
        assert!(n.is_terminated());
        assert_eq!(
            n.connectivity_changed(ConnectivityState::Closed),
            ConnectivityOutcome::Unchanged
        );
        assert_eq!(
            n.connectivity_changed(ConnectivityState::Connected),
            ConnectivityOutcome::Unchanged
        );
        n.remote_description_applied(SdpKind::Offer);
        assert_eq!(n.state(), NegotiationState::Disconnected);
        assert!(!n.terminate());
    }
}
