//! Recording capability engine for tests and dry runs.
//!
//! Every call is appended to a shared log; engine callbacks are driven by
//! the test through [`MockCapabilities::events_for`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CapabilityFactory, CapabilitySession, PeerEvents};
use crate::error::CapabilityError;
use crate::media::LocalStream;
use crate::protocol::{IceCandidate, PeerId, SdpKind, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Open(PeerId),
    CreateOffer(PeerId),
    CreateAnswer(PeerId),
    SetLocalDescription(PeerId, SessionDescription),
    SetRemoteDescription(PeerId, SessionDescription),
    AddIceCandidate(PeerId, IceCandidate),
    AddLocalStream(PeerId, String),
    Close(PeerId),
}

impl MockCall {
    pub fn peer(&self) -> &PeerId {
        match self {
            MockCall::Open(peer)
            | MockCall::CreateOffer(peer)
            | MockCall::CreateAnswer(peer)
            | MockCall::SetLocalDescription(peer, _)
            | MockCall::SetRemoteDescription(peer, _)
            | MockCall::AddIceCandidate(peer, _)
            | MockCall::AddLocalStream(peer, _)
            | MockCall::Close(peer) => peer,
        }
    }
}

/// Operations that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Open,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    events: HashMap<PeerId, PeerEvents>,
    open: HashSet<PeerId>,
    failing: HashSet<MockOp>,
    descriptions: u64,
}

impl MockState {
    fn check(&self, op: MockOp) -> Result<(), CapabilityError> {
        if self.failing.contains(&op) {
            return Err(CapabilityError::Engine(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn next_description(&mut self, peer: &PeerId, kind: SdpKind) -> SessionDescription {
        self.descriptions += 1;
        let sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=mock-{}-{}\r\nt=0 0\r\n",
            self.descriptions, kind, peer
        );
        SessionDescription::new(kind, sdp)
    }
}

#[derive(Clone, Default)]
pub struct MockCapabilities {
    state: Arc<Mutex<MockState>>,
}

impl MockCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn calls_for(&self, peer: &PeerId) -> Vec<MockCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.peer() == peer)
            .cloned()
            .collect()
    }

    /// Callback sink of the most recent session opened for `peer`, even if
    /// that session has since been closed.
    pub fn events_for(&self, peer: &PeerId) -> Option<PeerEvents> {
        self.state.lock().events.get(peer).cloned()
    }

    /// Peers with a live (opened, not yet closed) session, sorted.
    pub fn open_sessions(&self) -> Vec<PeerId> {
        let mut open: Vec<_> = self.state.lock().open.iter().cloned().collect();
        open.sort();
        open
    }

    pub fn fail(&self, op: MockOp) {
        self.state.lock().failing.insert(op);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }
}

#[async_trait]
impl CapabilityFactory for MockCapabilities {
    async fn open(
        &self,
        peer: &PeerId,
        events: PeerEvents,
    ) -> Result<Box<dyn CapabilitySession>, CapabilityError> {
        let mut state = self.state.lock();
        state.check(MockOp::Open)?;
        state.calls.push(MockCall::Open(peer.clone()));
        state.events.insert(peer.clone(), events);
        state.open.insert(peer.clone());
        Ok(Box::new(MockSession {
            peer: peer.clone(),
            state: self.state.clone(),
        }))
    }
}

struct MockSession {
    peer: PeerId,
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    fn record(&self, op: Option<MockOp>, call: MockCall) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        if !state.open.contains(&self.peer) {
            return Err(CapabilityError::Closed);
        }
        if let Some(op) = op {
            state.check(op)?;
        }
        state.calls.push(call);
        Ok(())
    }

    fn describe(&self, op: MockOp, kind: SdpKind) -> Result<SessionDescription, CapabilityError> {
        let call = match op {
            MockOp::CreateOffer => MockCall::CreateOffer(self.peer.clone()),
            _ => MockCall::CreateAnswer(self.peer.clone()),
        };
        self.record(Some(op), call)?;
        Ok(self.state.lock().next_description(&self.peer, kind))
    }
}

#[async_trait]
impl CapabilitySession for MockSession {
    async fn create_offer(&self) -> Result<SessionDescription, CapabilityError> {
        self.describe(MockOp::CreateOffer, SdpKind::Offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError> {
        self.describe(MockOp::CreateAnswer, SdpKind::Answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CapabilityError> {
        self.record(
            Some(MockOp::SetLocalDescription),
            MockCall::SetLocalDescription(self.peer.clone(), desc),
        )
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CapabilityError> {
        self.record(
            Some(MockOp::SetRemoteDescription),
            MockCall::SetRemoteDescription(self.peer.clone(), desc),
        )
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CapabilityError> {
        self.record(
            Some(MockOp::AddIceCandidate),
            MockCall::AddIceCandidate(self.peer.clone(), candidate),
        )
    }

    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), CapabilityError> {
        self.record(None, MockCall::AddLocalStream(self.peer.clone(), stream.label.clone()))
    }

    async fn close(&self) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        if state.open.remove(&self.peer) {
            state.calls.push(MockCall::Close(self.peer.clone()));
        }
        Ok(())
    }
}
