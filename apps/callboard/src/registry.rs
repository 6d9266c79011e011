//! Bounded registry of remote peers.
//!
//! A peer is present iff its capability session is open and its slot is
//! occupied; `register` and `unregister` keep the three in lockstep.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capability::{CapabilityFactory, CapabilitySession, PeerEvent, PeerEvents};
use crate::error::SignalError;
use crate::negotiation::{Negotiation, NegotiationState};
use crate::protocol::PeerId;

/// Fixed-size occupancy table; lowest free index wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTable {
    slots: Vec<bool>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![false; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|occupied| !occupied)
    }

    pub fn is_occupied(&self, slot: usize) -> bool {
        self.slots.get(slot).copied().unwrap_or(false)
    }

    /// Returns `false` if `slot` is out of range or already taken.
    pub fn occupy(&mut self, slot: usize) -> bool {
        match self.slots.get_mut(slot) {
            Some(occupied) if !*occupied => {
                *occupied = true;
                true
            }
            _ => false,
        }
    }

    pub fn release(&mut self, slot: usize) {
        if let Some(occupied) = self.slots.get_mut(slot) {
            *occupied = false;
        }
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|occupied| **occupied).count()
    }
}

pub struct Peer {
    id: PeerId,
    slot: usize,
    generation: u64,
    session: Box<dyn CapabilitySession>,
    negotiation: Negotiation,
}

impl Peer {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session(&self) -> &dyn CapabilitySession {
        self.session.as_ref()
    }

    pub fn negotiation(&self) -> &Negotiation {
        &self.negotiation
    }

    pub(crate) fn negotiation_mut(&mut self) -> &mut Negotiation {
        &mut self.negotiation
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            slot: self.slot,
            generation: self.generation,
            state: self.negotiation.state(),
            has_remote_description: self.negotiation.has_remote_description(),
        }
    }
}

/// Point-in-time view of a registered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub slot: usize,
    pub generation: u64,
    pub state: NegotiationState,
    pub has_remote_description: bool,
}

pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
    slots: SlotTable,
    factory: Arc<dyn CapabilityFactory>,
    events: mpsc::UnboundedSender<PeerEvent>,
    generation_counter: u64,
}

impl PeerRegistry {
    pub fn new(
        max_peers: usize,
        factory: Arc<dyn CapabilityFactory>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            peers: HashMap::with_capacity(max_peers),
            slots: SlotTable::new(max_peers),
            factory,
            events,
            generation_counter: 0,
        }
    }

    pub fn find_free_slot(&self) -> Option<usize> {
        self.slots.first_free()
    }

    /// Open a capability session for `id` and bind it to `slot`.
    ///
    /// On any failure the registry is left untouched.
    pub async fn register(&mut self, id: PeerId, slot: usize) -> Result<&mut Peer, SignalError> {
        if self.peers.contains_key(&id) {
            return Err(SignalError::DuplicatePeer(id));
        }
        if slot >= self.slots.capacity() || self.slots.is_occupied(slot) {
            return Err(SignalError::CapacityExceeded {
                capacity: self.slots.capacity(),
            });
        }

        let generation = self.generation_counter + 1;
        let events = PeerEvents::new(id.clone(), generation, self.events.clone());
        let session = self.factory.open(&id, events).await?;
        self.generation_counter = generation;

        self.slots.occupy(slot);
        info!(peer = %id, slot, generation, "peer registered");
        let peer = Peer {
            id: id.clone(),
            slot,
            generation,
            session,
            negotiation: Negotiation::new(),
        };
        Ok(self.peers.entry(id).or_insert(peer))
    }

    /// Close the peer's session and free its slot. Absent ids are a no-op.
    pub async fn unregister(&mut self, id: &PeerId) -> Option<PeerSnapshot> {
        let peer = self.peers.remove(id)?;
        self.slots.release(peer.slot);
        if let Err(err) = peer.session.close().await {
            warn!(peer = %id, error = %err, "capability session close failed");
        }
        info!(peer = %id, slot = peer.slot, "peer unregistered");
        Some(peer.snapshot())
    }

    pub fn lookup(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn lookup_mut(&mut self, id: &PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    /// Tear down every peer; returns what was removed, ordered by slot.
    pub async fn close_all(&mut self) -> Vec<PeerSnapshot> {
        let ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(snapshot) = self.unregister(&id).await {
                removed.push(snapshot);
            }
        }
        removed.sort_by_key(|snapshot| snapshot.slot);
        debug!(count = removed.len(), "registry cleared");
        removed
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn occupied_slots(&self) -> usize {
        self.slots.occupied()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<_> = self.peers.values().map(Peer::snapshot).collect();
        peers.sort_by_key(|snapshot| snapshot.slot);
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::mock::{MockCapabilities, MockOp};

    fn registry(max_peers: usize) -> (PeerRegistry, MockCapabilities) {
        let mock = MockCapabilities::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        (PeerRegistry::new(max_peers, Arc::new(mock.clone()), tx), mock)
    }

    fn assert_consistent(registry: &PeerRegistry) {
        assert_eq!(registry.occupied_slots(), registry.len());
        assert!(registry.len() <= registry.capacity());
    }

    #[test]
    fn slot_table_hands_out_lowest_index() {
        let mut table = SlotTable::new(3);
        assert!(table.occupy(0));
        assert!(table.occupy(2));
        assert_eq!(table.first_free(), Some(1));
        assert!(!table.occupy(2));
        assert!(!table.occupy(3));
        table.release(0);
        assert_eq!(table.first_free(), Some(0));
        assert_eq!(table.occupied(), 1);
    }

    #[tokio::test]
    async fn register_fills_slots_until_capacity() {
        let (mut registry, mock) = registry(2);
        let x = PeerId::from("x");
        let y = PeerId::from("y");

        let slot = registry.find_free_slot().expect("free slot");
        assert_eq!(registry.register(x.clone(), slot).await.expect("register x").slot(), 0);
        let slot = registry.find_free_slot().expect("free slot");
        assert_eq!(registry.register(y.clone(), slot).await.expect("register y").slot(), 1);

        assert_eq!(registry.find_free_slot(), None);
        assert_consistent(&registry);
        assert_eq!(mock.open_sessions(), vec![x.clone(), y.clone()]);

        let err = registry
            .register(PeerId::from("z"), 0)
            .await
            .err()
            .expect("slot 0 taken");
        assert!(matches!(err, SignalError::CapacityExceeded { capacity: 2 }));
        let err = registry.register(PeerId::from("z"), 5).await.err().expect("out of range");
        assert!(matches!(err, SignalError::CapacityExceeded { .. }));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (mut registry, _mock) = registry(2);
        registry.register(PeerId::from("x"), 0).await.expect("register");
        let err = registry.register(PeerId::from("x"), 1).await.err().expect("duplicate");
        assert!(matches!(err, SignalError::DuplicatePeer(_)));
        assert_consistent(&registry);
    }

    #[tokio::test]
    async fn unregister_frees_exactly_that_slot_and_is_idempotent() {
        let (mut registry, mock) = registry(2);
        let x = PeerId::from("x");
        registry.register(x.clone(), 0).await.expect("register x");
        registry.register(PeerId::from("y"), 1).await.expect("register y");

        let removed = registry.unregister(&x).await.expect("x was registered");
        assert_eq!(removed.slot, 0);
        assert_eq!(registry.find_free_slot(), Some(0));
        assert!(registry.lookup(&x).is_none());
        assert!(registry.unregister(&x).await.is_none());
        assert_consistent(&registry);
        assert_eq!(mock.open_sessions(), vec![PeerId::from("y")]);
    }

    #[tokio::test]
    async fn failed_session_open_leaves_registry_untouched() {
        let (mut registry, mock) = registry(2);
        mock.fail(MockOp::Open);
        let err = registry.register(PeerId::from("x"), 0).await.err().expect("open fails");
        assert!(matches!(err, SignalError::Capability(_)));
        assert!(registry.is_empty());
        assert_eq!(registry.find_free_slot(), Some(0));

        mock.clear_failures();
        let peer = registry.register(PeerId::from("x"), 0).await.expect("register");
        assert_eq!(peer.generation(), 1);
    }

    #[tokio::test]
    async fn generations_increase_across_registrations() {
        let (mut registry, _mock) = registry(1);
        let x = PeerId::from("x");
        let first = registry.register(x.clone(), 0).await.expect("register").generation();
        registry.unregister(&x).await;
        let second = registry.register(x.clone(), 0).await.expect("register").generation();
        assert!(second > first);
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let (mut registry, mock) = registry(2);
        registry.register(PeerId::from("b"), 1).await.expect("register");
        registry.register(PeerId::from("a"), 0).await.expect("register");
        let removed = registry.close_all().await;
        let slots: Vec<usize> = removed.iter().map(|p| p.slot).collect();
        assert_eq!(slots, vec![0, 1]);
        assert!(registry.is_empty());
        assert_eq!(registry.occupied_slots(), 0);
        assert!(mock.open_sessions().is_empty());
        assert!(registry.close_all().await.is_empty());
    }
}
