use signal_bus::BusError;
use thiserror::Error;

use crate::protocol::PeerId;

/// Failures reported by a capability (media negotiation) engine.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability engine failure: {0}")]
    Engine(String),
    #[error("capability session closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("no free peer slot (capacity {capacity})")]
    CapacityExceeded { capacity: usize },
    #[error("peer {0} is already registered")]
    DuplicatePeer(PeerId),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("signaling transport error: {0}")]
    Transport(#[from] BusError),
    #[error("local media unavailable: {0}")]
    Media(String),
    #[error("session controller stopped")]
    Stopped,
}
