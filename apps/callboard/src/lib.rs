//! Signaling orchestration for small multi-party WebRTC sessions.
//!
//! Inbound relay messages are dispatched onto a bounded registry of peers,
//! each tracking its own offer/answer negotiation. The media engine, the
//! relay and local capture are reached through the ports in
//! [`capability`], [`signal_bus`] and [`media`].

pub mod capability;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod media;
pub mod negotiation;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod telemetry;

pub use config::Config;
pub use error::{CapabilityError, SignalError};
pub use host::{HostListener, Status, TracingHost};
pub use protocol::{IceCandidate, MessageKind, PeerId, SdpKind, SessionDescription};
pub use registry::PeerSnapshot;
pub use session::SessionController;
