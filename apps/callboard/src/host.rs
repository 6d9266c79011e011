//! Notifications flowing out to the embedding application.

use std::fmt;

use tracing::info;

use crate::protocol::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ready,
    Streaming,
    Connected,
    Disconnected,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ready => "READY",
            Status::Streaming => "STREAMING",
            Status::Connected => "CONNECTED",
            Status::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by the host application to follow the session.
///
/// Callbacks run on the session actor; they must not block.
pub trait HostListener: Send + Sync {
    /// The relay assigned `local_id` to this participant.
    fn on_ready(&self, local_id: &str);
    fn on_incoming_call(&self, from: &PeerId);
    fn on_call_ended(&self, peer: &PeerId);
    fn on_status_changed(&self, status: Status);
}

/// Listener that only writes to the log; used by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHost;

impl HostListener for TracingHost {
    fn on_ready(&self, local_id: &str) {
        info!(local_id, "relay assigned local id");
    }

    fn on_incoming_call(&self, from: &PeerId) {
        info!(peer = %from, "incoming call");
    }

    fn on_call_ended(&self, peer: &PeerId) {
        info!(peer = %peer, "call ended");
    }

    fn on_status_changed(&self, status: Status) {
        info!(%status, "status changed");
    }
}
