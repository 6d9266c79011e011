//! Typed view of the signaling payloads exchanged with remote peers.
//!
//! Decoding never fails: the relay has no error channel, so a missing or
//! mistyped field decodes to its empty value and the caller carries on.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Opaque participant identifier assigned by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Closed set of signaling message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Init,
    Offer,
    Answer,
    Candidate,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [
        MessageKind::Init,
        MessageKind::Offer,
        MessageKind::Answer,
        MessageKind::Candidate,
    ];

    /// `None` for types this client does not understand.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "init" => Some(MessageKind::Init),
            "offer" => Some(MessageKind::Offer),
            "answer" => Some(MessageKind::Answer),
            "candidate" => Some(MessageKind::Candidate),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Init => "init",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Candidate => "candidate",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session description type in its canonical lowercase form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdpKind {
    Offer,
    PrAnswer,
    Answer,
    Rollback,
}

impl SdpKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "offer" => Some(SdpKind::Offer),
            "pranswer" => Some(SdpKind::PrAnswer),
            "answer" => Some(SdpKind::Answer),
            "rollback" => Some(SdpKind::Rollback),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::PrAnswer => "pranswer",
            SdpKind::Answer => "answer",
            SdpKind::Rollback => "rollback",
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }

    /// Decode `{type, sdp}`; an absent or unknown `type` falls back to
    /// `fallback`, an absent `sdp` to the empty string.
    pub fn from_payload(payload: Option<&Value>, fallback: SdpKind) -> Self {
        let kind = payload
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
            .and_then(SdpKind::parse)
            .unwrap_or(fallback);
        let sdp = payload
            .and_then(|p| p.get("sdp"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        Self::new(kind, sdp)
    }

    pub fn to_payload(&self) -> Value {
        json!({
            "type": self.kind.as_str(),
            "sdp": self.sdp,
        })
    }
}

/// ICE candidate as carried on the wire: `id` is the media stream id,
/// `label` the m-line index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub sdp_mid: String,
    pub sdp_mline_index: u16,
    pub candidate: String,
}

impl IceCandidate {
    pub fn new(sdp_mid: impl Into<String>, sdp_mline_index: u16, candidate: impl Into<String>) -> Self {
        Self {
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
            candidate: candidate.into(),
        }
    }

    pub fn from_payload(payload: Option<&Value>) -> Self {
        let field = |name: &str| payload.and_then(|p| p.get(name));
        let sdp_mid = field("id").and_then(Value::as_str).unwrap_or_default();
        let sdp_mline_index = field("label")
            .and_then(Value::as_u64)
            .and_then(|index| u16::try_from(index).ok())
            .unwrap_or(0);
        let candidate = field("candidate").and_then(Value::as_str).unwrap_or_default();
        Self::new(sdp_mid, sdp_mline_index, candidate)
    }

    pub fn to_payload(&self) -> Value {
        json!({
            "id": self.sdp_mid,
            "label": self.sdp_mline_index,
            "candidate": self.candidate,
        })
    }
}
