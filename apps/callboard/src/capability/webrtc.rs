//! Capability engine backed by webrtc-rs: one `RTCPeerConnection` per peer.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{CapabilityFactory, CapabilitySession, ConnectivityState, PeerEvents};
use crate::error::CapabilityError;
use crate::media::{LocalStream, TrackKind};
use crate::protocol::{IceCandidate, PeerId, SdpKind, SessionDescription};

fn engine_error(err: webrtc::Error) -> CapabilityError {
    CapabilityError::Engine(err.to_string())
}

pub struct WebRtcCapabilities {
    api: API,
    rtc_config: RTCConfiguration,
}

impl WebRtcCapabilities {
    pub fn new(stun_servers: &[String]) -> Result<Self, CapabilityError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(engine_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }]
        };
        Ok(Self {
            api,
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl CapabilityFactory for WebRtcCapabilities {
    async fn open(
        &self,
        peer: &PeerId,
        events: PeerEvents,
    ) -> Result<Box<dyn CapabilitySession>, CapabilityError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(engine_error)?,
        );

        // Receive audio and video from every peer; `add_track` later turns
        // these transceivers into sendrecv.
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .map_err(engine_error)?;
        }

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.local_candidate(IceCandidate::new(
                        init.sdp_mid.unwrap_or_default(),
                        init.sdp_mline_index.unwrap_or(0),
                        init.candidate,
                    )),
                    Err(err) => warn!(peer = %events.peer(), error = %err, "failed to encode local candidate"),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                debug!(peer = %events.peer(), ?state, "ice connection state changed");
                if let Some(state) = map_connectivity(state) {
                    events.connectivity_changed(state);
                }
            })
        }));

        let track_events = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                events.remote_stream_added(track.stream_id().to_string());
            })
        }));

        trace!(peer = %peer, "peer connection opened");
        Ok(Box::new(WebRtcSession {
            peer: peer.clone(),
            pc,
        }))
    }
}

fn map_connectivity(state: RTCIceConnectionState) -> Option<ConnectivityState> {
    Some(match state {
        RTCIceConnectionState::New => ConnectivityState::New,
        RTCIceConnectionState::Checking => ConnectivityState::Checking,
        RTCIceConnectionState::Connected => ConnectivityState::Connected,
        RTCIceConnectionState::Completed => ConnectivityState::Completed,
        RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCIceConnectionState::Failed => ConnectivityState::Failed,
        RTCIceConnectionState::Closed => ConnectivityState::Closed,
        _ => return None,
    })
}

fn to_description(desc: RTCSessionDescription) -> Result<SessionDescription, CapabilityError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Pranswer => SdpKind::PrAnswer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => {
            return Err(CapabilityError::Engine(format!(
                "engine produced description of type {other}"
            )))
        }
    };
    Ok(SessionDescription::new(kind, desc.sdp))
}

fn from_description(desc: SessionDescription) -> Result<RTCSessionDescription, CapabilityError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).map_err(engine_error),
        SdpKind::PrAnswer => RTCSessionDescription::pranswer(desc.sdp).map_err(engine_error),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).map_err(engine_error),
        // No constructor exists for rollback; it carries no SDP to parse.
        SdpKind::Rollback => serde_json::from_value(json!({"type": "rollback", "sdp": ""}))
            .map_err(|err| CapabilityError::Engine(err.to_string())),
    }
}

struct WebRtcSession {
    peer: PeerId,
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl CapabilitySession for WebRtcSession {
    async fn create_offer(&self) -> Result<SessionDescription, CapabilityError> {
        let offer = self.pc.create_offer(None).await.map_err(engine_error)?;
        to_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError> {
        let answer = self.pc.create_answer(None).await.map_err(engine_error)?;
        to_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CapabilityError> {
        self.pc
            .set_local_description(from_description(desc)?)
            .await
            .map_err(engine_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CapabilityError> {
        self.pc
            .set_remote_description(from_description(desc)?)
            .await
            .map_err(engine_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CapabilityError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            ..Default::default()
        };
        self.pc.add_ice_candidate(init).await.map_err(engine_error)
    }

    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), CapabilityError> {
        for spec in &stream.tracks {
            let mime_type = match spec.kind {
                TrackKind::Video => MIME_TYPE_VP8,
                TrackKind::Audio => MIME_TYPE_OPUS,
            };
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_string(),
                    ..Default::default()
                },
                spec.id.clone(),
                stream.label.clone(),
            ));
            self.pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(engine_error)?;
            trace!(peer = %self.peer, track = %spec.id, "local track attached");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CapabilityError> {
        self.pc.close().await.map_err(engine_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_states_map_onto_connectivity() {
        assert_eq!(
            map_connectivity(RTCIceConnectionState::Failed),
            Some(ConnectivityState::Failed)
        );
        assert_eq!(
            map_connectivity(RTCIceConnectionState::Completed),
            Some(ConnectivityState::Completed)
        );
        assert_eq!(map_connectivity(RTCIceConnectionState::Unspecified), None);
    }

    const MINIMAL_SDP: &str =
        "v=0\r\no=- 4215775240449105457 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    #[test]
    fn descriptions_convert_both_ways() {
        let rtc = from_description(SessionDescription::new(SdpKind::Answer, MINIMAL_SDP))
            .expect("answer converts");
        assert_eq!(rtc.sdp_type, RTCSdpType::Answer);
        let back = to_description(rtc).expect("answer converts back");
        assert_eq!(back, SessionDescription::new(SdpKind::Answer, MINIMAL_SDP));

        let rollback = from_description(SessionDescription::new(SdpKind::Rollback, ""))
            .expect("rollback converts");
        assert_eq!(rollback.sdp_type, RTCSdpType::Rollback);
    }

    #[tokio::test]
    async fn factory_builds_with_stun_servers() {
        let capabilities =
            WebRtcCapabilities::new(&["stun:stun.l.google.com:19302".to_string()])
                .expect("api builds");
        assert_eq!(capabilities.rtc_config.ice_servers.len(), 1);
    }

    #[tokio::test]
    async fn offer_without_local_stream_receives_audio_and_video() {
        let capabilities = WebRtcCapabilities::new(&[]).expect("api builds");
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let session = capabilities
            .open(&PeerId::from("viewer"), PeerEvents::new(PeerId::from("viewer"), 1, tx))
            .await
            .expect("session opens");

        let offer = session.create_offer().await.expect("offer");
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"), "offer lacks audio: {}", offer.sdp);
        assert!(offer.sdp.contains("m=video"), "offer lacks video: {}", offer.sdp);
        assert!(offer.sdp.contains("a=recvonly"), "offer is not receive-only: {}", offer.sdp);

        session.close().await.expect("close");
    }
}
