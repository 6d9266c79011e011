//! Local media acquisition.
//!
//! Capture and encoding live outside this crate; a [`MediaSource`] only
//! hands back a description of the stream that every new peer gets attached.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::SignalError;

pub const STREAM_LABEL: &str = "ARDAMS";
pub const VIDEO_TRACK_ID: &str = "ARDAMSv0";
pub const AUDIO_TRACK_ID: &str = "ARDAMSa0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSpec {
    pub id: String,
    pub kind: TrackKind,
    /// Capture constraints as `(name, value)` pairs, passed through verbatim.
    pub constraints: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub label: String,
    pub tracks: Vec<TrackSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaParams {
    pub video_width: u32,
    pub video_height: u32,
    pub video_fps: u32,
    pub audio: bool,
}

impl Default for MediaParams {
    fn default() -> Self {
        Self {
            video_width: 1280,
            video_height: 720,
            video_fps: 30,
            audio: true,
        }
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalStream, SignalError>;
    /// Release whatever `acquire` took; safe to call when nothing was acquired.
    async fn release(&self);
}

/// Media source that describes a fixed video (+ optional audio) stream.
pub struct StaticMediaSource {
    params: MediaParams,
    acquired: Mutex<Option<LocalStream>>,
}

impl StaticMediaSource {
    pub fn new(params: MediaParams) -> Self {
        Self {
            params,
            acquired: Mutex::new(None),
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.lock().is_some()
    }

    fn describe(&self) -> LocalStream {
        let video = TrackSpec {
            id: VIDEO_TRACK_ID.to_string(),
            kind: TrackKind::Video,
            constraints: vec![
                ("maxWidth".into(), self.params.video_width.to_string()),
                ("maxHeight".into(), self.params.video_height.to_string()),
                ("maxFrameRate".into(), self.params.video_fps.to_string()),
            ],
        };
        let mut tracks = vec![video];
        if self.params.audio {
            let enabled = |name: &str| (name.to_string(), "true".to_string());
            tracks.push(TrackSpec {
                id: AUDIO_TRACK_ID.to_string(),
                kind: TrackKind::Audio,
                constraints: vec![
                    enabled("echoCancellation"),
                    enabled("autoGainControl"),
                    enabled("noiseSuppression"),
                    enabled("typingNoiseDetection"),
                    enabled("highpassFilter"),
                    ("audioMirroring".into(), "false".into()),
                ],
            });
        }
        LocalStream {
            label: STREAM_LABEL.to_string(),
            tracks,
        }
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self) -> Result<LocalStream, SignalError> {
        let mut guard = self.acquired.lock();
        if let Some(stream) = guard.as_ref() {
            return Ok(stream.clone());
        }
        let MediaParams {
            video_width,
            video_height,
            video_fps,
            ..
        } = self.params;
        if video_width == 0 || video_height == 0 || video_fps == 0 {
            return Err(SignalError::Media(format!(
                "cannot capture {video_width}x{video_height} at {video_fps} fps"
            )));
        }
        let stream = self.describe();
        info!(
            label = %stream.label,
            width = self.params.video_width,
            height = self.params.video_height,
            fps = self.params.video_fps,
            audio = self.params.audio,
            "local stream acquired"
        );
        *guard = Some(stream.clone());
        Ok(stream)
    }

    async fn release(&self) {
        if self.acquired.lock().take().is_some() {
            debug!("local stream released");
        }
    }
}
