//! Local media tracks
//!
//! A `LocalTrack` is shared by reference between every peer sender and the
//! local preview. Its `enabled` flag suppresses outgoing samples without
//! stopping capture; only `LocalMediaSource` flips it.

use crate::{Error, Result};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Stream id shared by all local tracks
const LOCAL_STREAM_ID: &str = "local";

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// What a local track captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(&self) -> MediaKind {
        match self {
            TrackSource::Microphone => MediaKind::Audio,
            TrackSource::Camera | TrackSource::Screen => MediaKind::Video,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            TrackSource::Microphone => "mic",
            TrackSource::Camera => "camera",
            TrackSource::Screen => "screen",
        }
    }
}

/// Captured local track
pub struct LocalTrack {
    id: String,
    source: TrackSource,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    /// Create a track for `source`, encoded as Opus (audio) or VP8 (video)
    pub fn new(source: TrackSource) -> Arc<Self> {
        let id = format!("{}-{}", source.label(), uuid::Uuid::new_v4().simple());
        let codec = match source.kind() {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            LOCAL_STREAM_ID.to_string(),
        ));
        let (ended, _) = watch::channel(false);

        Arc::new(Self {
            id,
            source,
            enabled: AtomicBool::new(true),
            ended,
            rtp,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// End capture. For a display track this is the user's "stop sharing".
    pub fn stop(&self) {
        self.ended.send_replace(true);
    }

    /// Watch that flips to true once the track ends
    pub fn ended_watch(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }

    /// Underlying RTP track handed to the WebRTC stack
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp)
    }

    /// Send one encoded frame. Returns false when the sample was suppressed
    /// because the track is disabled or ended.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool> {
        if !self.is_enabled() || self.is_ended() {
            return Ok(false);
        }

        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.rtp
            .write_sample(&sample)
            .await
            .map_err(|e| Error::MediaTrack(format!("Failed to write RTP sample: {}", e)))?;
        Ok(true)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Local capture output: at most one audio and one video track
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    pub audio: Option<Arc<LocalTrack>>,
    pub video: Option<Arc<LocalTrack>>,
}

impl MediaStream {
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn stop(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}
