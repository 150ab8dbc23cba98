//! Capture device seam

use super::track::{LocalTrack, MediaStream, TrackSource};
use crate::config::MediaConstraints;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Source of local capture tracks
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture camera and microphone as requested. May return a partial
    /// stream when only some devices exist; fails with `MediaAccess` when
    /// nothing could be captured.
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream>;

    /// Capture a display surface as a video track
    async fn get_display_media(&self) -> Result<Arc<LocalTrack>>;
}

/// Devices whose tracks are fed by the embedding application.
///
/// Each call hands out fresh tracks; the application writes encoded
/// samples into them through `LocalTrack::write_sample`.
#[derive(Debug, Clone, Copy)]
pub struct ExternalCaptureDevices {
    pub microphone: bool,
    pub camera: bool,
    pub display: bool,
}

impl Default for ExternalCaptureDevices {
    fn default() -> Self {
        Self {
            microphone: true,
            camera: true,
            display: true,
        }
    }
}

#[async_trait]
impl MediaDevices for ExternalCaptureDevices {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        let stream = MediaStream {
            audio: (constraints.audio && self.microphone)
                .then(|| LocalTrack::new(TrackSource::Microphone)),
            video: (constraints.video && self.camera).then(|| LocalTrack::new(TrackSource::Camera)),
        };
        if stream.is_empty() {
            return Err(Error::MediaAccess(
                "no requested capture device is available".to_string(),
            ));
        }
        debug!(
            audio = stream.audio.is_some(),
            video = stream.video.is_some(),
            "Opened external capture tracks"
        );
        Ok(stream)
    }

    async fn get_display_media(&self) -> Result<Arc<LocalTrack>> {
        if !self.display {
            return Err(Error::MediaAccess(
                "display capture is not supported".to_string(),
            ));
        }
        Ok(LocalTrack::new(TrackSource::Screen))
    }
}
