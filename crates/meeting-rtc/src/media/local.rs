//! Local capture state shared by every peer connection
//!
//! `LocalMediaSource` is the single writer of track `enabled` flags and the
//! only caller of sender track replacement. Its lock serializes attaching a
//! new connection against a screen-share switch, so a connection created
//! mid-switch still ends up sending the right video track.

use super::devices::MediaDevices;
use super::track::{LocalTrack, MediaKind, MediaStream};
use crate::config::MediaConstraints;
use crate::peer::{RtcConnection, RtcSender};
use crate::session::events::{EventSink, MeetingEvent};
use crate::signaling::{SignalingEnvelope, SignalingSender};
use crate::types::ConnectionId;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Snapshot of local media
#[derive(Debug, Clone)]
pub struct LocalMediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_share_active: bool,
    /// What peers and the local preview currently see
    pub active: MediaStream,
    /// Camera stream held aside while sharing
    pub original: Option<MediaStream>,
}

#[derive(Default)]
struct Inner {
    camera: MediaStream,
    screen: Option<Arc<LocalTrack>>,
    audio_enabled: bool,
    video_enabled: bool,
    senders: HashMap<ConnectionId, Vec<Arc<dyn RtcSender>>>,
    share_watcher: Option<JoinHandle<()>>,
}

impl Inner {
    fn active_video(&self) -> Option<Arc<LocalTrack>> {
        self.screen.clone().or_else(|| self.camera.video.clone())
    }

    fn video_senders(&self) -> Vec<Arc<dyn RtcSender>> {
        self.senders
            .values()
            .flatten()
            .filter(|sender| sender.kind() == MediaKind::Video)
            .cloned()
            .collect()
    }

    fn changed_event(&self) -> MeetingEvent {
        MeetingEvent::LocalMediaChanged {
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
            screen_share_active: self.screen.is_some(),
        }
    }
}

#[derive(Default)]
struct Bindings {
    signaling: Option<SignalingSender>,
    events: Option<EventSink>,
}

/// Holder of the local capture stream and optional screen share
pub struct LocalMediaSource {
    devices: Arc<dyn MediaDevices>,
    inner: Mutex<Inner>,
    bindings: parking_lot::Mutex<Bindings>,
}

impl LocalMediaSource {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Arc<Self> {
        Arc::new(Self {
            devices,
            inner: Mutex::new(Inner::default()),
            bindings: parking_lot::Mutex::new(Bindings::default()),
        })
    }

    /// Request camera and microphone. A degraded stream is accepted with a
    /// warning; no stream at all is a `MediaAccess` error.
    pub async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        let stream = self
            .devices
            .get_user_media(constraints)
            .await
            .map_err(|e| match e {
                Error::MediaAccess(msg) => Error::MediaAccess(msg),
                other => Error::MediaAccess(other.to_string()),
            })?;
        if stream.is_empty() {
            return Err(Error::MediaAccess("no local media available".to_string()));
        }
        if (constraints.audio && stream.audio.is_none())
            || (constraints.video && stream.video.is_none())
        {
            warn!(
                audio = stream.audio.is_some(),
                video = stream.video.is_some(),
                "Continuing with a degraded local stream"
            );
        }

        let mut inner = self.inner.lock().await;
        inner.camera.stop();
        inner.audio_enabled = stream.audio.is_some();
        inner.video_enabled = stream.video.is_some();
        inner.camera = stream.clone();
        info!(
            audio = inner.audio_enabled,
            video = inner.video_enabled,
            "Local media acquired"
        );
        Ok(stream)
    }

    /// Route toggle broadcasts and state events once the session is up
    pub fn bind(&self, signaling: SignalingSender, events: EventSink) {
        let mut bindings = self.bindings.lock();
        bindings.signaling = Some(signaling);
        bindings.events = Some(events);
    }

    /// Add the active tracks to a new connection and remember its senders
    pub async fn attach(&self, connection_id: ConnectionId, conn: &dyn RtcConnection) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let tracks: Vec<Arc<LocalTrack>> = inner
            .camera
            .audio
            .iter()
            .cloned()
            .chain(inner.active_video())
            .collect();

        let mut senders = Vec::with_capacity(tracks.len());
        for track in tracks {
            senders.push(conn.add_track(track).await?);
        }
        debug!(connection_id = %connection_id, senders = senders.len(), "Attached local tracks");
        inner.senders.insert(connection_id, senders);
        Ok(())
    }

    /// Forget a closed connection's senders
    pub async fn detach(&self, connection_id: ConnectionId) {
        self.inner.lock().await.senders.remove(&connection_id);
    }

    /// Flip the microphone on or off and broadcast AUDIO_TOGGLE
    pub async fn toggle_audio(&self) -> Result<bool> {
        let (enabled, event) = {
            let mut inner = self.inner.lock().await;
            let track = inner
                .camera
                .audio
                .clone()
                .ok_or_else(|| Error::MediaTrack("no local audio track".to_string()))?;
            inner.audio_enabled = !inner.audio_enabled;
            track.set_enabled(inner.audio_enabled);
            (inner.audio_enabled, inner.changed_event())
        };
        info!(enabled, "Audio toggled");
        self.broadcast(SignalingEnvelope::AudioToggle {
            enabled,
            source: None,
        })
        .await;
        self.emit(event);
        Ok(enabled)
    }

    /// Flip the camera on or off and broadcast VIDEO_TOGGLE
    pub async fn toggle_video(&self) -> Result<bool> {
        let (enabled, event) = {
            let mut inner = self.inner.lock().await;
            let track = inner
                .camera
                .video
                .clone()
                .ok_or_else(|| Error::MediaTrack("no local video track".to_string()))?;
            inner.video_enabled = !inner.video_enabled;
            track.set_enabled(inner.video_enabled);
            (inner.video_enabled, inner.changed_event())
        };
        info!(enabled, "Video toggled");
        self.broadcast(SignalingEnvelope::VideoToggle {
            enabled,
            source: None,
        })
        .await;
        self.emit(event);
        Ok(enabled)
    }

    /// Replace the outgoing video on every open connection with a display
    /// capture. Nothing is replaced if capture fails or there is no video
    /// track to replace.
    pub async fn start_screen_share(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.screen.is_some() {
            debug!("Screen share already active");
            return Ok(());
        }
        let camera = inner.camera.video.clone().ok_or_else(|| {
            Error::MediaAccess("no outgoing video track to replace".to_string())
        })?;
        let display = self.devices.get_display_media().await.map_err(|e| match e {
            Error::MediaAccess(msg) => Error::MediaAccess(msg),
            other => Error::MediaAccess(other.to_string()),
        })?;

        let mut replaced: Vec<Arc<dyn RtcSender>> = Vec::new();
        for sender in inner.video_senders() {
            if let Err(e) = sender.replace_track(display.clone()).await {
                warn!("Screen share replace failed, restoring camera: {}", e);
                for done in replaced {
                    if let Err(e) = done.replace_track(camera.clone()).await {
                        warn!("Failed to restore camera track: {}", e);
                    }
                }
                display.stop();
                return Err(Error::MediaAccess(format!("screen share failed: {}", e)));
            }
            replaced.push(sender);
        }

        inner.screen = Some(display.clone());
        inner.share_watcher = Some(tokio::spawn(Self::watch_share_end(
            Arc::downgrade(self),
            display,
        )));
        let event = inner.changed_event();
        drop(inner);

        info!(connections = replaced.len(), "Screen share started");
        self.emit(event);
        Ok(())
    }

    /// Restore the camera track everywhere
    pub async fn stop_screen_share(&self) -> Result<()> {
        self.finish_screen_share(None, true).await
    }

    /// Stops the share when the display track ends on its own
    async fn watch_share_end(source: Weak<Self>, display: Arc<LocalTrack>) {
        let mut ended = display.ended_watch();
        if ended.wait_for(|ended| *ended).await.is_err() {
            return;
        }
        if let Some(source) = source.upgrade() {
            let track_id = display.id().to_string();
            debug!(track_id = %track_id, "Display track ended");
            if let Err(e) = source.finish_screen_share(Some(display.id()), false).await {
                warn!("Failed to stop screen share: {}", e);
            }
        }
    }

    async fn finish_screen_share(&self, only_track: Option<&str>, abort_watcher: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(screen) = inner.screen.clone() else {
            return Ok(());
        };
        if only_track.is_some_and(|id| id != screen.id()) {
            return Ok(());
        }

        // The watcher itself calls in here with abort_watcher = false.
        let watcher = inner.share_watcher.take();
        if abort_watcher {
            if let Some(watcher) = watcher {
                watcher.abort();
            }
        }
        inner.screen = None;

        if let Some(camera) = inner.camera.video.clone() {
            for sender in inner.video_senders() {
                if let Err(e) = sender.replace_track(camera.clone()).await {
                    warn!("Failed to restore camera track: {}", e);
                }
            }
        }
        screen.stop();
        let event = inner.changed_event();
        drop(inner);

        info!("Screen share stopped");
        self.emit(event);
        Ok(())
    }

    pub async fn state(&self) -> LocalMediaState {
        let inner = self.inner.lock().await;
        let active = MediaStream {
            audio: inner.camera.audio.clone(),
            video: inner.active_video(),
        };
        LocalMediaState {
            audio_enabled: inner.audio_enabled,
            video_enabled: inner.video_enabled,
            screen_share_active: inner.screen.is_some(),
            active,
            original: inner.screen.as_ref().map(|_| inner.camera.clone()),
        }
    }

    /// End all capture, including an active share
    pub async fn stop_all(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(watcher) = inner.share_watcher.take() {
            watcher.abort();
        }
        if let Some(screen) = inner.screen.take() {
            screen.stop();
        }
        inner.camera.stop();
        inner.senders.clear();
    }

    async fn broadcast(&self, envelope: SignalingEnvelope) {
        let signaling = self.bindings.lock().signaling.clone();
        match signaling {
            Some(signaling) => {
                if let Err(e) = signaling.send(envelope).await {
                    warn!("Failed to broadcast media toggle: {}", e);
                }
            }
            None => debug!("No signaling bound, toggle not broadcast"),
        }
    }

    fn emit(&self, event: MeetingEvent) {
        if let Some(events) = self.bindings.lock().events.as_ref() {
            events.emit(event);
        }
    }
}
