//! Events a front end renders

use crate::peer::{PeerState, RemoteTrackInfo, StatusBadge};
use crate::types::ClientId;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

/// Last announced mute state of a remote participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemoteMediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl Default for RemoteMediaState {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
        }
    }
}

/// Meeting event stream item
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MeetingEvent {
    /// A connection entry (and its tile) was created for a peer
    ParticipantJoined { client_id: ClientId },
    /// A peer's entry and tile were removed
    ParticipantLeft { client_id: ClientId },
    PeerStateChanged { client_id: ClientId, state: PeerState },
    /// Badge shown on the peer's tile; `None` clears it
    StatusBadge {
        client_id: ClientId,
        badge: Option<StatusBadge>,
    },
    RemoteTrackAdded {
        client_id: ClientId,
        track: RemoteTrackInfo,
    },
    RemoteMediaToggled {
        client_id: ClientId,
        media: RemoteMediaState,
    },
    ChatMessage { client_id: ClientId, message: String },
    LocalMediaChanged {
        audio_enabled: bool,
        video_enabled: bool,
        screen_share_active: bool,
    },
    /// The signaling link is gone; no further negotiation is possible
    SignalingClosed,
}

/// Clonable sender side of the event stream
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<MeetingEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MeetingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event. Nobody listening is not an error.
    pub fn emit(&self, event: MeetingEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!("Meeting event dropped, no listener: {:?}", e.0);
        }
    }
}
