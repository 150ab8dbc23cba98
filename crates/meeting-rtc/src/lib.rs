//! Mesh WebRTC meetings: peer connections, signaling and recovery
//!
//! This crate implements the real-time core of a multi-party meeting
//! client. Every participant keeps one WebRTC connection to every other
//! participant in the room, negotiated through a thin room-scoped relay.
//!
//! # Features
//!
//! - **Mesh peer connections**: one state machine per remote participant
//! - **Signaling protocol**: JOIN/OFFER/ANSWER/CANDIDATE/ICE_RESTART/LEAVE
//!   plus media-toggle and chat envelopes, JSON over WebSocket
//! - **Recovery**: exponential-backoff ICE restarts, connection
//!   replacement with relay-only fallback, terminal failure badges
//! - **Local media**: mute toggles and screen share by in-place track
//!   replacement
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Front end (renders MeetingEvents, calls controls)    │
//! │  ↓                                                     │
//! │  MeetingSession                                        │
//! │  ├─ LocalMediaSource (tracks, toggles, screen share)  │
//! │  ├─ SignalingChannel (room relay link)                │
//! │  └─ session task                                       │
//! │     └─ SignalingProtocolHandler                        │
//! │        ├─ PeerConnectionManager                        │
//! │        │   └─ PeerConnection per remote participant    │
//! │        └─ RecoveryPolicy                               │
//! │           ↓                                            │
//! │  RtcEngine (webrtc-rs, or the in-process fake)        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use meeting_rtc::{MeetingConfig, RoomName};
//!
//! let config = MeetingConfig {
//!     server_origin: "https://meet.example.com".to_string(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//!
//! let room = RoomName::from_page_path("/projects/7/meeting/standup").unwrap();
//! assert_eq!(room.as_str(), "standup");
//! ```
//!
//! ## Joining a room
//!
//! ```no_run
//! use meeting_rtc::{
//!     ExternalCaptureDevices, MeetingConfig, MeetingSession, RoomName, WebRtcEngine,
//!     WebSocketConnector,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> meeting_rtc::Result<()> {
//! let mut session = MeetingSession::join(
//!     MeetingConfig::default(),
//!     RoomName::new("standup")?,
//!     Arc::new(WebRtcEngine::new()?),
//!     Arc::new(ExternalCaptureDevices::default()),
//!     &WebSocketConnector::new(),
//! )
//! .await?;
//!
//! let mut events = session.take_events().unwrap();
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{
    ConnectionSettings, GlareStrategy, IceServer, IceTransportPolicy, MediaConstraints,
    MeetingConfig, RecoveryConfig, TurnServerConfig,
};
pub use error::{Error, Result};
pub use media::{
    ExternalCaptureDevices, LocalMediaSource, LocalMediaState, LocalTrack, MediaDevices,
    MediaKind, MediaStream, TrackSource,
};
pub use peer::{
    NegotiationRole, PeerInfo, PeerState, RemoteTrackInfo, RtcConnection, RtcEngine, RtcSender,
    StatusBadge, WebRtcEngine,
};
pub use session::{MeetingEvent, MeetingSession, RemoteMediaState};
pub use signaling::{ChannelState, MemoryRelay, SignalingConnector, SignalingEnvelope, WebSocketConnector};
pub use types::{ClientId, ConnectionId, RoomName};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
