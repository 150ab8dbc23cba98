//! Seam between the peer state machine and the WebRTC stack
//!
//! `PeerConnection` drives an [`RtcConnection`] through these traits only.
//! The production implementation lives in `webrtc_engine`; the `testing`
//! module provides an in-process fake with the same signaling-state rules.

use crate::config::ConnectionSettings;
use crate::media::{LocalTrack, MediaKind};
use crate::types::ClientId;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Wire-level negotiation data
// ============================================================================

/// SDP type carried in OFFER/ANSWER envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as exchanged on the wire (`{"type", "sdp"}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Username and session id from the `o=` line.
    ///
    /// A connection keeps its origin for every description it produces, so
    /// an offer with a different origin comes from a different connection.
    pub fn session_id(&self) -> Option<String> {
        let origin = self.sdp.lines().find_map(|line| line.strip_prefix("o="))?;
        let mut fields = origin.split_whitespace();
        let username = fields.next()?;
        let session = fields.next()?;
        Some(format!("{} {}", username, session))
    }
}

/// One trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// ICE candidate type, read from the `typ` attribute of the candidate line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    pub fn candidate_type(&self) -> CandidateType {
        let mut tokens = self.candidate.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "typ" {
                return match tokens.next() {
                    Some("host") => CandidateType::Host,
                    Some("srflx") => CandidateType::ServerReflexive,
                    Some("prflx") => CandidateType::PeerReflexive,
                    Some("relay") => CandidateType::Relay,
                    _ => CandidateType::Unknown,
                };
            }
        }
        CandidateType::Unknown
    }

    pub fn is_relay(&self) -> bool {
        self.candidate_type() == CandidateType::Relay
    }
}

/// Priority hint attached to outbound CANDIDATE envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidatePriority {
    High,
    #[default]
    Normal,
}

impl CandidatePriority {
    /// Relay candidates are the most likely to work across strict NATs
    pub fn for_candidate(candidate: &IceCandidate) -> Self {
        if candidate.is_relay() {
            Self::High
        } else {
            Self::Normal
        }
    }
}

// ============================================================================
// Engine-reported state
// ============================================================================

/// Offer/answer state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Transport (ICE + DTLS) state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A track received from the remote side
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

/// Everything an engine connection reports asynchronously
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    TransportStateChanged(TransportState),
    RemoteTrack(RemoteTrackInfo),
}

/// Single dispatch function for one connection's events.
///
/// The session builds one per created connection, already tagged with the
/// remote client id and connection id. `emit` returns false once the
/// session has gone away.
#[derive(Clone)]
pub struct ConnectionEventSink {
    dispatch: Arc<dyn Fn(ConnectionEvent) -> bool + Send + Sync>,
}

impl ConnectionEventSink {
    pub fn new(dispatch: impl Fn(ConnectionEvent) -> bool + Send + Sync + 'static) -> Self {
        Self {
            dispatch: Arc::new(dispatch),
        }
    }

    pub fn emit(&self, event: ConnectionEvent) -> bool {
        (self.dispatch)(event)
    }
}

impl fmt::Debug for ConnectionEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEventSink").finish_non_exhaustive()
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Factory for peer connections
#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Create a connection to `remote`. Engine events for it go to `events`.
    async fn create_connection(
        &self,
        remote: &ClientId,
        settings: &ConnectionSettings,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn RtcConnection>>;
}

/// One WebRTC peer connection
#[async_trait]
pub trait RtcConnection: Send + Sync {
    /// Attach a local track, returning its sender
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<Arc<dyn RtcSender>>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    async fn close(&self) -> Result<()>;
}

/// Outgoing RTP sender for one attached track
#[async_trait]
pub trait RtcSender: Send + Sync {
    fn kind(&self) -> MediaKind;

    /// Swap the outgoing track in place, without renegotiation
    async fn replace_track(&self, track: Arc<LocalTrack>) -> Result<()>;

    fn current_track_id(&self) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_type_parsing() {
        let relay = IceCandidate::new(
            "candidate:1 1 udp 41885439 203.0.113.5 3478 typ relay raddr 0.0.0.0 rport 0",
        );
        assert_eq!(relay.candidate_type(), CandidateType::Relay);
        assert!(relay.is_relay());
        assert_eq!(CandidatePriority::for_candidate(&relay), CandidatePriority::High);

        let host = IceCandidate::new("candidate:2 1 udp 2130706431 192.168.1.4 54321 typ host");
        assert_eq!(host.candidate_type(), CandidateType::Host);
        assert_eq!(CandidatePriority::for_candidate(&host), CandidatePriority::Normal);

        assert_eq!(IceCandidate::new("garbage").candidate_type(), CandidateType::Unknown);
    }

    #[test]
    fn test_candidate_wire_names() {
        let json = serde_json::to_value(IceCandidate::new("candidate:x typ srflx")).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_some());

        let parsed: IceCandidate = serde_json::from_str(r#"{"candidate":"c"}"#).unwrap();
        assert_eq!(parsed.sdp_mid, None);
    }

    #[test]
    fn test_session_description_wire_shape() {
        let json = serde_json::to_string(&SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0"}"#);
    }

    #[test]
    fn test_session_id_ignores_version() {
        let first = SessionDescription::offer("v=0\r\no=- 4215 2 IN IP4 127.0.0.1\r\ns=-\r\n");
        let restart = SessionDescription::offer("v=0\r\no=- 4215 3 IN IP4 127.0.0.1\r\n");
        let replaced = SessionDescription::offer("v=0\r\no=- 9001 2 IN IP4 127.0.0.1\r\n");
        assert_eq!(first.session_id().as_deref(), Some("- 4215"));
        assert_eq!(first.session_id(), restart.session_id());
        assert_ne!(first.session_id(), replaced.session_id());
        assert_eq!(SessionDescription::offer("v=0").session_id(), None);
    }

    #[test]
    fn test_priority_orders_high_first() {
        let mut priorities = vec![CandidatePriority::Normal, CandidatePriority::High];
        priorities.sort();
        assert_eq!(priorities[0], CandidatePriority::High);
    }

    #[test]
    fn test_event_sink_dispatch() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = ConnectionEventSink::new(move |event| tx.send(event).is_ok());
        assert!(sink.emit(ConnectionEvent::GatheringComplete));
        assert_eq!(rx.try_recv().unwrap(), ConnectionEvent::GatheringComplete);
        drop(rx);
        assert!(!sink.emit(ConnectionEvent::GatheringComplete));
    }
}
