//! Peer connections: engine seam, per-peer state machine, manager and
//! recovery policy

pub mod connection;
pub mod engine;
pub mod lifecycle;
pub mod manager;
pub mod state;
pub mod webrtc_engine;

pub use connection::{PeerConnection, PeerInfo, RemoteTile};
pub use engine::{
    CandidatePriority, CandidateType, ConnectionEvent, ConnectionEventSink, IceCandidate,
    RemoteTrackInfo, RtcConnection, RtcEngine, RtcSender, SdpType, SessionDescription,
    SignalingState, TransportState,
};
pub use lifecycle::{
    BackoffSchedule, FailureDecision, RecoveryDecision, RecoveryPolicy, ScheduledTask,
};
pub use manager::PeerConnectionManager;
pub use state::{NegotiationRole, PeerState, StatusBadge};
pub use webrtc_engine::WebRtcEngine;
