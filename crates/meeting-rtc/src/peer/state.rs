//! Peer connection states and tile badges

use serde::Serialize;
use std::fmt;

/// Which half of the offer/answer exchange we performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationRole {
    OfferSent,
    AnswerSent,
}

/// Lifecycle of one peer entry
///
/// ```text
/// New -> Negotiating -> Connecting -> Connected <-> Disconnected
///                                        Disconnected -> Recovering -> Connecting
///                                        any live state -> Failed -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "role", rename_all = "snake_case")]
pub enum PeerState {
    New,
    Negotiating(NegotiationRole),
    Connecting,
    Connected,
    Disconnected,
    Recovering,
    Failed,
    Closed,
}

impl PeerState {
    /// Whether the state machine allows moving from `self` to `next`.
    /// Staying put is always allowed.
    pub fn can_transition(&self, next: PeerState) -> bool {
        use PeerState::*;
        if *self == next {
            return true;
        }
        match (*self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            (New, Negotiating(_)) => true,
            (Negotiating(_), Negotiating(_)) => true,
            (Negotiating(_), Connecting | Connected | Disconnected) => true,
            (Connecting, Connected | Disconnected) => true,
            (Connected, Disconnected) => true,
            (Disconnected, Connecting | Connected | Recovering) => true,
            (Recovering, Connecting | Connected | Disconnected) => true,
            _ => false,
        }
    }

    /// Failed and Closed end the entry's automatic lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Closed)
    }

    /// Media is (still) flowing or about to
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::New => f.write_str("new"),
            PeerState::Negotiating(NegotiationRole::OfferSent) => f.write_str("negotiating (offer sent)"),
            PeerState::Negotiating(NegotiationRole::AnswerSent) => {
                f.write_str("negotiating (answer sent)")
            }
            PeerState::Connecting => f.write_str("connecting"),
            PeerState::Connected => f.write_str("connected"),
            PeerState::Disconnected => f.write_str("disconnected"),
            PeerState::Recovering => f.write_str("recovering"),
            PeerState::Failed => f.write_str("failed"),
            PeerState::Closed => f.write_str("closed"),
        }
    }
}

/// Status shown on a peer's tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "badge", rename_all = "snake_case")]
pub enum StatusBadge {
    Reconnecting { attempt: u32, max_attempts: u32 },
    ConnectionFailed,
}

impl fmt::Display for StatusBadge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusBadge::Reconnecting {
                attempt,
                max_attempts,
            } => write!(f, "reconnecting ({}/{})", attempt, max_attempts),
            StatusBadge::ConnectionFailed => f.write_str("connection failed"),
        }
    }
}
