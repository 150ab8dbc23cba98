//! Signaling envelope types
//!
//! One JSON object per message, discriminated by `type`. Field names are
//! camelCase. The relay stamps `source` on everything it forwards and
//! routes by `target` when present.

use crate::peer::{CandidatePriority, IceCandidate, SessionDescription};
use crate::types::ClientId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

fn is_false(value: &bool) -> bool {
    !*value
}

/// Message exchanged through the room relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingEnvelope {
    /// Presence announcement, fanned out to the room
    #[serde(rename = "JOIN", rename_all = "camelCase")]
    Join { client_id: ClientId },

    /// SDP offer for one peer
    #[serde(rename = "OFFER", rename_all = "camelCase")]
    Offer {
        offer: SessionDescription,
        target: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ClientId>,
        #[serde(default, skip_serializing_if = "is_false")]
        ice_restart: bool,
    },

    /// SDP answer for one peer
    #[serde(rename = "ANSWER", rename_all = "camelCase")]
    Answer {
        answer: SessionDescription,
        target: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ClientId>,
    },

    /// One trickled ICE candidate
    #[serde(rename = "CANDIDATE", rename_all = "camelCase")]
    Candidate {
        candidate: IceCandidate,
        target: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ClientId>,
        #[serde(default)]
        priority: CandidatePriority,
    },

    /// Ask the target to renegotiate with an ICE restart
    #[serde(rename = "ICE_RESTART", rename_all = "camelCase")]
    IceRestart {
        target: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ClientId>,
        #[serde(default, skip_serializing_if = "is_false")]
        force_relay: bool,
    },

    /// Departure announcement, fanned out to the room
    #[serde(rename = "LEAVE", rename_all = "camelCase")]
    Leave { client_id: ClientId },

    #[serde(rename = "AUDIO_TOGGLE", rename_all = "camelCase")]
    AudioToggle {
        enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ClientId>,
    },

    #[serde(rename = "VIDEO_TOGGLE", rename_all = "camelCase")]
    VideoToggle {
        enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ClientId>,
    },

    #[serde(rename = "CHAT_MESSAGE", rename_all = "camelCase")]
    ChatMessage {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ClientId>,
    },
}

impl SignalingEnvelope {
    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON string. Unknown `type` values are an error.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Wire name of the envelope type
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingEnvelope::Join { .. } => "JOIN",
            SignalingEnvelope::Offer { .. } => "OFFER",
            SignalingEnvelope::Answer { .. } => "ANSWER",
            SignalingEnvelope::Candidate { .. } => "CANDIDATE",
            SignalingEnvelope::IceRestart { .. } => "ICE_RESTART",
            SignalingEnvelope::Leave { .. } => "LEAVE",
            SignalingEnvelope::AudioToggle { .. } => "AUDIO_TOGGLE",
            SignalingEnvelope::VideoToggle { .. } => "VIDEO_TOGGLE",
            SignalingEnvelope::ChatMessage { .. } => "CHAT_MESSAGE",
        }
    }

    /// Sender of the envelope: the relay-stamped `source`, or the announced
    /// client id for JOIN/LEAVE
    pub fn source(&self) -> Option<&ClientId> {
        match self {
            SignalingEnvelope::Join { client_id } | SignalingEnvelope::Leave { client_id } => {
                Some(client_id)
            }
            SignalingEnvelope::Offer { source, .. }
            | SignalingEnvelope::Answer { source, .. }
            | SignalingEnvelope::Candidate { source, .. }
            | SignalingEnvelope::IceRestart { source, .. }
            | SignalingEnvelope::AudioToggle { source, .. }
            | SignalingEnvelope::VideoToggle { source, .. }
            | SignalingEnvelope::ChatMessage { source, .. } => source.as_ref(),
        }
    }

    /// Addressed peer, if the envelope is not a room broadcast
    pub fn target(&self) -> Option<&ClientId> {
        match self {
            SignalingEnvelope::Offer { target, .. }
            | SignalingEnvelope::Answer { target, .. }
            | SignalingEnvelope::Candidate { target, .. }
            | SignalingEnvelope::IceRestart { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Stamp the sender, as the relay does before forwarding
    pub fn with_source(mut self, id: ClientId) -> Self {
        match &mut self {
            SignalingEnvelope::Join { .. } | SignalingEnvelope::Leave { .. } => {}
            SignalingEnvelope::Offer { source, .. }
            | SignalingEnvelope::Answer { source, .. }
            | SignalingEnvelope::Candidate { source, .. }
            | SignalingEnvelope::IceRestart { source, .. }
            | SignalingEnvelope::AudioToggle { source, .. }
            | SignalingEnvelope::VideoToggle { source, .. }
            | SignalingEnvelope::ChatMessage { source, .. } => *source = Some(id),
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_wire_shape() {
        let msg = SignalingEnvelope::Join {
            client_id: ClientId::from("a1"),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "JOIN", "clientId": "a1"}));
    }

    #[test]
    fn test_offer_wire_shape() {
        let msg = SignalingEnvelope::Offer {
            offer: SessionDescription::offer("v=0"),
            target: ClientId::from("b2"),
            source: None,
            ice_restart: true,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "OFFER",
                "offer": {"type": "offer", "sdp": "v=0"},
                "target": "b2",
                "iceRestart": true
            })
        );
    }

    #[test]
    fn test_candidate_from_browser_json() {
        let raw = r#"{
            "type": "CANDIDATE",
            "candidate": {
                "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "abcd"
            },
            "target": "b2",
            "source": "a1"
        }"#;
        let msg = SignalingEnvelope::from_json(raw).unwrap();
        match &msg {
            SignalingEnvelope::Candidate {
                candidate,
                priority,
                ..
            } => {
                assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
                assert_eq!(*priority, CandidatePriority::Normal);
            }
            other => panic!("Expected Candidate, got {:?}", other),
        }
        assert_eq!(msg.source(), Some(&ClientId::from("a1")));
        assert_eq!(msg.target(), Some(&ClientId::from("b2")));
    }

    #[test]
    fn test_ice_restart_flags() {
        let msg = SignalingEnvelope::from_json(
            r#"{"type":"ICE_RESTART","target":"b","source":"a","forceRelay":true}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            SignalingEnvelope::IceRestart {
                target: ClientId::from("b"),
                source: Some(ClientId::from("a")),
                force_relay: true,
            }
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = SignalingEnvelope::from_json(r#"{"type":"SCREEN_SHARE","on":true}"#).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(SignalingEnvelope::from_json("not json").is_err());
    }

    #[test]
    fn test_with_source_stamps_targeted_and_broadcast() {
        let chat = SignalingEnvelope::ChatMessage {
            message: "hi".to_string(),
            source: None,
        }
        .with_source(ClientId::from("a"));
        assert_eq!(chat.source(), Some(&ClientId::from("a")));
        assert_eq!(chat.target(), None);
        assert_eq!(chat.kind(), "CHAT_MESSAGE");

        let leave = SignalingEnvelope::Leave {
            client_id: ClientId::from("x"),
        }
        .with_source(ClientId::from("a"));
        assert_eq!(leave.source(), Some(&ClientId::from("x")));
    }
}
