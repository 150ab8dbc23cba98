//! Error types for the meeting client

/// Result type alias using the meeting Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while joining and running a meeting
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Camera, microphone or display capture denied or unavailable
    #[error("Media access error: {0}")]
    MediaAccess(String),

    /// Signaling link not open, closed, or failed mid-send
    #[error("Signaling transport error: {0}")]
    SignalingTransport(String),

    /// Offer/answer exchange hit an invalid signaling state
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Candidate arrived for a peer with no connection entry
    #[error("Orphan ICE candidate from {0}")]
    CandidateOrphan(String),

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Mesh is full
    #[error("Peer limit reached ({0})")]
    PeerLimit(usize),

    /// Local track error
    #[error("Media track error: {0}")]
    MediaTrack(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingTransport(_) | Error::WebSocket(_) | Error::WebRtc(_) | Error::Io(_)
        )
    }

    /// Check if this error came out of the offer/answer exchange
    pub fn is_negotiation_error(&self) -> bool {
        matches!(self, Error::Negotiation(_))
    }

    /// Errors that are expected in normal operation and only logged at debug level
    pub fn is_silent(&self) -> bool {
        matches!(self, Error::CandidateOrphan(_))
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtc(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::InvalidConfig(format!("invalid URL: {}", e))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::InvalidConfig(format!("invalid TOML: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");
        assert_eq!(Error::PeerLimit(16).to_string(), "Peer limit reached (16)");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::SignalingTransport("closed".to_string()).is_retryable());
        assert!(Error::WebRtc("ice".to_string()).is_retryable());
        assert!(!Error::MediaAccess("denied".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_negotiation_error() {
        assert!(Error::Negotiation("have-remote-offer".to_string()).is_negotiation_error());
        assert!(!Error::SignalingTransport("closed".to_string()).is_negotiation_error());
    }

    #[test]
    fn test_orphan_candidate_is_silent() {
        assert!(Error::CandidateOrphan("abc".to_string()).is_silent());
        assert!(!Error::PeerNotFound("abc".to_string()).is_silent());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(Error::from(json_err), Error::Serialization(_)));
    }
}
