//! Configuration types for the meeting client

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Main configuration for a meeting session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeetingConfig {
    /// Origin of the meeting page (http, https, ws or wss). The signaling
    /// URL mirrors its host and picks wss under https.
    pub server_origin: String,

    /// STUN server URLs (stun: or stuns:)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Maximum remote peers in the mesh (default: 16, range: 1-32)
    pub max_peers: usize,

    /// Which capture devices to request on join
    pub media: MediaConstraints,

    /// Delay between setting a local offer and sending it (default: 250ms).
    /// Candidates gathered meanwhile are held and flushed after the offer.
    pub offer_grace_ms: u64,

    /// Reconnection behaviour
    pub recovery: RecoveryConfig,

    /// How colliding offers are resolved
    pub glare: GlareStrategy,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServerConfig {
    /// Parse the `url|username|credential` form used on the command line
    pub fn parse_cli(spec: &str) -> Result<Self> {
        let mut parts = spec.splitn(3, '|');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(url), Some(username), Some(credential)) if !url.is_empty() => Ok(Self {
                url: url.to_string(),
                username: username.to_string(),
                credential: credential.to_string(),
            }),
            _ => Err(Error::InvalidConfig(format!(
                "TURN server must be url|username|credential, got {}",
                spec
            ))),
        }
    }
}

/// Capture devices requested on join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Reconnection policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Recovery attempts per peer before giving up (default: 5)
    pub max_attempts: u32,

    /// First backoff delay in milliseconds (default: 1000ms)
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds (default: 30000ms)
    pub backoff_max_ms: u64,

    /// Add 0-25% random jitter to each delay (default: false)
    pub jitter: bool,

    /// Rebuild failed connections with a relay-only ICE policy when TURN
    /// servers are configured (default: true)
    pub force_relay_on_failure: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 1000,
            backoff_max_ms: 30000,
            jitter: false,
            force_relay_on_failure: true,
        }
    }
}

/// Resolution of an offer that collides with our own pending offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlareStrategy {
    /// Always drop our offer and answer theirs. Only resolves glare when
    /// the other side never yields, e.g. against the legacy web client.
    LastOfferWins,
    /// The side with the higher client id is polite and yields; the other
    /// ignores the colliding offer
    #[default]
    PerfectNegotiation,
}

impl std::str::FromStr for GlareStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "last_offer_wins" => Ok(Self::LastOfferWins),
            "perfect_negotiation" | "perfect" => Ok(Self::PerfectNegotiation),
            other => Err(Error::InvalidConfig(format!("unknown glare strategy: {}", other))),
        }
    }
}

/// One ICE server entry handed to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Which candidate types the engine may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

/// Settings consumed when a connection is created. Never applied to a
/// live connection; forcing relay means building a new one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionSettings {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
}

impl Default for MeetingConfig {
    fn default() -> Self {
        Self {
            server_origin: "http://localhost:8000".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            max_peers: 16,
            media: MediaConstraints::default(),
            offer_grace_ms: 250,
            recovery: RecoveryConfig::default(),
            glare: GlareStrategy::default(),
        }
    }
}

impl MeetingConfig {
    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let origin = Url::parse(&self.server_origin)?;
        if !matches!(origin.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(Error::InvalidConfig(format!(
                "server_origin must be http(s) or ws(s), got {}",
                self.server_origin
            )));
        }
        if origin.host_str().is_none() {
            return Err(Error::InvalidConfig(format!(
                "server_origin has no host: {}",
                self.server_origin
            )));
        }

        if self.stun_servers.is_empty() && self.turn_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN or TURN server is required".to_string(),
            ));
        }
        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN url must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }
        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN url must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if self.max_peers == 0 || self.max_peers > 32 {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-32, got {}",
                self.max_peers
            )));
        }

        if !self.media.audio && !self.media.video {
            return Err(Error::InvalidConfig(
                "at least one of media.audio and media.video must be requested".to_string(),
            ));
        }

        let recovery = &self.recovery;
        if recovery.backoff_base_ms == 0 || recovery.backoff_base_ms > recovery.backoff_max_ms {
            return Err(Error::InvalidConfig(format!(
                "backoff_base_ms must be in range 1-{}, got {}",
                recovery.backoff_max_ms, recovery.backoff_base_ms
            )));
        }

        Ok(())
    }

    /// Whether any TURN server is configured
    pub fn has_relay(&self) -> bool {
        !self.turn_servers.is_empty()
    }

    pub fn offer_grace(&self) -> Duration {
        Duration::from_millis(self.offer_grace_ms)
    }

    /// Build the settings for a new connection. Relay-only is applied only
    /// when a TURN server exists; without one the engine could never connect.
    pub fn connection_settings(&self, force_relay: bool) -> ConnectionSettings {
        let mut ice_servers: Vec<IceServer> = Vec::new();
        if !self.stun_servers.is_empty() {
            ice_servers.push(IceServer {
                urls: self.stun_servers.clone(),
                username: String::new(),
                credential: String::new(),
            });
        }
        for turn in &self.turn_servers {
            ice_servers.push(IceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
            });
        }

        let ice_transport_policy = if force_relay && self.has_relay() {
            IceTransportPolicy::Relay
        } else {
            if force_relay {
                warn!("relay-only policy requested without TURN servers, using all candidates");
            }
            IceTransportPolicy::All
        };

        ConnectionSettings {
            ice_servers,
            ice_transport_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_turn() -> MeetingConfig {
        MeetingConfig {
            turn_servers: vec![TurnServerConfig {
                url: "turn:turn.example.com:3478".to_string(),
                username: "user".to_string(),
                credential: "secret".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = MeetingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recovery.max_attempts, 5);
        assert_eq!(config.glare, GlareStrategy::PerfectNegotiation);
        assert!(!config.recovery.jitter);
    }

    #[test]
    fn test_no_ice_servers_fails() {
        let mut config = MeetingConfig::default();
        config.stun_servers.clear();
        assert!(config.validate().is_err());
        assert!(MeetingConfig {
            stun_servers: Vec::new(),
            ..with_turn()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_invalid_max_peers_fails() {
        let mut config = MeetingConfig::default();
        config.max_peers = 0;
        assert!(config.validate().is_err());

        config.max_peers = 33;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_origin_fails() {
        let mut config = MeetingConfig::default();
        config.server_origin = "ftp://example.com".to_string();
        assert!(config.validate().is_err());

        config.server_origin = "not a url".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_bad_server_urls_fail() {
        let mut config = MeetingConfig::default();
        config.stun_servers = vec!["turn:wrong".to_string()];
        assert!(config.validate().is_err());

        let mut config = with_turn();
        config.turn_servers[0].url = "stun:wrong".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_media_requested_fails() {
        let mut config = MeetingConfig::default();
        config.media = MediaConstraints {
            audio: false,
            video: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_with_defaults() {
        let config = MeetingConfig::from_toml_str(
            r#"
            server_origin = "https://meet.example.com"
            glare = "last_offer_wins"

            [recovery]
            max_attempts = 3

            [[turn_servers]]
            url = "turns:turn.example.com:5349"
            username = "u"
            credential = "c"
            "#,
        )
        .unwrap();
        assert_eq!(config.server_origin, "https://meet.example.com");
        assert_eq!(config.glare, GlareStrategy::LastOfferWins);
        assert_eq!(config.recovery.max_attempts, 3);
        assert_eq!(config.recovery.backoff_base_ms, 1000);
        assert_eq!(config.max_peers, 16);
        assert!(config.has_relay());
    }

    #[test]
    fn test_from_toml_rejects_invalid_values() {
        assert!(MeetingConfig::from_toml_str("max_peers = 100").is_err());
        assert!(MeetingConfig::from_toml_str("max_peers = \"many\"").is_err());
    }

    #[test]
    fn test_connection_settings_relay_needs_turn() {
        let config = MeetingConfig::default();
        let settings = config.connection_settings(true);
        assert_eq!(settings.ice_transport_policy, IceTransportPolicy::All);
        assert_eq!(settings.ice_servers.len(), 1);

        let settings = with_turn().connection_settings(true);
        assert_eq!(settings.ice_transport_policy, IceTransportPolicy::Relay);
        assert_eq!(settings.ice_servers.len(), 2);
        assert_eq!(settings.ice_servers[1].username, "user");

        let settings = with_turn().connection_settings(false);
        assert_eq!(settings.ice_transport_policy, IceTransportPolicy::All);
    }

    #[test]
    fn test_turn_cli_parsing() {
        let turn = TurnServerConfig::parse_cli("turn:t.example.com|alice|pw|x").unwrap();
        assert_eq!(turn.username, "alice");
        assert_eq!(turn.credential, "pw|x");
        assert!(TurnServerConfig::parse_cli("turn:t.example.com").is_err());
    }

    #[test]
    fn test_glare_from_str() {
        assert_eq!(
            "perfect-negotiation".parse::<GlareStrategy>().unwrap(),
            GlareStrategy::PerfectNegotiation
        );
        assert_eq!(
            "last_offer_wins".parse::<GlareStrategy>().unwrap(),
            GlareStrategy::LastOfferWins
        );
        assert!("polite".parse::<GlareStrategy>().is_err());
    }
}
