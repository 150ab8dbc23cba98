//! Identifier types shared across the meeting client

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque per-session participant id.
///
/// Generated fresh on every connect and never persisted, so rejoining a
/// room yields a new id. Ordering is plain string ordering; the perfect
/// negotiation glare strategy uses it to pick the polite side.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random id in UUID v4 simple form (32 hex chars, no dashes)
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of a meeting room, used as one path segment of the signaling URL
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

impl RoomName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidConfig("room name must not be empty".to_string()));
        }
        if trimmed.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "room name must be a single path segment: {}",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Derive the room from the path of the meeting page.
    ///
    /// The last non-empty segment wins, so `/meeting/standup/` and
    /// `/meeting/standup?x=1` both yield `standup`.
    pub fn from_page_path(path: &str) -> Result<Self> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let segment = path
            .split('/')
            .rev()
            .find(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                Error::InvalidConfig(format!("no room name in page path: {:?}", path))
            })?;
        Self::new(segment)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for RoomName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<RoomName> for String {
    fn from(room: RoomName) -> Self {
        room.0
    }
}

/// Identity of one created RTC connection.
///
/// A replacement connection for the same peer gets a new id, which lets
/// late engine events and timer firings for the old one be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_client_ids_are_unique_and_simple() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(!a.as_str().contains('-'));
    }

    #[test]
    fn test_client_id_serializes_as_plain_string() {
        let id = ClientId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }

    #[test]
    fn test_room_from_page_path() {
        assert_eq!(RoomName::from_page_path("/meeting/standup").unwrap().as_str(), "standup");
        assert_eq!(RoomName::from_page_path("/meeting/standup/").unwrap().as_str(), "standup");
        assert_eq!(
            RoomName::from_page_path("/meeting/retro?tab=chat#x").unwrap().as_str(),
            "retro"
        );
        assert!(RoomName::from_page_path("/").is_err());
        assert!(RoomName::from_page_path("").is_err());
    }

    #[test]
    fn test_room_rejects_nested_path() {
        assert!(RoomName::new("a/b").is_err());
        assert!(RoomName::new("  ").is_err());
        assert_eq!(RoomName::new(" daily ").unwrap().as_str(), "daily");
    }

    #[test]
    fn test_connection_ids_differ() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
