//! In-process room relay
//!
//! Implements the relay contract the meeting server provides: stamp
//! `source`, forward to `target` when present and to every other room
//! member otherwise, and announce LEAVE for a member whose link drops.
//! Payloads are handled as opaque JSON objects, like the real server.

use super::channel::{SignalingConnector, SignalingLink};
use super::protocol::SignalingEnvelope;
use crate::types::ClientId;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

struct Member {
    tx: mpsc::UnboundedSender<Result<String>>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct RelayState {
    rooms: HashMap<String, HashMap<String, Member>>,
    /// Every message received, as (room, source, stamped payload)
    history: Vec<(String, String, Value)>,
}

/// Loopback relay connecting any number of in-process clients
///
/// # Example
///
/// ```
/// # tokio_test::block_on(async {
/// use meeting_rtc::{MemoryRelay, SignalingConnector};
/// use url::Url;
///
/// let relay = MemoryRelay::new();
/// let url = Url::parse("ws://localhost/ws/standup/alice").unwrap();
/// let _link = relay.open(&url).await.unwrap();
/// assert_eq!(relay.members("standup").len(), 1);
/// # });
/// ```
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Member ids currently in a room
    pub fn members(&self, room: &str) -> Vec<ClientId> {
        let state = self.state.lock();
        let mut ids: Vec<ClientId> = state
            .rooms
            .get(room)
            .map(|members| members.keys().map(|id| ClientId::from(id.as_str())).collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Envelopes the relay received from `client`, in order
    pub fn sent_by(&self, client: &ClientId) -> Vec<SignalingEnvelope> {
        let state = self.state.lock();
        state
            .history
            .iter()
            .filter(|(_, source, _)| source == client.as_str())
            .filter_map(|(_, _, value)| serde_json::from_value(value.clone()).ok())
            .collect()
    }

    /// Drop a member's link as if its network went away
    pub fn sever(&self, client: &ClientId) {
        let removed = {
            let mut state = self.state.lock();
            let room = state
                .rooms
                .iter()
                .find(|(_, members)| members.contains_key(client.as_str()))
                .map(|(room, _)| room.clone());
            room.and_then(|room| {
                state
                    .rooms
                    .get_mut(&room)
                    .and_then(|members| members.remove(client.as_str()))
                    .map(|member| (room, member))
            })
        };
        if let Some((room, member)) = removed {
            info!(client_id = %client, room = %room, "Severing relay member");
            member.task.abort();
            drop(member.tx);
            Self::announce_leave(&self.state, &room, client.as_str());
        }
    }

    fn parse_path(url: &Url) -> Result<(String, String)> {
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();
        match segments.as_slice() {
            ["ws", room, client] => Ok((room.to_string(), client.to_string())),
            _ => Err(Error::SignalingTransport(format!(
                "relay path must be /ws/<room>/<client>: {}",
                url
            ))),
        }
    }

    /// Stamp and route one message
    fn route(state: &Arc<Mutex<RelayState>>, room: &str, source: &str, text: &str) {
        let mut object: Map<String, Value> = match serde_json::from_str(text) {
            Ok(Value::Object(object)) => object,
            _ => {
                warn!(source, "Relay dropping non-object message");
                return;
            }
        };
        object.insert("source".to_string(), Value::String(source.to_string()));
        let target = object
            .get("target")
            .and_then(Value::as_str)
            .map(str::to_string);
        let payload = Value::Object(object);
        let text = payload.to_string();

        let mut state = state.lock();
        state
            .history
            .push((room.to_string(), source.to_string(), payload));
        let Some(members) = state.rooms.get(room) else {
            return;
        };
        match target {
            Some(target) => match members.get(&target) {
                Some(member) => {
                    let _ = member.tx.send(Ok(text));
                }
                None => debug!(source, target, "Relay target not in room"),
            },
            None => {
                for (id, member) in members {
                    if id != source {
                        let _ = member.tx.send(Ok(text.clone()));
                    }
                }
            }
        }
    }

    fn announce_leave(state: &Arc<Mutex<RelayState>>, room: &str, client: &str) {
        let text = json!({"type": "LEAVE", "clientId": client}).to_string();
        let state = state.lock();
        if let Some(members) = state.rooms.get(room) {
            for member in members.values() {
                let _ = member.tx.send(Ok(text.clone()));
            }
        }
    }

    /// Forwarding task for one member; announces LEAVE when its link drops
    async fn member_task(
        state: Arc<Mutex<RelayState>>,
        room: String,
        client: String,
        mut outgoing: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(text) = outgoing.recv().await {
            Self::route(&state, &room, &client, &text);
        }

        let was_member = state
            .lock()
            .rooms
            .get_mut(&room)
            .and_then(|members| members.remove(&client))
            .is_some();
        if was_member {
            debug!(client_id = %client, room = %room, "Relay member link dropped");
            Self::announce_leave(&state, &room, &client);
        }
    }
}

#[async_trait]
impl SignalingConnector for MemoryRelay {
    async fn open(&self, url: &Url) -> Result<SignalingLink> {
        let (room, client) = Self::parse_path(url)?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        let members = state.rooms.entry(room.clone()).or_default();
        if members.contains_key(&client) {
            return Err(Error::SignalingTransport(format!(
                "client {} already in room {}",
                client, room
            )));
        }
        let task = tokio::spawn(Self::member_task(
            self.state.clone(),
            room.clone(),
            client.clone(),
            out_rx,
        ));
        members.insert(client, Member { tx: in_tx, task });

        Ok(SignalingLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(room: &str, client: &str) -> Url {
        Url::parse(&format!("ws://relay.local/ws/{}/{}", room, client)).unwrap()
    }

    async fn next_json(link: &mut SignalingLink) -> Value {
        let text = link.incoming.recv().await.unwrap().unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_stamps_source() {
        let relay = MemoryRelay::new();
        let mut a = relay.open(&url("r", "a")).await.unwrap();
        let mut b = relay.open(&url("r", "b")).await.unwrap();
        let mut c = relay.open(&url("r", "c")).await.unwrap();

        a.outgoing
            .send(r#"{"type":"CHAT_MESSAGE","message":"hi"}"#.to_string())
            .unwrap();

        for link in [&mut b, &mut c] {
            let msg = next_json(link).await;
            assert_eq!(msg["source"], "a");
            assert_eq!(msg["message"], "hi");
        }
        assert!(a.incoming.try_recv().is_err());
        assert_eq!(relay.members("r").len(), 3);
    }

    #[tokio::test]
    async fn test_targeted_delivery_only() {
        let relay = MemoryRelay::new();
        let a = relay.open(&url("r", "a")).await.unwrap();
        let mut b = relay.open(&url("r", "b")).await.unwrap();
        let mut c = relay.open(&url("r", "c")).await.unwrap();

        a.outgoing
            .send(r#"{"type":"ICE_RESTART","target":"c"}"#.to_string())
            .unwrap();

        let msg = next_json(&mut c).await;
        assert_eq!(msg["type"], "ICE_RESTART");
        assert!(b.incoming.try_recv().is_err());

        let sent = relay.sent_by(&ClientId::from("a"));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].source(), Some(&ClientId::from("a")));
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let relay = MemoryRelay::new();
        let a = relay.open(&url("one", "a")).await.unwrap();
        let mut b = relay.open(&url("two", "b")).await.unwrap();

        a.outgoing
            .send(r#"{"type":"JOIN","clientId":"a"}"#.to_string())
            .unwrap();
        tokio::task::yield_now().await;
        assert!(b.incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_link_announces_leave() {
        let relay = MemoryRelay::new();
        let a = relay.open(&url("r", "a")).await.unwrap();
        let mut b = relay.open(&url("r", "b")).await.unwrap();

        drop(a);
        let msg = next_json(&mut b).await;
        assert_eq!(msg, json!({"type": "LEAVE", "clientId": "a"}));
        assert_eq!(relay.members("r"), vec![ClientId::from("b")]);
    }

    #[tokio::test]
    async fn test_sever_closes_link_and_announces_leave() {
        let relay = MemoryRelay::new();
        let mut a = relay.open(&url("r", "a")).await.unwrap();
        let mut b = relay.open(&url("r", "b")).await.unwrap();

        relay.sever(&ClientId::from("a"));
        assert!(a.incoming.recv().await.is_none());
        let msg = next_json(&mut b).await;
        assert_eq!(msg["type"], "LEAVE");
    }

    #[tokio::test]
    async fn test_bad_path_and_duplicate_member_rejected() {
        let relay = MemoryRelay::new();
        let bad = Url::parse("ws://relay.local/socket").unwrap();
        assert!(relay.open(&bad).await.is_err());

        let _a = relay.open(&url("r", "a")).await.unwrap();
        assert!(relay.open(&url("r", "a")).await.is_err());
    }
}
