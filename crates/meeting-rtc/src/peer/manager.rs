//! Peer connection management
//!
//! The manager owns every `PeerConnection` of one session, keyed by remote
//! client id. It is owned by the session task; other tasks only see the
//! snapshots it publishes through a `watch` channel.

use super::connection::{PeerConnection, PeerInfo, RemoteTile};
use super::engine::{ConnectionEventSink, RtcEngine};
use crate::config::{ConnectionSettings, IceTransportPolicy};
use crate::media::LocalMediaSource;
use crate::session::events::{EventSink, MeetingEvent};
use crate::types::{ClientId, ConnectionId};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

/// Manages the mesh of peer connections for one session
pub struct PeerConnectionManager {
    engine: Arc<dyn RtcEngine>,
    media: Arc<LocalMediaSource>,
    events: EventSink,
    max_peers: usize,
    peers: HashMap<ClientId, PeerConnection>,
    snapshot: watch::Sender<Vec<PeerInfo>>,
}

impl PeerConnectionManager {
    pub fn new(
        engine: Arc<dyn RtcEngine>,
        media: Arc<LocalMediaSource>,
        events: EventSink,
        max_peers: usize,
    ) -> Self {
        let (snapshot, _) = watch::channel(Vec::new());
        Self {
            engine,
            media,
            events,
            max_peers,
            peers: HashMap::new(),
            snapshot,
        }
    }

    /// Create the entry for `remote`, replacing any existing one.
    ///
    /// `sink_for` builds the event dispatcher for the new connection id.
    /// Local tracks are attached before the entry becomes visible. A
    /// replacement keeps the remote media state and badge of the tile.
    #[instrument(skip(self, settings, sink_for), fields(peer_id = %remote))]
    pub async fn create(
        &mut self,
        remote: &ClientId,
        settings: &ConnectionSettings,
        sink_for: impl FnOnce(ConnectionId) -> ConnectionEventSink,
    ) -> Result<&mut PeerConnection> {
        let previous = self.remove_entry(remote).await;
        let replacing = previous.is_some();
        if !replacing && self.peers.len() >= self.max_peers {
            warn!(max_peers = self.max_peers, "Peer limit reached, not connecting");
            return Err(Error::PeerLimit(self.max_peers));
        }

        let connection_id = ConnectionId::new();
        let rtc = match self
            .engine
            .create_connection(remote, settings, sink_for(connection_id))
            .await
        {
            Ok(rtc) => rtc,
            Err(e) => {
                if replacing {
                    self.events.emit(MeetingEvent::ParticipantLeft {
                        client_id: remote.clone(),
                    });
                }
                return Err(e);
            }
        };
        if let Err(e) = self.media.attach(connection_id, rtc.as_ref()).await {
            if let Err(close_err) = rtc.close().await {
                warn!("Error closing half-built connection: {}", close_err);
            }
            self.media.detach(connection_id).await;
            if replacing {
                self.events.emit(MeetingEvent::ParticipantLeft {
                    client_id: remote.clone(),
                });
            }
            return Err(e);
        }

        info!(connection_id = %connection_id, replacing, "Peer connection created");
        if !replacing {
            self.events.emit(MeetingEvent::ParticipantJoined {
                client_id: remote.clone(),
            });
        }

        let mut entry = PeerConnection::new(remote.clone(), connection_id, rtc);
        entry.set_relay_only(settings.ice_transport_policy == IceTransportPolicy::Relay);
        if let Some(tile) = previous {
            entry.inherit_tile(tile);
        }
        let entry = self.peers.entry(remote.clone()).or_insert(entry);
        Ok(entry)
    }

    /// Close and drop the entry without telling the front end, handing
    /// back its tile
    async fn remove_entry(&mut self, remote: &ClientId) -> Option<RemoteTile> {
        let mut entry = self.peers.remove(remote)?;
        entry.close().await;
        self.media.detach(entry.connection_id()).await;
        Some(entry.tile().clone())
    }

    /// Close and remove the entry for `remote`: connection, timer, tile and
    /// map entry together. Unknown ids are a no-op.
    pub async fn close(&mut self, remote: &ClientId) -> bool {
        if self.remove_entry(remote).await.is_none() {
            return false;
        }
        self.events.emit(MeetingEvent::ParticipantLeft {
            client_id: remote.clone(),
        });
        true
    }

    pub async fn close_all(&mut self) {
        let ids: Vec<ClientId> = self.peers.keys().cloned().collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    pub fn get(&self, remote: &ClientId) -> Option<&PeerConnection> {
        self.peers.get(remote)
    }

    pub fn get_mut(&mut self, remote: &ClientId) -> Option<&mut PeerConnection> {
        self.peers.get_mut(remote)
    }

    /// Look up the entry only if it is still the connection `connection_id`
    pub fn get_current(
        &mut self,
        remote: &ClientId,
        connection_id: ConnectionId,
    ) -> Option<&mut PeerConnection> {
        self.peers
            .get_mut(remote)
            .filter(|entry| entry.connection_id() == connection_id)
    }

    pub fn contains(&self, remote: &ClientId) -> bool {
        self.peers.contains_key(remote)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Publish a fresh snapshot of every entry
    pub fn publish(&self, attempts: impl Fn(&ClientId) -> u32) {
        let mut infos: Vec<PeerInfo> = self
            .peers
            .values()
            .map(|entry| entry.info(attempts(entry.remote_id())))
            .collect();
        infos.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        self.snapshot.send_if_modified(|current| {
            if *current == infos {
                false
            } else {
                *current = infos;
                true
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PeerInfo>> {
        self.snapshot.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConstraints;
    use crate::testing::{FakeDevices, FakeEngine};

    async fn manager(max_peers: usize) -> (PeerConnectionManager, FakeEngine) {
        let media = LocalMediaSource::new(Arc::new(FakeDevices::default()));
        media.acquire(&MediaConstraints::default()).await.unwrap();
        let engine = FakeEngine::new();
        let (events, _rx) = EventSink::channel();
        (
            PeerConnectionManager::new(Arc::new(engine.clone()), media, events, max_peers),
            engine,
        )
    }

    fn sink(_: ConnectionId) -> ConnectionEventSink {
        ConnectionEventSink::new(|_| true)
    }

    #[tokio::test]
    async fn test_create_attaches_local_tracks() {
        let (mut manager, engine) = manager(4).await;
        let remote = ClientId::from("b");
        manager
            .create(&remote, &ConnectionSettings::default(), sink)
            .await
            .unwrap();
        let fake = engine.latest_for(&remote).unwrap();
        assert!(fake.audio_track_id().is_some());
        assert!(fake.video_track_id().is_some());
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_create_replaces_existing_entry() {
        let (mut manager, engine) = manager(4).await;
        let remote = ClientId::from("b");
        let first = manager
            .create(&remote, &ConnectionSettings::default(), sink)
            .await
            .unwrap()
            .connection_id();
        let old = engine.latest_for(&remote).unwrap();

        let second = manager
            .create(&remote, &ConnectionSettings::default(), sink)
            .await
            .unwrap()
            .connection_id();

        assert_ne!(first, second);
        assert_eq!(manager.len(), 1);
        assert!(old.is_closed());
        assert_eq!(engine.count_for(&remote), 2);
        assert!(manager.get_current(&remote, first).is_none());
        assert!(manager.get_current(&remote, second).is_some());
    }

    #[tokio::test]
    async fn test_replacement_keeps_remote_media_state() {
        let (mut manager, _engine) = manager(4).await;
        let remote = ClientId::from("b");
        let entry = manager
            .create(&remote, &ConnectionSettings::default(), sink)
            .await
            .unwrap();
        entry.set_remote_media(crate::session::events::RemoteMediaState {
            audio_enabled: false,
            video_enabled: false,
        });

        let replacement = manager
            .create(&remote, &ConnectionSettings::default(), sink)
            .await
            .unwrap();
        assert!(!replacement.tile().media.audio_enabled);
        assert!(!replacement.tile().media.video_enabled);

        // A participant seen again after leaving starts from defaults.
        manager.close(&remote).await;
        let fresh = manager
            .create(&remote, &ConnectionSettings::default(), sink)
            .await
            .unwrap();
        assert!(fresh.tile().media.audio_enabled);
    }

    #[tokio::test]
    async fn test_peer_limit() {
        let (mut manager, _engine) = manager(1).await;
        manager
            .create(&ClientId::from("b"), &ConnectionSettings::default(), sink)
            .await
            .unwrap();
        let err = manager
            .create(&ClientId::from("c"), &ConnectionSettings::default(), sink)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::PeerLimit(1)));
        // Replacing an existing peer is still allowed at the limit.
        assert!(manager
            .create(&ClientId::from("b"), &ConnectionSettings::default(), sink)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut manager, engine) = manager(4).await;
        let remote = ClientId::from("b");
        manager
            .create(&remote, &ConnectionSettings::default(), sink)
            .await
            .unwrap();
        assert!(manager.close(&remote).await);
        assert!(!manager.close(&remote).await);
        assert!(!manager.close(&ClientId::from("never-seen")).await);
        assert!(manager.is_empty());
        assert!(engine.latest_for(&remote).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_snapshot_publishing() {
        let (mut manager, _engine) = manager(4).await;
        let mut snapshots = manager.subscribe();
        manager
            .create(&ClientId::from("c"), &ConnectionSettings::default(), sink)
            .await
            .unwrap();
        manager
            .create(&ClientId::from("b"), &ConnectionSettings::default(), sink)
            .await
            .unwrap();
        manager.publish(|_| 0);

        snapshots.changed().await.unwrap();
        let infos = snapshots.borrow_and_update().clone();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].client_id, ClientId::from("b"));
        assert_eq!(manager.ids(), vec![ClientId::from("b"), ClientId::from("c")]);
    }
}
