//! Meeting test harness
//!
//! Runs several `MeetingSession`s in one room against an in-process
//! `MemoryRelay`, each with its own `FakeEngine`, so whole join, negotiate
//! and recover flows can be driven without a network.
//!
//! Basic usage pattern:
//!
//! 1. Create a `MeetingHarness` for a room
//! 2. Add participants with `harness.join()`
//! 3. Wait on peer snapshots or events with the `TestParticipant` helpers
//! 4. Inspect what each participant sent through `harness.relay.sent_by()`

#![allow(dead_code)]

use meeting_rtc::testing::{FakeConnection, FakeDevices, FakeEngine};
use meeting_rtc::{
    ClientId, MeetingConfig, MeetingEvent, MeetingSession, MemoryRelay, PeerInfo, PeerState,
    RoomName, SignalingEnvelope,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a wait may take before the test fails
pub const WAIT: Duration = Duration::from_secs(10);

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Join error: {0}")]
    Join(#[from] meeting_rtc::Error),

    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,meeting_rtc=debug")
        .with_test_writer()
        .try_init();
}

/// Config used by harness participants: no offer grace period
pub fn test_config() -> MeetingConfig {
    MeetingConfig {
        server_origin: "http://relay.local".to_string(),
        offer_grace_ms: 0,
        ..Default::default()
    }
}

/// One room on one relay
pub struct MeetingHarness {
    pub relay: MemoryRelay,
    pub room: RoomName,
    config: MeetingConfig,
}

impl MeetingHarness {
    pub fn new(room: &str) -> Self {
        Self::with_config(room, test_config())
    }

    pub fn with_config(room: &str, config: MeetingConfig) -> Self {
        init_logging();
        Self {
            relay: MemoryRelay::new(),
            room: RoomName::new(room).expect("valid room name"),
            config,
        }
    }

    /// Join with all capture devices available
    pub async fn join(&self) -> TestParticipant {
        self.join_with(FakeDevices::default())
            .await
            .expect("participant joins")
    }

    pub async fn join_with(&self, devices: FakeDevices) -> HarnessResult<TestParticipant> {
        let engine = FakeEngine::new();
        let mut session = MeetingSession::join(
            self.config.clone(),
            self.room.clone(),
            Arc::new(engine.clone()),
            Arc::new(devices),
            &self.relay,
        )
        .await?;
        let events = session.take_events().expect("fresh event stream");
        self.wait_join_routed(session.client_id()).await?;
        Ok(TestParticipant {
            session,
            engine,
            events,
        })
    }

    /// Wait until the relay has routed `client`'s JOIN, so that members
    /// joining later never receive it and only answer
    async fn wait_join_routed(&self, client: &ClientId) -> HarnessResult<()> {
        let routed = tokio::time::timeout(WAIT, async {
            while self.sent_of_kind(client, "JOIN").is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        routed.map_err(|_| HarnessError::Timeout(format!("JOIN of {} never routed", client)))
    }

    /// Envelopes of one kind that `client` sent
    pub fn sent_of_kind(&self, client: &ClientId, kind: &str) -> Vec<SignalingEnvelope> {
        self.relay
            .sent_by(client)
            .into_iter()
            .filter(|envelope| envelope.kind() == kind)
            .collect()
    }

    /// ICE-restart offers `from` sent to `to`
    pub fn restart_offers(&self, from: &ClientId, to: &ClientId) -> usize {
        self.relay
            .sent_by(from)
            .iter()
            .filter(|envelope| {
                matches!(
                    envelope,
                    SignalingEnvelope::Offer { target, ice_restart: true, .. } if target == to
                )
            })
            .count()
    }
}

/// A joined session with its fake engine and event stream
pub struct TestParticipant {
    pub session: MeetingSession,
    pub engine: FakeEngine,
    pub events: mpsc::UnboundedReceiver<MeetingEvent>,
}

impl TestParticipant {
    pub fn id(&self) -> ClientId {
        self.session.client_id().clone()
    }

    /// Current engine connection towards `peer`
    pub fn connection_to(&self, peer: &TestParticipant) -> Arc<FakeConnection> {
        self.engine
            .latest_for(&peer.id())
            .expect("connection to peer")
    }

    pub fn peer(&self, id: &ClientId) -> Option<PeerInfo> {
        self.session
            .participants()
            .into_iter()
            .find(|info| info.client_id == *id)
    }

    /// Wait until the peer snapshot satisfies `predicate`
    pub async fn wait_for_peers(
        &self,
        mut predicate: impl FnMut(&[PeerInfo]) -> bool,
    ) -> HarnessResult<Vec<PeerInfo>> {
        let mut rx = self.session.watch_participants();
        let waited = tokio::time::timeout(WAIT * 30, async {
            rx.wait_for(|peers| predicate(peers))
                .await
                .map(|peers| peers.clone())
        })
        .await;
        match waited {
            Ok(Ok(peers)) => Ok(peers),
            Ok(Err(_)) => Err(HarnessError::Timeout("session stopped".to_string())),
            Err(_) => Err(HarnessError::Timeout(format!(
                "peers never matched, last: {:?}",
                self.session.participants()
            ))),
        }
    }

    /// Wait until `id` is listed in `state`
    pub async fn wait_for_state(&self, id: &ClientId, state: PeerState) -> HarnessResult<PeerInfo> {
        let peers = self
            .wait_for_peers(|peers| {
                peers
                    .iter()
                    .any(|info| info.client_id == *id && info.state == state)
            })
            .await?;
        peers
            .into_iter()
            .find(|info| info.client_id == *id)
            .ok_or_else(|| HarnessError::Timeout(format!("{} vanished", id)))
    }

    /// Wait until connected to exactly `ids`
    pub async fn wait_connected_to(&self, ids: &[ClientId]) -> HarnessResult<()> {
        self.wait_for_peers(|peers| {
            peers.len() == ids.len()
                && ids.iter().all(|id| {
                    peers
                        .iter()
                        .any(|info| info.client_id == *id && info.state == PeerState::Connected)
                })
        })
        .await
        .map(|_| ())
    }

    /// Wait for the first event matching `predicate`, skipping others
    pub async fn wait_for_event(
        &mut self,
        mut predicate: impl FnMut(&MeetingEvent) -> bool,
    ) -> HarnessResult<MeetingEvent> {
        let waited = tokio::time::timeout(WAIT, async {
            while let Some(event) = self.events.recv().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await;
        match waited {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(HarnessError::Timeout("event stream ended".to_string())),
            Err(_) => Err(HarnessError::Timeout("event never arrived".to_string())),
        }
    }

    /// Events already delivered
    pub fn drain_events(&mut self) -> Vec<MeetingEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Join two participants and wait until they are connected to each other
pub async fn connected_pair(harness: &MeetingHarness) -> (TestParticipant, TestParticipant) {
    let a = harness.join().await;
    let b = harness.join().await;
    a.wait_connected_to(&[b.id()]).await.expect("a connects");
    b.wait_connected_to(&[a.id()]).await.expect("b connects");
    (a, b)
}
