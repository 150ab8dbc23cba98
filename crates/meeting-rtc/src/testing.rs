//! In-process fakes for the RTC engine and capture devices
//!
//! `FakeConnection` follows the same signaling-state rules as a real peer
//! connection (offers only from stable or have-local-offer, answers only
//! against a remote offer, no remote offer while a local one is pending)
//! and gathers a scripted set of local candidates whenever a local
//! description is set.
//!
//! Two fakes only connect as a real pair would: when the offerer applies
//! the answer made for its own offer, both sides report Connecting then
//! Connected. Every fake description carries its connection's origin and
//! a token tying answers to offers. A pair where both sides answered, or
//! an answer made for another offer, never connects. Descriptions written
//! by hand (no token) connect the side that applies them, so a single
//! fake can be driven without a partner.
//!
//! Tests drive failures through `emit_transport_state` and the failure
//! switches on `FakeEngine`.

use crate::config::{ConnectionSettings, IceTransportPolicy, MediaConstraints};
use crate::media::{LocalTrack, MediaDevices, MediaKind, MediaStream, TrackSource};
use crate::peer::{
    ConnectionEvent, ConnectionEventSink, IceCandidate, RemoteTrackInfo, RtcConnection,
    RtcEngine, RtcSender, SdpType, SessionDescription, SignalingState, TransportState,
};
use crate::types::ClientId;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;
use uuid::Uuid;

// ============================================================================
// Engine
// ============================================================================

#[derive(Default)]
struct EngineShared {
    connections: Mutex<Vec<(ClientId, Arc<FakeConnection>)>>,
    manual_connect: AtomicBool,
    fail_offers: AtomicBool,
    fail_creates: AtomicU32,
}

/// Engine handing out `FakeConnection`s. Clones share state, so a test can
/// keep one clone and give the other to a session.
#[derive(Clone, Default)]
pub struct FakeEngine {
    shared: Arc<EngineShared>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent connection created towards `remote`
    pub fn latest_for(&self, remote: &ClientId) -> Option<Arc<FakeConnection>> {
        self.shared
            .connections
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == remote)
            .map(|(_, conn)| conn.clone())
    }

    /// Connections ever created towards `remote`
    pub fn count_for(&self, remote: &ClientId) -> usize {
        self.shared
            .connections
            .lock()
            .iter()
            .filter(|(id, _)| id == remote)
            .count()
    }

    /// Connections not yet closed
    pub fn open_connections(&self) -> usize {
        self.shared
            .connections
            .lock()
            .iter()
            .filter(|(_, conn)| !conn.is_closed())
            .count()
    }

    /// Connections towards `remote` not yet closed
    pub fn open_for(&self, remote: &ClientId) -> usize {
        self.shared
            .connections
            .lock()
            .iter()
            .filter(|(id, conn)| id == remote && !conn.is_closed())
            .count()
    }

    /// Stop (or resume) connecting automatically after negotiation, for
    /// existing and future connections
    pub fn set_auto_connect(&self, enabled: bool) {
        self.shared.manual_connect.store(!enabled, Ordering::SeqCst);
    }

    /// Make every `create_offer` fail, for existing and future connections
    pub fn fail_offers(&self, fail: bool) {
        self.shared.fail_offers.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` connection creations
    pub fn fail_next_creates(&self, count: u32) {
        self.shared.fail_creates.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl RtcEngine for FakeEngine {
    async fn create_connection(
        &self,
        remote: &ClientId,
        settings: &ConnectionSettings,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn RtcConnection>> {
        let refused = self
            .shared
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::WebRtc("injected create failure".to_string()));
        }
        let conn = FakeConnection::new(settings.clone(), events, Some(self.shared.clone()));
        self.shared
            .connections
            .lock()
            .push((remote.clone(), conn.clone()));
        Ok(conn)
    }
}

// ============================================================================
// Connection
// ============================================================================

const OFFER_TOKEN: &str = "fake-offer";
const ANSWER_TO: &str = "fake-answer-to";

/// Answerers waiting for their offerer to apply the answer, by offer token.
/// Process wide, since each participant has its own engine.
fn waiting_answerers() -> &'static Mutex<HashMap<String, Weak<FakeConnection>>> {
    static WAITING: OnceLock<Mutex<HashMap<String, Weak<FakeConnection>>>> = OnceLock::new();
    WAITING.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Value of `a=<name>:<value>` in a fake description
fn attribute<'a>(desc: &'a SessionDescription, name: &str) -> Option<&'a str> {
    desc.sdp.lines().find_map(|line| {
        line.strip_prefix("a=")?
            .strip_prefix(name)?
            .strip_prefix(':')
    })
}

struct FakeState {
    signaling: SignalingState,
    transport: TransportState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    /// Bumped for every description this connection creates
    version: u32,
    offers_created: u32,
    last_offer_ice_restart: bool,
    applied: Vec<IceCandidate>,
    senders: Vec<Arc<FakeSender>>,
    gathered: u32,
    tracks_announced: bool,
}

/// Fake peer connection with honest signaling-state rules
pub struct FakeConnection {
    me: Weak<FakeConnection>,
    /// Origin session id, fixed for the life of the connection
    session: String,
    settings: ConnectionSettings,
    events: ConnectionEventSink,
    engine: Option<Arc<EngineShared>>,
    state: Mutex<FakeState>,
}

impl FakeConnection {
    fn new(
        settings: ConnectionSettings,
        events: ConnectionEventSink,
        engine: Option<Arc<EngineShared>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            session: Uuid::new_v4().simple().to_string(),
            settings,
            events,
            engine,
            state: Mutex::new(FakeState {
                signaling: SignalingState::Stable,
                transport: TransportState::New,
                local: None,
                remote: None,
                version: 0,
                offers_created: 0,
                last_offer_ice_restart: false,
                applied: Vec::new(),
                senders: Vec::new(),
                gathered: 0,
                tracks_announced: false,
            }),
        })
    }

    /// Connection outside any engine whose events go nowhere
    pub fn standalone() -> Arc<Self> {
        Self::new(
            ConnectionSettings::default(),
            ConnectionEventSink::new(|_| true),
            None,
        )
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn offers_created(&self) -> u32 {
        self.state.lock().offers_created
    }

    pub fn last_offer_ice_restart(&self) -> bool {
        self.state.lock().last_offer_ice_restart
    }

    /// Remote candidates handed to the connection, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == SignalingState::Closed
    }

    pub fn transport_state(&self) -> TransportState {
        self.state.lock().transport
    }

    pub fn video_track_id(&self) -> Option<String> {
        self.track_id(MediaKind::Video)
    }

    pub fn audio_track_id(&self) -> Option<String> {
        self.track_id(MediaKind::Audio)
    }

    fn track_id(&self, kind: MediaKind) -> Option<String> {
        self.state
            .lock()
            .senders
            .iter()
            .find(|sender| sender.kind == kind)
            .and_then(|sender| sender.current_track_id())
    }

    /// Report a transport state as the engine would
    pub fn emit_transport_state(&self, transport: TransportState) {
        self.state.lock().transport = transport;
        self.events
            .emit(ConnectionEvent::TransportStateChanged(transport));
    }

    fn auto_connect(&self) -> bool {
        self.engine
            .as_ref()
            .map_or(true, |engine| !engine.manual_connect.load(Ordering::SeqCst))
    }

    fn offers_fail(&self) -> bool {
        self.engine
            .as_ref()
            .is_some_and(|engine| engine.fail_offers.load(Ordering::SeqCst))
    }

    fn gather(&self, state: &mut FakeState) -> Vec<ConnectionEvent> {
        state.gathered += 1;
        let round = state.gathered;
        let relay_only = self.settings.ice_transport_policy == IceTransportPolicy::Relay;
        let has_turn = self
            .settings
            .ice_servers
            .iter()
            .flat_map(|server| server.urls.iter())
            .any(|url| url.starts_with("turn"));

        let mut events = Vec::new();
        if !relay_only {
            events.push(ConnectionEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{} 1 udp 2130706431 192.0.2.{} 50000 typ host",
                round, round
            ))));
        }
        if has_turn {
            events.push(ConnectionEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{} 1 udp 41885439 203.0.113.{} 3478 typ relay",
                round + 100,
                round
            ))));
        }
        events.push(ConnectionEvent::GatheringComplete);
        events
    }

    /// Connecting/Connected once both descriptions are in place
    fn connect_if_ready(&self, state: &mut FakeState) -> Vec<ConnectionEvent> {
        let ready = state.signaling == SignalingState::Stable
            && state.local.is_some()
            && state.remote.is_some();
        if !ready || state.transport == TransportState::Connected || !self.auto_connect() {
            return Vec::new();
        }
        state.transport = TransportState::Connected;
        let mut events = vec![
            ConnectionEvent::TransportStateChanged(TransportState::Connecting),
            ConnectionEvent::TransportStateChanged(TransportState::Connected),
        ];
        if !state.tracks_announced {
            state.tracks_announced = true;
            for kind in [MediaKind::Audio, MediaKind::Video] {
                events.push(ConnectionEvent::RemoteTrack(RemoteTrackInfo {
                    track_id: format!("remote-{}", kind),
                    stream_id: "remote".to_string(),
                    kind,
                }));
            }
        }
        events
    }

    /// `o=` line shared by every description of this connection
    fn origin(&self, state: &mut FakeState) -> String {
        state.version += 1;
        format!("o=fake {} {} IN IP4 0.0.0.0", self.session, state.version)
    }

    /// Our answer is set: connect now for a hand-written offer, otherwise
    /// wait for the offerer to apply the answer
    fn answered(&self, state: &mut FakeState) -> Vec<ConnectionEvent> {
        let token = state
            .remote
            .as_ref()
            .and_then(|offer| attribute(offer, OFFER_TOKEN))
            .map(str::to_string);
        match token {
            Some(token) => {
                waiting_answerers().lock().insert(token, self.me.clone());
                Vec::new()
            }
            None => self.connect_if_ready(state),
        }
    }

    /// The offerer applied our answer
    fn paired(&self) {
        let events = {
            let mut state = self.state.lock();
            self.connect_if_ready(&mut state)
        };
        self.dispatch(events);
    }

    fn dispatch(&self, events: Vec<ConnectionEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn closed_error() -> Error {
        Error::Negotiation("connection is closed".to_string())
    }
}

#[async_trait]
impl RtcConnection for FakeConnection {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<Arc<dyn RtcSender>> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(Error::MediaTrack("connection is closed".to_string()));
        }
        let sender = Arc::new(FakeSender::new(track));
        state.senders.push(sender.clone());
        Ok(sender)
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        if self.offers_fail() {
            return Err(Error::Negotiation("injected offer failure".to_string()));
        }
        let mut state = self.state.lock();
        match state.signaling {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {}
            SignalingState::Closed => return Err(Self::closed_error()),
            other => {
                return Err(Error::Negotiation(format!(
                    "createOffer in signaling state {}",
                    other
                )))
            }
        }
        state.offers_created += 1;
        state.last_offer_ice_restart = ice_restart;
        let origin = self.origin(&mut state);
        Ok(SessionDescription::offer(format!(
            "v=0\r\n{}\r\na=ice-restart:{}\r\na={}:{}-{}\r\n",
            origin, ice_restart, OFFER_TOKEN, self.session, state.version
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(Error::Negotiation(format!(
                "createAnswer in signaling state {}",
                state.signaling
            )));
        }
        let origin = self.origin(&mut state);
        let answer_to = state
            .remote
            .as_ref()
            .and_then(|offer| attribute(offer, OFFER_TOKEN))
            .map(|token| format!("a={}:{}\r\n", ANSWER_TO, token))
            .unwrap_or_default();
        Ok(SessionDescription::answer(format!(
            "v=0\r\n{}\r\n{}",
            origin, answer_to
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let events = {
            let mut state = self.state.lock();
            let next = match (desc.sdp_type, state.signaling) {
                (_, SignalingState::Closed) => return Err(Self::closed_error()),
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (sdp_type, current) => {
                    return Err(Error::Negotiation(format!(
                        "local {:?} in signaling state {}",
                        sdp_type, current
                    )))
                }
            };
            let answering = desc.sdp_type == SdpType::Answer;
            state.signaling = next;
            state.local = Some(desc);
            let mut events = self.gather(&mut state);
            if answering {
                events.extend(self.answered(&mut state));
            }
            events
        };
        self.dispatch(events);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let (events, matched) = {
            let mut state = self.state.lock();
            let next = match (desc.sdp_type, state.signaling) {
                (_, SignalingState::Closed) => return Err(Self::closed_error()),
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (sdp_type, current) => {
                    return Err(Error::Negotiation(format!(
                        "remote {:?} in signaling state {}",
                        sdp_type, current
                    )))
                }
            };
            if desc.sdp_type == SdpType::Offer {
                state.signaling = next;
                state.remote = Some(desc);
                return Ok(());
            }

            let our_offer = state
                .local
                .as_ref()
                .and_then(|offer| attribute(offer, OFFER_TOKEN))
                .map(str::to_string);
            let answered = attribute(&desc, ANSWER_TO).map(str::to_string);
            state.signaling = next;
            state.remote = Some(desc);
            match answered {
                None => (self.connect_if_ready(&mut state), None),
                Some(token) if Some(&token) == our_offer.as_ref() => {
                    let partner = self.auto_connect().then_some(token);
                    (self.connect_if_ready(&mut state), partner)
                }
                Some(token) => {
                    debug!(token = %token, "Answer was made for another offer, not connecting");
                    (Vec::new(), None)
                }
            }
        };
        self.dispatch(events);

        let partner = matched.and_then(|token| waiting_answerers().lock().remove(&token));
        if let Some(answerer) = partner.and_then(|weak| weak.upgrade()) {
            answerer.paired();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(Self::closed_error());
        }
        if state.remote.is_none() {
            return Err(Error::Negotiation(
                "candidate before remote description".to_string(),
            ));
        }
        state.applied.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.signaling = SignalingState::Closed;
        state.transport = TransportState::Closed;
        Ok(())
    }
}

/// Sender recording which local track it carries
pub struct FakeSender {
    kind: MediaKind,
    current: Mutex<Arc<LocalTrack>>,
}

impl FakeSender {
    fn new(track: Arc<LocalTrack>) -> Self {
        Self {
            kind: track.kind(),
            current: Mutex::new(track),
        }
    }
}

#[async_trait]
impl RtcSender for FakeSender {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn replace_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        if track.kind() != self.kind {
            return Err(Error::MediaTrack(format!(
                "cannot replace {} track with {} track",
                self.kind,
                track.kind()
            )));
        }
        *self.current.lock() = track;
        Ok(())
    }

    fn current_track_id(&self) -> Option<String> {
        Some(self.current.lock().id().to_string())
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Capture devices with switchable availability
#[derive(Debug, Clone, Copy)]
pub struct FakeDevices {
    pub microphone: bool,
    pub camera: bool,
    pub display: bool,
    pub denied: bool,
}

impl Default for FakeDevices {
    fn default() -> Self {
        Self {
            microphone: true,
            camera: true,
            display: true,
            denied: false,
        }
    }
}

impl FakeDevices {
    /// The user refuses the permission prompt
    pub fn denied() -> Self {
        Self {
            denied: true,
            ..Self::default()
        }
    }

    pub fn audio_only() -> Self {
        Self {
            camera: false,
            ..Self::default()
        }
    }

    /// No display capture support
    pub fn without_display() -> Self {
        Self {
            display: false,
            ..Self::default()
        }
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        if self.denied {
            return Err(Error::MediaAccess("permission denied".to_string()));
        }
        let stream = MediaStream {
            audio: (constraints.audio && self.microphone)
                .then(|| LocalTrack::new(TrackSource::Microphone)),
            video: (constraints.video && self.camera).then(|| LocalTrack::new(TrackSource::Camera)),
        };
        if stream.is_empty() {
            return Err(Error::MediaAccess("no capture device".to_string()));
        }
        Ok(stream)
    }

    async fn get_display_media(&self) -> Result<Arc<LocalTrack>> {
        if self.denied || !self.display {
            return Err(Error::MediaAccess("display capture unavailable".to_string()));
        }
        Ok(LocalTrack::new(TrackSource::Screen))
    }
}
