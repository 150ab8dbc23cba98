//! Per-peer connection state machine
//!
//! A `PeerConnection` is owned by the manager and only touched from the
//! session task, so every operation takes `&mut self` and no locking is
//! needed. It wraps one engine connection and tracks everything needed to
//! negotiate it: role, held and pending candidates, the offer waiting out
//! its grace period, the remote tile and the pending timer.

use super::engine::{
    CandidatePriority, IceCandidate, RemoteTrackInfo, RtcConnection, SessionDescription,
    SignalingState, TransportState,
};
use super::lifecycle::ScheduledTask;
use super::state::{NegotiationRole, PeerState, StatusBadge};
use crate::session::events::RemoteMediaState;
use crate::types::{ClientId, ConnectionId};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What the front end shows for one remote participant
#[derive(Debug, Clone, Default)]
pub struct RemoteTile {
    pub tracks: Vec<RemoteTrackInfo>,
    pub badge: Option<StatusBadge>,
    pub media: RemoteMediaState,
}

/// Read-only snapshot of one peer entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerInfo {
    pub client_id: ClientId,
    pub state: PeerState,
    pub badge: Option<StatusBadge>,
    pub attempts: u32,
    pub relay_candidate_seen: bool,
    pub connected_for: Option<Duration>,
}

fn negotiation_error(step: &str, e: Error) -> Error {
    match e {
        Error::Negotiation(_) => e,
        other => Error::Negotiation(format!("{}: {}", step, other)),
    }
}

/// Offer waiting out the grace period, with the timer that releases it
struct HeldOffer {
    offer: SessionDescription,
    ice_restart: bool,
    _release: ScheduledTask,
}

/// Connection entry for one remote participant
pub struct PeerConnection {
    remote_id: ClientId,
    connection_id: ConnectionId,
    rtc: Arc<dyn RtcConnection>,
    state: PeerState,
    transport: TransportState,
    role: Option<NegotiationRole>,
    /// Created with a relay-only ICE policy
    relay_only: bool,
    relay_candidate_seen: bool,
    remote_description_set: bool,
    /// Origin of the remote side's descriptions on this connection
    remote_session: Option<String>,
    /// Remote candidates waiting for the remote description
    pending_remote: Vec<(CandidatePriority, IceCandidate)>,
    /// Local candidates gathered before our description went out
    held_local: Vec<IceCandidate>,
    description_announced: bool,
    /// Local offer set but not yet sent
    pending_offer: Option<HeldOffer>,
    tile: RemoteTile,
    timer: Option<ScheduledTask>,
    connected_at: Option<Instant>,
}

impl PeerConnection {
    pub fn new(remote_id: ClientId, connection_id: ConnectionId, rtc: Arc<dyn RtcConnection>) -> Self {
        Self {
            remote_id,
            connection_id,
            rtc,
            state: PeerState::New,
            transport: TransportState::New,
            role: None,
            relay_only: false,
            relay_candidate_seen: false,
            remote_description_set: false,
            remote_session: None,
            pending_remote: Vec::new(),
            held_local: Vec::new(),
            description_announced: false,
            pending_offer: None,
            tile: RemoteTile::default(),
            timer: None,
            connected_at: None,
        }
    }

    pub fn remote_id(&self) -> &ClientId {
        &self.remote_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport
    }

    pub fn role(&self) -> Option<NegotiationRole> {
        self.role
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.rtc.signaling_state()
    }

    pub fn relay_only(&self) -> bool {
        self.relay_only
    }

    pub fn set_relay_only(&mut self, relay_only: bool) {
        self.relay_only = relay_only;
    }

    pub fn relay_candidate_seen(&self) -> bool {
        self.relay_candidate_seen
    }

    pub fn tile(&self) -> &RemoteTile {
        &self.tile
    }

    pub fn rtc(&self) -> &Arc<dyn RtcConnection> {
        &self.rtc
    }

    pub fn has_pending_offer(&self) -> bool {
        self.pending_offer.is_some()
    }

    /// Our offer is outstanding: set locally, sent or about to be
    pub fn is_offer_pending(&self) -> bool {
        self.rtc.signaling_state() == SignalingState::HaveLocalOffer
    }

    /// The offer renegotiates the remote connection we already talk to.
    /// An offer from a rebuilt remote connection carries a new origin.
    pub fn continues_session(&self, offer: &SessionDescription) -> bool {
        match (&self.remote_session, offer.session_id()) {
            (Some(known), Some(offered)) => *known == offered,
            _ => false,
        }
    }

    /// Carry what the front end shows over from the entry this one replaces
    pub fn inherit_tile(&mut self, previous: RemoteTile) {
        self.tile.media = previous.media;
        self.tile.badge = previous.badge;
    }

    /// Move to `next` if the state machine allows it. Returns true on change.
    pub fn set_state(&mut self, next: PeerState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition(next) {
            warn!(peer_id = %self.remote_id, from = %self.state, to = %next, "Ignoring invalid state transition");
            return false;
        }
        debug!(peer_id = %self.remote_id, from = %self.state, to = %next, "Peer state change");
        self.state = next;
        true
    }

    // ========================================================================
    // Offer / answer
    // ========================================================================

    /// Create and set a local offer. Only valid from stable: a pending
    /// offer cannot be withdrawn, the caller replaces the entry instead.
    pub async fn start_offer(&mut self, ice_restart: bool) -> Result<SessionDescription> {
        match self.rtc.signaling_state() {
            SignalingState::Stable => {}
            state => {
                return Err(Error::Negotiation(format!(
                    "cannot create offer in signaling state {}",
                    state
                )))
            }
        }

        let offer = self
            .rtc
            .create_offer(ice_restart)
            .await
            .map_err(|e| negotiation_error("create offer", e))?;
        self.rtc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| negotiation_error("set local offer", e))?;
        let after = self.rtc.signaling_state();
        if after != SignalingState::HaveLocalOffer {
            return Err(Error::Negotiation(format!(
                "local offer left connection in signaling state {}",
                after
            )));
        }

        self.description_announced = false;
        self.role = Some(NegotiationRole::OfferSent);
        if self.state == PeerState::New {
            self.set_state(PeerState::Negotiating(NegotiationRole::OfferSent));
        }
        info!(peer_id = %self.remote_id, ice_restart, "Local offer created");
        Ok(offer)
    }

    /// Apply a remote offer and produce our answer. Only valid from
    /// stable; on glare the caller answers from a fresh entry.
    pub async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription> {
        match self.rtc.signaling_state() {
            SignalingState::Stable => {}
            state => {
                return Err(Error::Negotiation(format!(
                    "cannot accept offer in signaling state {}",
                    state
                )))
            }
        }

        let session = offer.session_id();
        self.rtc
            .set_remote_description(offer)
            .await
            .map_err(|e| negotiation_error("set remote offer", e))?;
        self.remote_description_set = true;
        self.remote_session = session;
        self.apply_pending_remote().await;

        let answer = self
            .rtc
            .create_answer()
            .await
            .map_err(|e| negotiation_error("create answer", e))?;
        self.rtc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| negotiation_error("set local answer", e))?;
        let after = self.rtc.signaling_state();
        if after != SignalingState::Stable {
            return Err(Error::Negotiation(format!(
                "local answer left connection in signaling state {}",
                after
            )));
        }

        self.description_announced = false;
        self.role = Some(NegotiationRole::AnswerSent);
        if matches!(self.state, PeerState::New | PeerState::Negotiating(_)) {
            self.set_state(PeerState::Negotiating(NegotiationRole::AnswerSent));
        }
        info!(peer_id = %self.remote_id, "Answer created");
        Ok(answer)
    }

    /// Apply the remote answer. Returns false when no local offer is
    /// outstanding and the answer was ignored.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<bool> {
        if self.rtc.signaling_state() != SignalingState::HaveLocalOffer || self.pending_offer.is_some()
        {
            return Ok(false);
        }
        let session = answer.session_id();
        self.rtc
            .set_remote_description(answer)
            .await
            .map_err(|e| negotiation_error("set remote answer", e))?;
        self.remote_description_set = true;
        self.remote_session = session;
        self.apply_pending_remote().await;
        info!(peer_id = %self.remote_id, "Answer applied");
        Ok(true)
    }

    /// Hold a freshly set offer until `release` fires. The held offer owns
    /// its timer, so closing the entry cancels the release too.
    pub fn hold_offer(&mut self, offer: SessionDescription, ice_restart: bool, release: ScheduledTask) {
        self.pending_offer = Some(HeldOffer {
            offer,
            ice_restart,
            _release: release,
        });
    }

    /// Release the held offer for sending, if it is still current
    pub fn take_pending_offer(&mut self) -> Option<(SessionDescription, bool)> {
        if self.rtc.signaling_state() != SignalingState::HaveLocalOffer {
            self.pending_offer = None;
        }
        self.pending_offer
            .take()
            .map(|held| (held.offer, held.ice_restart))
    }

    // ========================================================================
    // Candidates
    // ========================================================================

    /// Apply a remote candidate now, or queue it until the remote
    /// description is set
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
        priority: CandidatePriority,
    ) -> Result<()> {
        if !self.remote_description_set {
            debug!(peer_id = %self.remote_id, "Queueing remote candidate");
            self.pending_remote.push((priority, candidate));
            return Ok(());
        }
        self.rtc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| negotiation_error("add candidate", e))
    }

    async fn apply_pending_remote(&mut self) {
        if self.pending_remote.is_empty() {
            return;
        }
        let mut pending = std::mem::take(&mut self.pending_remote);
        pending.sort_by_key(|(priority, _)| *priority);
        debug!(peer_id = %self.remote_id, count = pending.len(), "Applying queued remote candidates");
        for (_, candidate) in pending {
            if let Err(e) = self.rtc.add_ice_candidate(candidate).await {
                warn!(peer_id = %self.remote_id, "Queued candidate rejected: {}", e);
            }
        }
    }

    /// Record a gathered local candidate. Returns it when it can be sent
    /// right away; otherwise it is held for `mark_description_announced`.
    pub fn on_local_candidate(&mut self, candidate: IceCandidate) -> Option<(IceCandidate, CandidatePriority)> {
        if candidate.is_relay() && !self.relay_candidate_seen {
            debug!(peer_id = %self.remote_id, "Relay candidate gathered");
            self.relay_candidate_seen = true;
        }
        if self.description_announced {
            let priority = CandidatePriority::for_candidate(&candidate);
            Some((candidate, priority))
        } else {
            self.held_local.push(candidate);
            None
        }
    }

    /// Our description went out: flush held candidates, relay first
    pub fn mark_description_announced(&mut self) -> Vec<(IceCandidate, CandidatePriority)> {
        self.description_announced = true;
        let mut held: Vec<(IceCandidate, CandidatePriority)> = self
            .held_local
            .drain(..)
            .map(|c| {
                let priority = CandidatePriority::for_candidate(&c);
                (c, priority)
            })
            .collect();
        held.sort_by_key(|(_, priority)| *priority);
        held
    }

    // ========================================================================
    // Transport
    // ========================================================================

    /// Fold an engine transport report into the peer state. Returns the new
    /// state when it changed.
    pub fn on_transport_state(&mut self, transport: TransportState) -> Option<PeerState> {
        self.transport = transport;
        let next = match (transport, self.state) {
            (_, PeerState::Closed) => return None,
            (TransportState::Connecting, PeerState::New | PeerState::Negotiating(_))
            | (TransportState::Connecting, PeerState::Recovering | PeerState::Disconnected) => {
                PeerState::Connecting
            }
            (TransportState::Connected, PeerState::Failed) => return None,
            (TransportState::Connected, _) => {
                if self.connected_at.is_none() {
                    self.connected_at = Some(Instant::now());
                }
                PeerState::Connected
            }
            (TransportState::Disconnected, PeerState::Recovering) => return None,
            (TransportState::Disconnected, _) => PeerState::Disconnected,
            (TransportState::Failed, _) => PeerState::Failed,
            _ => return None,
        };
        if !matches!(next, PeerState::Connected) {
            self.connected_at = None;
        }
        self.set_state(next).then_some(next)
    }

    // ========================================================================
    // Tile and timers
    // ========================================================================

    pub fn add_remote_track(&mut self, track: RemoteTrackInfo) -> bool {
        if self.tile.tracks.iter().any(|t| t.track_id == track.track_id) {
            return false;
        }
        self.tile.tracks.push(track);
        true
    }

    pub fn set_badge(&mut self, badge: Option<StatusBadge>) -> bool {
        if self.tile.badge == badge {
            return false;
        }
        self.tile.badge = badge;
        true
    }

    pub fn set_remote_media(&mut self, media: RemoteMediaState) {
        self.tile.media = media;
    }

    pub fn set_timer(&mut self, timer: ScheduledTask) {
        self.timer = Some(timer);
    }

    pub fn clear_timer(&mut self) {
        self.timer = None;
    }

    pub fn has_timer(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Terminal failure: stop media and timers but keep the entry so the
    /// tile can show the failure until the peer leaves or is retried
    pub async fn mark_failed(&mut self) {
        self.timer = None;
        self.pending_offer = None;
        self.set_state(PeerState::Failed);
        self.set_badge(Some(StatusBadge::ConnectionFailed));
        if let Err(e) = self.rtc.close().await {
            debug!(peer_id = %self.remote_id, "Closing failed connection: {}", e);
        }
    }

    /// Release the connection and its timer
    pub async fn close(&mut self) {
        self.timer = None;
        self.pending_offer = None;
        self.set_state(PeerState::Closed);
        if let Err(e) = self.rtc.close().await {
            warn!(peer_id = %self.remote_id, "Error closing connection: {}", e);
        }
        info!(peer_id = %self.remote_id, connection_id = %self.connection_id, "Peer connection closed");
    }

    pub fn info(&self, attempts: u32) -> PeerInfo {
        PeerInfo {
            client_id: self.remote_id.clone(),
            state: self.state,
            badge: self.tile.badge,
            attempts,
            relay_candidate_seen: self.relay_candidate_seen,
            connected_for: self.connected_at.map(|at| at.elapsed()),
        }
    }
}
