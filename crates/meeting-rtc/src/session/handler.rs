//! Signaling protocol handler
//!
//! Interprets inbound envelopes, connection events, timer firings and
//! session commands, one at a time, and drives the peer manager and the
//! recovery policy. It is owned by the session task; nothing else touches
//! the peer map.

use super::events::{EventSink, MeetingEvent, RemoteMediaState};
use crate::config::{GlareStrategy, MeetingConfig};
use crate::media::LocalMediaSource;
use crate::peer::{
    CandidatePriority, ConnectionEvent, ConnectionEventSink, FailureDecision, IceCandidate,
    NegotiationRole, PeerConnectionManager, PeerInfo, PeerState, RecoveryDecision,
    RecoveryPolicy, RtcEngine, ScheduledTask, SessionDescription, StatusBadge, TransportState,
};
use crate::signaling::{SignalingEnvelope, SignalingSender};
use crate::types::{ClientId, ConnectionId};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Which timer fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Held offer may go out now
    OfferGrace,
    /// Recovery backoff or watchdog
    Recovery,
}

/// Requests from the session facade
#[derive(Debug)]
pub(crate) enum Command {
    RetryPeer {
        client_id: ClientId,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

/// Everything besides inbound envelopes that the session task processes
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Connection {
        client_id: ClientId,
        connection_id: ConnectionId,
        event: ConnectionEvent,
    },
    Timer {
        client_id: ClientId,
        connection_id: ConnectionId,
        kind: TimerKind,
    },
    Command(Command),
}

/// Event dispatcher for one created connection, tagged with its ids
fn connection_sink(
    tx: mpsc::UnboundedSender<SessionEvent>,
    client_id: ClientId,
) -> impl FnOnce(ConnectionId) -> ConnectionEventSink {
    move |connection_id| {
        ConnectionEventSink::new(move |event| {
            tx.send(SessionEvent::Connection {
                client_id: client_id.clone(),
                connection_id,
                event,
            })
            .is_ok()
        })
    }
}

pub(crate) struct SignalingProtocolHandler {
    local_id: ClientId,
    config: MeetingConfig,
    manager: PeerConnectionManager,
    recovery: RecoveryPolicy,
    signaling: SignalingSender,
    events: EventSink,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SignalingProtocolHandler {
    pub fn new(
        local_id: ClientId,
        config: MeetingConfig,
        engine: Arc<dyn RtcEngine>,
        media: Arc<LocalMediaSource>,
        signaling: SignalingSender,
        events: EventSink,
        session_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let manager = PeerConnectionManager::new(engine, media, events.clone(), config.max_peers);
        let recovery = RecoveryPolicy::new(&config);
        Self {
            local_id,
            config,
            manager,
            recovery,
            signaling,
            events,
            session_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PeerInfo>> {
        self.manager.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn manager(&self) -> &PeerConnectionManager {
        &self.manager
    }

    fn publish(&self) {
        self.manager.publish(|id| self.recovery.attempts(id));
    }

    fn report(&self, context: &str, e: Error) {
        if e.is_silent() {
            debug!("{}: {}", context, e);
        } else {
            warn!("{}: {}", context, e);
        }
    }

    // ========================================================================
    // Inbound envelopes
    // ========================================================================

    /// Handle one relayed envelope. Failures stay contained to the peer.
    pub async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        let kind = envelope.kind();
        debug!(kind, source = ?envelope.source(), "Handling signaling envelope");
        if let Err(e) = self.dispatch_envelope(envelope).await {
            self.report(kind, e);
        }
        self.publish();
    }

    async fn dispatch_envelope(&mut self, envelope: SignalingEnvelope) -> Result<()> {
        if let Some(target) = envelope.target() {
            if *target != self.local_id {
                trace!(target = %target, "Envelope not addressed to us");
                return Ok(());
            }
        }
        let source = envelope.source().cloned();
        if source.as_ref() == Some(&self.local_id) {
            trace!("Ignoring our own envelope");
            return Ok(());
        }
        let missing_source = || Error::SignalingTransport("envelope without source".to_string());

        match envelope {
            SignalingEnvelope::Join { client_id } => self.on_join(client_id).await,
            SignalingEnvelope::Leave { client_id } => {
                self.on_leave(&client_id).await;
                Ok(())
            }
            SignalingEnvelope::Offer {
                offer, ice_restart, ..
            } => {
                let remote = source.ok_or_else(missing_source)?;
                self.on_offer(remote, offer, ice_restart).await
            }
            SignalingEnvelope::Answer { answer, .. } => {
                let remote = source.ok_or_else(missing_source)?;
                self.on_answer(&remote, answer).await
            }
            SignalingEnvelope::Candidate {
                candidate,
                priority,
                ..
            } => {
                let remote = source.ok_or_else(missing_source)?;
                self.on_candidate(&remote, candidate, priority).await
            }
            SignalingEnvelope::IceRestart { force_relay, .. } => {
                let remote = source.ok_or_else(missing_source)?;
                self.on_ice_restart(remote, force_relay).await
            }
            SignalingEnvelope::AudioToggle { enabled, .. } => {
                let remote = source.ok_or_else(missing_source)?;
                self.on_media_toggle(remote, |media| media.audio_enabled = enabled);
                Ok(())
            }
            SignalingEnvelope::VideoToggle { enabled, .. } => {
                let remote = source.ok_or_else(missing_source)?;
                self.on_media_toggle(remote, |media| media.video_enabled = enabled);
                Ok(())
            }
            SignalingEnvelope::ChatMessage { message, .. } => {
                let remote = source.ok_or_else(missing_source)?;
                self.events.emit(MeetingEvent::ChatMessage {
                    client_id: remote,
                    message,
                });
                Ok(())
            }
        }
    }

    /// A new participant: connect and offer
    async fn on_join(&mut self, remote: ClientId) -> Result<()> {
        if remote == self.local_id {
            return Ok(());
        }
        info!(peer_id = %remote, "Participant joined, offering");
        self.recovery.forget(&remote);
        self.replace_and_offer(&remote, false, false).await
    }

    async fn on_leave(&mut self, remote: &ClientId) {
        if *remote == self.local_id {
            return;
        }
        if self.manager.close(remote).await {
            info!(peer_id = %remote, "Participant left");
        } else {
            debug!(peer_id = %remote, "LEAVE for unknown participant");
        }
        self.recovery.forget(remote);
    }

    async fn on_offer(
        &mut self,
        remote: ClientId,
        offer: SessionDescription,
        ice_restart: bool,
    ) -> Result<()> {
        let (live, colliding, continues) = match self.manager.get(&remote) {
            Some(entry) if !entry.state().is_terminal() => (
                true,
                entry.is_offer_pending(),
                entry.continues_session(&offer),
            ),
            _ => (false, false, false),
        };
        if colliding && self.config.glare == GlareStrategy::PerfectNegotiation {
            let polite = self.local_id > remote;
            if !polite {
                info!(peer_id = %remote, "Glare: ignoring colliding offer as impolite peer");
                return Ok(());
            }
        }

        // A pending local offer cannot be withdrawn, and an offer from a
        // rebuilt remote connection cannot be applied to ours. Either way
        // we answer from a fresh entry.
        let fresh = !live || colliding || !continues;
        if fresh {
            if live {
                info!(peer_id = %remote, colliding, ice_restart, "Answering from a new connection");
            }
            self.create_entry(&remote, false).await?;
        } else {
            debug!(peer_id = %remote, ice_restart, "Renegotiating existing connection");
        }

        let entry = self
            .manager
            .get_mut(&remote)
            .ok_or_else(|| Error::PeerNotFound(remote.to_string()))?;
        let answer = match entry.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                if fresh {
                    self.abandon(&remote).await;
                }
                return Err(e);
            }
        };

        self.signaling
            .send(SignalingEnvelope::Answer {
                answer,
                target: remote.clone(),
                source: None,
            })
            .await?;
        self.announce_description(&remote).await;
        Ok(())
    }

    async fn on_answer(&mut self, remote: &ClientId, answer: SessionDescription) -> Result<()> {
        let entry = self
            .manager
            .get_mut(remote)
            .ok_or_else(|| Error::PeerNotFound(remote.to_string()))?;
        if !entry.accept_answer(answer).await? {
            info!(peer_id = %remote, "Ignoring ANSWER without a pending offer");
        }
        Ok(())
    }

    async fn on_candidate(
        &mut self,
        remote: &ClientId,
        candidate: IceCandidate,
        priority: CandidatePriority,
    ) -> Result<()> {
        let entry = self
            .manager
            .get_mut(remote)
            .ok_or_else(|| Error::CandidateOrphan(remote.to_string()))?;
        if entry.state().is_terminal() {
            debug!(peer_id = %remote, "Dropping candidate for failed connection");
            return Ok(());
        }
        entry.add_remote_candidate(candidate, priority).await
    }

    /// The answering side asks us to restart ICE
    async fn on_ice_restart(&mut self, remote: ClientId, force_relay: bool) -> Result<()> {
        let terminal = self
            .manager
            .get(&remote)
            .ok_or_else(|| Error::PeerNotFound(remote.to_string()))?
            .state()
            .is_terminal();
        if force_relay || terminal {
            info!(peer_id = %remote, force_relay, "ICE restart requested, rebuilding connection");
            return self.replace_and_offer(&remote, true, force_relay).await;
        }
        info!(peer_id = %remote, "ICE restart requested");
        self.send_offer(&remote, true).await
    }

    fn on_media_toggle(&mut self, remote: ClientId, apply: impl FnOnce(&mut RemoteMediaState)) {
        let mut media = self
            .manager
            .get(&remote)
            .map(|entry| entry.tile().media)
            .unwrap_or_default();
        apply(&mut media);
        if let Some(entry) = self.manager.get_mut(&remote) {
            entry.set_remote_media(media);
        }
        self.events.emit(MeetingEvent::RemoteMediaToggled {
            client_id: remote,
            media,
        });
    }

    // ========================================================================
    // Negotiation helpers
    // ========================================================================

    async fn create_entry(&mut self, remote: &ClientId, force_relay: bool) -> Result<()> {
        let settings = self.config.connection_settings(force_relay);
        let sink_for = connection_sink(self.session_tx.clone(), remote.clone());
        self.manager.create(remote, &settings, sink_for).await?;
        Ok(())
    }

    /// Build a fresh connection for `remote` and offer on it. If no valid
    /// offer comes out, the entry and its tile are removed.
    async fn replace_and_offer(
        &mut self,
        remote: &ClientId,
        ice_restart: bool,
        force_relay: bool,
    ) -> Result<()> {
        self.create_entry(remote, force_relay).await?;
        if let Err(e) = self.send_offer(remote, ice_restart).await {
            warn!(peer_id = %remote, "Abandoning connection without a valid offer: {}", e);
            self.abandon(remote).await;
            return Err(e);
        }
        Ok(())
    }

    /// Create and set an offer, then send it now or after the grace period.
    /// An earlier offer still unanswered is replaced together with its
    /// connection.
    async fn send_offer(&mut self, remote: &ClientId, ice_restart: bool) -> Result<()> {
        let unanswered = self
            .manager
            .get(remote)
            .ok_or_else(|| Error::PeerNotFound(remote.to_string()))?;
        if unanswered.is_offer_pending() {
            let relay_only = unanswered.relay_only();
            info!(peer_id = %remote, "Previous offer unanswered, replacing the connection");
            self.create_entry(remote, relay_only).await?;
        }

        let grace = self.config.offer_grace();
        let entry = self
            .manager
            .get_mut(remote)
            .ok_or_else(|| Error::PeerNotFound(remote.to_string()))?;
        let offer = entry.start_offer(ice_restart).await?;

        if !grace.is_zero() {
            let release = ScheduledTask::after(
                grace,
                self.session_tx.clone(),
                SessionEvent::Timer {
                    client_id: remote.clone(),
                    connection_id: entry.connection_id(),
                    kind: TimerKind::OfferGrace,
                },
            );
            entry.hold_offer(offer, ice_restart, release);
            debug!(peer_id = %remote, ?grace, "Holding offer for grace period");
            return Ok(());
        }

        self.transmit_offer(remote, offer, ice_restart).await
    }

    async fn transmit_offer(
        &mut self,
        remote: &ClientId,
        offer: SessionDescription,
        ice_restart: bool,
    ) -> Result<()> {
        self.signaling
            .send(SignalingEnvelope::Offer {
                offer,
                target: remote.clone(),
                source: None,
                ice_restart,
            })
            .await?;
        debug!(peer_id = %remote, ice_restart, "Offer sent");
        self.announce_description(remote).await;
        Ok(())
    }

    /// Our description is out: flush held local candidates
    async fn announce_description(&mut self, remote: &ClientId) {
        let Some(entry) = self.manager.get_mut(remote) else {
            return;
        };
        let held = entry.mark_description_announced();
        for (candidate, priority) in held {
            self.send_candidate(remote, candidate, priority).await;
        }
    }

    async fn send_candidate(
        &self,
        remote: &ClientId,
        candidate: IceCandidate,
        priority: CandidatePriority,
    ) {
        let envelope = SignalingEnvelope::Candidate {
            candidate,
            target: remote.clone(),
            source: None,
            priority,
        };
        if let Err(e) = self.signaling.send(envelope).await {
            warn!(peer_id = %remote, "Failed to send candidate: {}", e);
        }
    }

    /// Remove an entry whose negotiation could not proceed
    async fn abandon(&mut self, remote: &ClientId) {
        self.manager.close(remote).await;
        self.recovery.forget(remote);
    }

    fn set_badge(&mut self, remote: &ClientId, badge: Option<StatusBadge>) {
        let changed = self
            .manager
            .get_mut(remote)
            .is_some_and(|entry| entry.set_badge(badge));
        if changed {
            self.events.emit(MeetingEvent::StatusBadge {
                client_id: remote.clone(),
                badge,
            });
        }
    }

    fn emit_state(&self, remote: &ClientId, state: PeerState) {
        self.events.emit(MeetingEvent::PeerStateChanged {
            client_id: remote.clone(),
            state,
        });
    }

    // ========================================================================
    // Connection events and timers
    // ========================================================================

    /// Handle a connection event, timer or command. Returns false once the
    /// session should stop.
    pub async fn handle_session_event(&mut self, event: SessionEvent) -> bool {
        let keep_running = match event {
            SessionEvent::Connection {
                client_id,
                connection_id,
                event,
            } => {
                if let Err(e) = self
                    .on_connection_event(&client_id, connection_id, event)
                    .await
                {
                    self.report("connection event", e);
                }
                true
            }
            SessionEvent::Timer {
                client_id,
                connection_id,
                kind,
            } => {
                let result = match kind {
                    TimerKind::OfferGrace => self.on_grace_elapsed(&client_id, connection_id).await,
                    TimerKind::Recovery => self.on_recovery_timer(&client_id, connection_id).await,
                };
                if let Err(e) = result {
                    self.report("timer", e);
                }
                true
            }
            SessionEvent::Command(Command::RetryPeer { client_id, reply }) => {
                let result = self.retry_peer(&client_id).await;
                let _ = reply.send(result);
                true
            }
            SessionEvent::Command(Command::Leave { reply }) => {
                self.manager.close_all().await;
                let _ = reply.send(());
                false
            }
        };
        self.publish();
        keep_running
    }

    async fn on_connection_event(
        &mut self,
        remote: &ClientId,
        connection_id: ConnectionId,
        event: ConnectionEvent,
    ) -> Result<()> {
        let Some(entry) = self.manager.get_current(remote, connection_id) else {
            trace!(peer_id = %remote, "Dropping event for a replaced connection");
            return Ok(());
        };
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                if let Some((candidate, priority)) = entry.on_local_candidate(candidate) {
                    self.send_candidate(remote, candidate, priority).await;
                }
            }
            ConnectionEvent::GatheringComplete => {
                debug!(peer_id = %remote, "ICE gathering complete");
            }
            ConnectionEvent::RemoteTrack(track) => {
                if entry.add_remote_track(track.clone()) {
                    info!(peer_id = %remote, kind = %track.kind, "Remote track added");
                    self.events.emit(MeetingEvent::RemoteTrackAdded {
                        client_id: remote.clone(),
                        track,
                    });
                }
            }
            ConnectionEvent::TransportStateChanged(transport) => {
                self.on_transport_state(remote, connection_id, transport)
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_transport_state(
        &mut self,
        remote: &ClientId,
        connection_id: ConnectionId,
        transport: TransportState,
    ) -> Result<()> {
        let Some(entry) = self.manager.get_current(remote, connection_id) else {
            return Ok(());
        };
        let Some(state) = entry.on_transport_state(transport) else {
            return Ok(());
        };
        self.events.emit(MeetingEvent::PeerStateChanged {
            client_id: remote.clone(),
            state,
        });

        match state {
            PeerState::Connected => {
                info!(peer_id = %remote, "Peer connected");
                entry.clear_timer();
                self.recovery.on_connected(remote);
                self.set_badge(remote, None);
            }
            PeerState::Disconnected => {
                if entry.has_timer() {
                    return Ok(());
                }
                let delay = self.recovery.initial_delay(remote);
                info!(peer_id = %remote, ?delay, "Peer disconnected, scheduling recovery");
                entry.set_timer(ScheduledTask::after(
                    delay,
                    self.session_tx.clone(),
                    SessionEvent::Timer {
                        client_id: remote.clone(),
                        connection_id,
                        kind: TimerKind::Recovery,
                    },
                ));
                let badge = StatusBadge::Reconnecting {
                    attempt: self.recovery.attempts(remote) + 1,
                    max_attempts: self.recovery.max_attempts(),
                };
                self.set_badge(remote, Some(badge));
            }
            PeerState::Failed => self.on_engine_failed(remote).await?,
            _ => {}
        }
        Ok(())
    }

    /// Engine gave up on the connection: replace it while budget remains
    async fn on_engine_failed(&mut self, remote: &ClientId) -> Result<()> {
        match self.recovery.on_failed(remote) {
            FailureDecision::Replace {
                attempt,
                force_relay,
            } => {
                warn!(peer_id = %remote, attempt, force_relay, "Connection failed, replacing");
                self.replace_and_offer(remote, true, force_relay).await?;
                let badge = StatusBadge::Reconnecting {
                    attempt,
                    max_attempts: self.recovery.max_attempts(),
                };
                self.set_badge(remote, Some(badge));
                Ok(())
            }
            FailureDecision::GiveUp { attempts } => {
                self.give_up(remote, attempts).await;
                Ok(())
            }
        }
    }

    async fn give_up(&mut self, remote: &ClientId, attempts: u32) {
        let Some(entry) = self.manager.get_mut(remote) else {
            return;
        };
        warn!(peer_id = %remote, attempts, "Giving up on peer");
        let was_failed = entry.state() == PeerState::Failed;
        entry.mark_failed().await;
        if !was_failed {
            self.emit_state(remote, PeerState::Failed);
        }
        self.events.emit(MeetingEvent::StatusBadge {
            client_id: remote.clone(),
            badge: Some(StatusBadge::ConnectionFailed),
        });
    }

    async fn on_grace_elapsed(&mut self, remote: &ClientId, connection_id: ConnectionId) -> Result<()> {
        let Some(entry) = self.manager.get_current(remote, connection_id) else {
            return Ok(());
        };
        match entry.take_pending_offer() {
            Some((offer, ice_restart)) => self.transmit_offer(remote, offer, ice_restart).await,
            None => {
                debug!(peer_id = %remote, "Held offer was superseded");
                Ok(())
            }
        }
    }

    /// Backoff elapsed: run one recovery attempt if the peer is still down
    async fn on_recovery_timer(&mut self, remote: &ClientId, connection_id: ConnectionId) -> Result<()> {
        let Some(entry) = self.manager.get_current(remote, connection_id) else {
            return Ok(());
        };
        let state = entry.state();
        if state.is_connected() || state.is_terminal() {
            return Ok(());
        }

        match self.recovery.next_attempt(remote) {
            RecoveryDecision::Retry { attempt, delay } => {
                let Some(entry) = self.manager.get_current(remote, connection_id) else {
                    return Ok(());
                };
                if entry.set_state(PeerState::Recovering) {
                    self.events.emit(MeetingEvent::PeerStateChanged {
                        client_id: remote.clone(),
                        state: PeerState::Recovering,
                    });
                }
                let offerer = entry.role() == Some(NegotiationRole::OfferSent);
                let badge = StatusBadge::Reconnecting {
                    attempt,
                    max_attempts: self.recovery.max_attempts(),
                };
                self.set_badge(remote, Some(badge));

                let result = if offerer {
                    self.send_offer(remote, true).await
                } else {
                    self.signaling
                        .send(SignalingEnvelope::IceRestart {
                            target: remote.clone(),
                            source: None,
                            force_relay: false,
                        })
                        .await
                };
                if let Err(e) = result {
                    warn!(peer_id = %remote, attempt, "Recovery attempt failed: {}", e);
                }

                // Watchdog for this attempt, on whichever connection now
                // serves the peer
                if let Some(entry) = self.manager.get_mut(remote) {
                    if !entry.state().is_terminal() {
                        let connection_id = entry.connection_id();
                        entry.set_timer(ScheduledTask::after(
                            delay,
                            self.session_tx.clone(),
                            SessionEvent::Timer {
                                client_id: remote.clone(),
                                connection_id,
                                kind: TimerKind::Recovery,
                            },
                        ));
                    }
                }
                Ok(())
            }
            RecoveryDecision::GiveUp { attempts } => {
                self.give_up(remote, attempts).await;
                Ok(())
            }
        }
    }

    /// Manual retry: fresh budget, fresh connection, restart offer
    async fn retry_peer(&mut self, remote: &ClientId) -> Result<()> {
        if !self.manager.contains(remote) {
            return Err(Error::PeerNotFound(remote.to_string()));
        }
        info!(peer_id = %remote, "Manual retry");
        self.recovery.forget(remote);
        self.replace_and_offer(remote, true, false).await?;
        self.set_badge(remote, None);
        Ok(())
    }

    /// The relay link is gone; existing media keeps flowing but nothing
    /// new can be negotiated
    pub fn on_signaling_closed(&mut self) {
        warn!("Signaling link closed; negotiation is no longer possible");
        self.events.emit(MeetingEvent::SignalingClosed);
    }
}
