//! Meeting session: the facade a front end drives
//!
//! `MeetingSession::join` acquires local media, connects the signaling
//! channel and spawns the single session task that owns the handler. All
//! peer work happens on that task; the facade only sends commands and
//! reads the published snapshots.

use super::events::{EventSink, MeetingEvent};
use super::handler::{Command, SessionEvent, SignalingProtocolHandler};
use crate::config::MeetingConfig;
use crate::media::{LocalMediaSource, LocalMediaState, MediaDevices};
use crate::peer::{PeerInfo, RtcEngine};
use crate::signaling::{ChannelState, SignalingChannel, SignalingConnector, SignalingEnvelope};
use crate::types::{ClientId, RoomName};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn session_stopped() -> Error {
    Error::Other(anyhow::anyhow!("meeting session has stopped"))
}

/// One participant's membership in one room
pub struct MeetingSession {
    room: RoomName,
    channel: SignalingChannel,
    media: Arc<LocalMediaSource>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    participants: watch::Receiver<Vec<PeerInfo>>,
    events: Option<mpsc::UnboundedReceiver<MeetingEvent>>,
    task: Option<JoinHandle<()>>,
}

impl MeetingSession {
    /// Join `room`.
    ///
    /// Fails with `MediaAccess` when no local stream can be captured; the
    /// session never signals without one.
    pub async fn join(
        config: MeetingConfig,
        room: RoomName,
        engine: Arc<dyn RtcEngine>,
        devices: Arc<dyn MediaDevices>,
        connector: &dyn SignalingConnector,
    ) -> Result<Self> {
        config.validate()?;

        let media = LocalMediaSource::new(devices);
        media.acquire(&config.media).await?;

        let mut channel =
            match SignalingChannel::connect(connector, &config.server_origin, &room).await {
                Ok(channel) => channel,
                Err(e) => {
                    media.stop_all().await;
                    return Err(e);
                }
            };
        let inbound = channel
            .take_inbound()
            .ok_or_else(|| Error::SignalingTransport("inbound stream already taken".to_string()))?;

        let (events, events_rx) = EventSink::channel();
        media.bind(channel.sender(), events.clone());

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let handler = SignalingProtocolHandler::new(
            channel.client_id().clone(),
            config,
            engine,
            media.clone(),
            channel.sender(),
            events,
            session_tx.clone(),
        );
        let participants = handler.subscribe();
        let task = tokio::spawn(Self::run(handler, inbound, session_rx));

        info!(client_id = %channel.client_id(), room = %room, "Joined meeting");
        Ok(Self {
            room,
            channel,
            media,
            session_tx,
            participants,
            events: Some(events_rx),
            task: Some(task),
        })
    }

    /// Session task: one event at a time, to completion
    async fn run(
        mut handler: SignalingProtocolHandler,
        mut inbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let mut signaling_open = true;
        loop {
            tokio::select! {
                envelope = inbound.recv(), if signaling_open => match envelope {
                    Some(envelope) => handler.handle_envelope(envelope).await,
                    None => {
                        signaling_open = false;
                        handler.on_signaling_closed();
                    }
                },
                event = session_rx.recv() => match event {
                    Some(event) => {
                        if !handler.handle_session_event(event).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("Session task finished");
    }

    pub fn client_id(&self) -> &ClientId {
        self.channel.client_id()
    }

    pub fn room(&self) -> &RoomName {
        &self.room
    }

    pub fn signaling_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// The event stream. Only the first call gets it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<MeetingEvent>> {
        self.events.take()
    }

    /// Current peer snapshots, sorted by client id
    pub fn participants(&self) -> Vec<PeerInfo> {
        self.participants.borrow().clone()
    }

    /// Receiver that changes whenever a peer snapshot does
    pub fn watch_participants(&self) -> watch::Receiver<Vec<PeerInfo>> {
        self.participants.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.participants.borrow().len()
    }

    /// Peers plus ourselves
    pub fn participant_count(&self) -> usize {
        self.peer_count() + 1
    }

    pub async fn local_media(&self) -> LocalMediaState {
        self.media.state().await
    }

    pub async fn toggle_audio(&self) -> Result<bool> {
        self.media.toggle_audio().await
    }

    pub async fn toggle_video(&self) -> Result<bool> {
        self.media.toggle_video().await
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        self.media.start_screen_share().await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.media.stop_screen_share().await
    }

    pub async fn send_chat(&self, message: impl Into<String>) -> Result<()> {
        self.channel
            .send(SignalingEnvelope::ChatMessage {
                message: message.into(),
                source: None,
            })
            .await
    }

    /// Rebuild the connection to `peer` with a fresh recovery budget
    pub async fn retry_peer(&self, peer: &ClientId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.session_tx
            .send(SessionEvent::Command(Command::RetryPeer {
                client_id: peer.clone(),
                reply,
            }))
            .map_err(|_| session_stopped())?;
        rx.await.map_err(|_| session_stopped())?
    }

    /// Announce LEAVE, close every connection, stop capture and the task
    pub async fn leave(mut self) -> Result<()> {
        info!(client_id = %self.client_id(), "Leaving meeting");
        let leave = SignalingEnvelope::Leave {
            client_id: self.client_id().clone(),
        };
        if let Err(e) = self.channel.send(leave).await {
            warn!("Could not announce LEAVE: {}", e);
        }

        let (reply, rx) = oneshot::channel();
        let accepted = self
            .session_tx
            .send(SessionEvent::Command(Command::Leave { reply }))
            .is_ok();
        if accepted && rx.await.is_err() {
            debug!("Session task ended before acknowledging leave");
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Session task ended abnormally: {}", e);
                }
            }
        }

        self.media.stop_all().await;
        self.channel.close();
        Ok(())
    }
}

impl Drop for MeetingSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
