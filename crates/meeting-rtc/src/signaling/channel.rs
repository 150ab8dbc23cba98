//! Room-scoped signaling channel
//!
//! Wraps one bidirectional text link to the relay. Outbound envelopes go
//! through a clonable [`SignalingSender`] that waits on a readiness gate;
//! inbound envelopes are handed, in arrival order, to exactly one
//! consumer via [`SignalingChannel::take_inbound`].

use super::protocol::SignalingEnvelope;
use crate::types::{ClientId, RoomName};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

/// Readiness of the underlying link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Raw text link produced by a connector. Dropping `outgoing` closes it.
#[derive(Debug)]
pub struct SignalingLink {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<Result<String>>,
}

/// Opens links to the relay
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<SignalingLink>;
}

/// Build `<ws|wss>://<host>[:port]/ws/<room>/<client>` from the page origin
pub fn signaling_url(origin: &str, room: &RoomName, client_id: &ClientId) -> Result<Url> {
    let origin = Url::parse(origin)?;
    let scheme = match origin.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(Error::InvalidConfig(format!(
                "unsupported origin scheme: {}",
                other
            )))
        }
    };
    let host = origin
        .host_str()
        .ok_or_else(|| Error::InvalidConfig(format!("origin has no host: {}", origin)))?;

    let mut url = Url::parse(&format!("{}://{}", scheme, host))?;
    let base = url.to_string();
    url.set_port(origin.port())
        .map_err(|_| Error::InvalidConfig(format!("cannot set port on {}", base)))?;
    url.path_segments_mut()
        .map_err(|_| Error::InvalidConfig(format!("origin cannot carry a path: {}", base)))?
        .clear()
        .push("ws")
        .push(room.as_str())
        .push(client_id.as_str());
    Ok(url)
}

/// Clonable handle for sending envelopes on the channel
#[derive(Clone)]
pub struct SignalingSender {
    outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    state: watch::Receiver<ChannelState>,
}

impl SignalingSender {
    fn new(outgoing: mpsc::UnboundedSender<String>, state: watch::Receiver<ChannelState>) -> Self {
        Self {
            outgoing: Arc::new(Mutex::new(Some(outgoing))),
            state,
        }
    }

    /// Sender wired to a plain receiver, already open. Used by tests that
    /// inspect outbound envelopes without a relay.
    #[cfg(any(test, feature = "test-util"))]
    pub fn loopback() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Open);
        // The receiver keeps the last value after the sender drops.
        drop(state_tx);
        (Self::new(tx, state_rx), rx)
    }

    pub fn state(&self) -> ChannelState {
        if self.outgoing.lock().is_none() {
            return ChannelState::Closed;
        }
        *self.state.borrow()
    }

    /// Wait until the link is open. Fails if it closes first.
    pub async fn wait_open(&self) -> Result<()> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| *s != ChannelState::Connecting)
            .await
            .map(|s| *s)
            .ok();
        // Gate owner gone: whatever it last published stands.
        let current = settled.unwrap_or_else(|| *state.borrow());
        match current {
            ChannelState::Open => Ok(()),
            _ => Err(Error::SignalingTransport(
                "signaling channel is closed".to_string(),
            )),
        }
    }

    /// Serialize and transmit, waiting for the link to open first
    pub async fn send(&self, envelope: SignalingEnvelope) -> Result<()> {
        self.wait_open().await?;
        let text = envelope.to_json()?;
        let guard = self.outgoing.lock();
        let outgoing = guard.as_ref().ok_or_else(|| {
            Error::SignalingTransport("signaling channel is closed".to_string())
        })?;
        debug!(kind = envelope.kind(), "Sending signaling envelope");
        outgoing
            .send(text)
            .map_err(|_| Error::SignalingTransport("signaling link dropped".to_string()))
    }

    /// Drop the outgoing half; the link closes once it is released
    fn close(&self) {
        self.outgoing.lock().take();
    }
}

/// Connected signaling channel for one participant in one room
pub struct SignalingChannel {
    client_id: ClientId,
    room: RoomName,
    url: Url,
    sender: SignalingSender,
    state_tx: Arc<watch::Sender<ChannelState>>,
    inbound: Option<mpsc::UnboundedReceiver<SignalingEnvelope>>,
    receiver_task: JoinHandle<()>,
}

impl SignalingChannel {
    /// Generate a client id, open the link and send JOIN.
    ///
    /// Resolves once JOIN has been handed to the transport.
    pub async fn connect(
        connector: &dyn SignalingConnector,
        origin: &str,
        room: &RoomName,
    ) -> Result<Self> {
        let client_id = ClientId::generate();
        let url = signaling_url(origin, room, &client_id)?;
        info!(client_id = %client_id, room = %room, "Connecting to signaling relay: {}", url);

        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let state_tx = Arc::new(state_tx);

        let link = match connector.open(&url).await {
            Ok(link) => link,
            Err(e) => {
                state_tx.send_replace(ChannelState::Closed);
                return Err(e);
            }
        };

        let sender = SignalingSender::new(link.outgoing, state_rx);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let receiver_task = tokio::spawn(Self::receiver_task(
            link.incoming,
            inbound_tx,
            state_tx.clone(),
        ));
        state_tx.send_replace(ChannelState::Open);

        sender
            .send(SignalingEnvelope::Join {
                client_id: client_id.clone(),
            })
            .await?;
        info!(client_id = %client_id, "JOIN sent");

        Ok(Self {
            client_id,
            room: room.clone(),
            url,
            sender,
            state_tx,
            inbound: Some(inbound_rx),
            receiver_task,
        })
    }

    /// Receiver task: parses link text into envelopes for the consumer
    async fn receiver_task(
        mut incoming: mpsc::UnboundedReceiver<Result<String>>,
        inbound: mpsc::UnboundedSender<SignalingEnvelope>,
        state: Arc<watch::Sender<ChannelState>>,
    ) {
        while let Some(item) = incoming.recv().await {
            match item {
                Ok(text) => match SignalingEnvelope::from_json(&text) {
                    Ok(envelope) => {
                        debug!(kind = envelope.kind(), "Received signaling envelope");
                        if inbound.send(envelope).is_err() {
                            debug!("Inbound consumer gone");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Dropping unrecognized signaling message: {}", e);
                    }
                },
                Err(e) => {
                    error!("Signaling transport error: {}", e);
                    break;
                }
            }
        }

        state.send_replace(ChannelState::Closed);
        info!("Signaling link closed");
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn room(&self) -> &RoomName {
        &self.room
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    pub fn state(&self) -> ChannelState {
        self.sender.state()
    }

    /// Hand out the inbound stream. Only the first call gets it.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<SignalingEnvelope>> {
        self.inbound.take()
    }

    pub async fn send(&self, envelope: SignalingEnvelope) -> Result<()> {
        self.sender.send(envelope).await
    }

    /// Close the link. The channel never reconnects on its own.
    pub fn close(&self) {
        self.state_tx.send_replace(ChannelState::Closed);
        self.sender.close();
        self.receiver_task.abort();
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.receiver_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Connector that hands the test the far end of the link
    struct PipeConnector {
        far: Mutex<Option<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<Result<String>>)>>,
        link: Mutex<Option<SignalingLink>>,
    }

    impl PipeConnector {
        fn new() -> Self {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            Self {
                far: Mutex::new(Some((out_rx, in_tx))),
                link: Mutex::new(Some(SignalingLink {
                    outgoing: out_tx,
                    incoming: in_rx,
                })),
            }
        }

        fn far_end(&self) -> (mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<Result<String>>) {
            self.far.lock().take().unwrap()
        }
    }

    #[async_trait]
    impl SignalingConnector for PipeConnector {
        async fn open(&self, _url: &Url) -> Result<SignalingLink> {
            self.link
                .lock()
                .take()
                .ok_or_else(|| Error::SignalingTransport("already opened".to_string()))
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl SignalingConnector for RefusingConnector {
        async fn open(&self, url: &Url) -> Result<SignalingLink> {
            Err(Error::WebSocket(format!("connection refused: {}", url)))
        }
    }

    fn room() -> RoomName {
        RoomName::new("standup").unwrap()
    }

    #[test]
    fn test_signaling_url_mirrors_origin() {
        let id = ClientId::from("c1");
        let url = signaling_url("https://meet.example.com", &room(), &id).unwrap();
        assert_eq!(url.as_str(), "wss://meet.example.com/ws/standup/c1");

        let url = signaling_url("http://localhost:8000/meeting/standup", &room(), &id).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/ws/standup/c1");

        assert!(signaling_url("ftp://example.com", &room(), &id).is_err());
    }

    #[tokio::test]
    async fn test_connect_sends_join_first() {
        let connector = PipeConnector::new();
        let (mut out, _in) = connector.far_end();
        let channel = SignalingChannel::connect(&connector, "http://localhost:8000", &room())
            .await
            .unwrap();

        let first = SignalingEnvelope::from_json(&out.recv().await.unwrap()).unwrap();
        assert_eq!(
            first,
            SignalingEnvelope::Join {
                client_id: channel.client_id().clone()
            }
        );
        assert_eq!(channel.state(), ChannelState::Open);
        assert!(channel.url().as_str().ends_with(channel.client_id().as_str()));
    }

    #[tokio::test]
    async fn test_inbound_in_order_and_unknown_dropped() {
        let connector = PipeConnector::new();
        let (_out, inbound_tx) = connector.far_end();
        let mut channel = SignalingChannel::connect(&connector, "http://localhost:8000", &room())
            .await
            .unwrap();
        let mut inbound = channel.take_inbound().unwrap();
        assert!(channel.take_inbound().is_none());

        inbound_tx
            .send(Ok(r#"{"type":"JOIN","clientId":"b"}"#.to_string()))
            .unwrap();
        inbound_tx
            .send(Ok(r#"{"type":"WHITEBOARD","x":1}"#.to_string()))
            .unwrap();
        inbound_tx
            .send(Ok(r#"{"type":"LEAVE","clientId":"b"}"#.to_string()))
            .unwrap();

        assert_eq!(inbound.recv().await.unwrap().kind(), "JOIN");
        assert_eq!(inbound.recv().await.unwrap().kind(), "LEAVE");
    }

    #[tokio::test]
    async fn test_link_loss_closes_channel() {
        let connector = PipeConnector::new();
        let (_out, inbound_tx) = connector.far_end();
        let mut channel = SignalingChannel::connect(&connector, "http://localhost:8000", &room())
            .await
            .unwrap();
        let mut inbound = channel.take_inbound().unwrap();

        inbound_tx
            .send(Err(Error::WebSocket("reset by peer".to_string())))
            .unwrap();
        assert!(inbound.recv().await.is_none());

        let err = channel
            .send(SignalingEnvelope::Leave {
                client_id: channel.client_id().clone(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SignalingTransport(_)));
    }

    #[tokio::test]
    async fn test_close_rejects_further_sends() {
        let connector = PipeConnector::new();
        let (_out, _in) = connector.far_end();
        let channel = SignalingChannel::connect(&connector, "http://localhost:8000", &room())
            .await
            .unwrap();
        let sender = channel.sender();
        channel.close();
        assert_eq!(sender.state(), ChannelState::Closed);
        assert!(sender
            .send(SignalingEnvelope::ChatMessage {
                message: "late".to_string(),
                source: None,
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let result =
            SignalingChannel::connect(&RefusingConnector, "http://localhost:8000", &room()).await;
        assert!(matches!(result, Err(Error::WebSocket(_))));
    }

    #[tokio::test]
    async fn test_send_waits_for_open_gate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let sender = SignalingSender::new(tx, state_rx);

        let pending = tokio::spawn({
            let sender = sender.clone();
            async move {
                sender
                    .send(SignalingEnvelope::ChatMessage {
                        message: "early".to_string(),
                        source: None,
                    })
                    .await
            }
        });
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        state_tx.send_replace(ChannelState::Open);
        pending.await.unwrap().unwrap();
        assert!(rx.recv().await.unwrap().contains("early"));
    }
}
