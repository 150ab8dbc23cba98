//! WebSocket connector for the signaling relay

use super::channel::{SignalingConnector, SignalingLink};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens `ws://` / `wss://` links with tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }

    /// Sender task: writes outgoing text frames until every sender is dropped
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(text) = rx.recv().await {
            if let Err(e) = write.send(Message::Text(text)).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }

        if let Err(e) = write.close().await {
            debug!("WebSocket close handshake failed: {}", e);
        }
        debug!("Sender task terminated");
    }

    /// Receiver task: forwards text frames, ends on close or error
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        tx: mpsc::UnboundedSender<Result<String>>,
    ) {
        while let Some(msg_result) = read.next().await {
            let forwarded = match msg_result {
                Ok(Message::Text(text)) => tx.send(Ok(text)),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => tx.send(Ok(text)),
                    Err(_) => {
                        warn!("Ignoring non UTF-8 binary frame");
                        Ok(())
                    }
                },
                Ok(Message::Close(frame)) => {
                    info!("WebSocket connection closed: {:?}", frame);
                    break;
                }
                Ok(_) => Ok(()),
                Err(e) => {
                    let _ = tx.send(Err(Error::WebSocket(e.to_string())));
                    break;
                }
            };
            if forwarded.is_err() {
                break;
            }
        }

        debug!("Receiver task terminated");
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn open(&self, url: &Url) -> Result<SignalingLink> {
        info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocket(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling server");

        let (write, read) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::sender_task(write, out_rx));
        tokio::spawn(Self::receiver_task(read, in_tx));

        Ok(SignalingLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts one connection, echoes one text frame back uppercased
    async fn spawn_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text.to_uppercase())).await.unwrap();
            }
            let _ = ws.close(None).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_round_trip_over_local_socket() {
        let addr = spawn_echo_server().await;
        let url = Url::parse(&format!("ws://{}/ws/room/client", addr)).unwrap();

        let mut link = WebSocketConnector::new().open(&url).await.unwrap();
        link.outgoing.send("hello".to_string()).unwrap();

        let reply = link.incoming.recv().await.unwrap().unwrap();
        assert_eq!(reply, "HELLO");
        // Server closes after one message.
        loop {
            match link.incoming.recv().await {
                None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_refused_connection_maps_to_websocket_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("ws://{}/ws/room/client", addr)).unwrap();
        let err = WebSocketConnector::new().open(&url).await.unwrap_err();
        assert!(matches!(err, Error::WebSocket(_)));
    }
}
