//! Signaling: envelope protocol, room channel and relay connectors

pub mod channel;
pub mod protocol;
pub mod relay;
pub mod websocket;

pub use channel::{
    signaling_url, ChannelState, SignalingChannel, SignalingConnector, SignalingLink,
    SignalingSender,
};
pub use protocol::SignalingEnvelope;
pub use relay::MemoryRelay;
pub use websocket::WebSocketConnector;
