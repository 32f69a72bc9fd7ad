//! Text sub-protocols carried over the WebSocket transport
//!
//! - socketio: socket.io v0.9 line protocol plus its HTTP negotiation
//! - pusher: Pusher JSON envelopes

pub mod pusher;
pub mod socketio;

use crate::ws::WebSocketError;

pub use pusher::{PusherClient, PusherEnvelope, PusherEvent};
pub use socketio::{Packet, PacketType, SocketIoClient, SocketIoEvent};

/// Errors raised by the protocol adapters
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// socket.io negotiation did not offer `websocket`
    #[error("Server does not support websocket transport (offered: {0})")]
    UnsupportedTransport(String),
    #[error("Malformed handshake response: {0}")]
    MalformedHandshake(String),
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
    #[error("Unknown packet type: {0:?}")]
    UnknownPacketType(char),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] WebSocketError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ProtocolError>;
