//! WebSocket transport: handshake, stream setup, connection and receive loop

pub mod connection;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod pending;
pub mod ping;
pub mod stream;

pub use connection::{ConnectionState, WebSocket, WebSocketConfig};
pub use error::WebSocketError;
pub use handler::{ChannelHandler, Operation, WebSocketHandler, WsEvent};
pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use pending::PendingRequests;
pub use ping::{ActivityMonitor, KeepAlive};
