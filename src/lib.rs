//! WebSocket market-feed client
//!
//! Hand-rolled RFC6455 client transport with socket.io v0.9 and Pusher
//! adapters on top.
//!
//! - **core**: frame model (opcodes, close codes)
//! - **hot_path**: masking and the frame codec
//! - **ws**: transport socket, handshake, receive loop, keep-alive
//! - **protocols**: socket.io and Pusher clients
//! - **infrastructure**: config, logging, metrics
//! - **engine**: runs the configured feeds

pub mod core;
pub mod engine;
pub mod hot_path;
pub mod infrastructure;
pub mod protocols;
pub mod ws;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types
pub use engine::{FeedEngine, FeedEvent, FeedEventKind};
pub use infrastructure::config::{Config, ConfigError, FeedConfig, FeedProtocol};
pub use protocols::ProtocolError;
pub use ws::{WebSocket, WebSocketConfig, WebSocketError};

use thiserror::Error;

/// Top-level error type
#[derive(Error, Debug)]
pub enum ExchangeWsError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WebSocketError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ExchangeWsError>;
