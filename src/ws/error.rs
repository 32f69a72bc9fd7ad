//! Transport-level errors

/// Errors that can occur on a WebSocket connection
#[derive(Debug, thiserror::Error)]
pub enum WebSocketError {
    /// Bad status line, header mismatch or Accept-hash mismatch
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Server sent a masked frame")]
    UnexpectedServerMasking,
    #[error("Fragmented frames are not supported")]
    FragmentedFrameUnsupported,
    #[error("Unknown opcode: {0:#x}")]
    UnknownOpcode(u8),
    #[error("Invalid opcode: {0}")]
    InvalidOpcode(u8),
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u64),
    #[error("Unexpected end of stream")]
    UnexpectedEndOfStream,
    /// Send/Ping on a connection that is not Open or is shutting down
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("Timeout")]
    Timeout,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WebSocketError {
    /// Protocol violations detected by the frame decoder
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            WebSocketError::UnexpectedServerMasking
                | WebSocketError::FragmentedFrameUnsupported
                | WebSocketError::UnknownOpcode(_)
                | WebSocketError::InvalidOpcode(_)
                | WebSocketError::FrameTooLarge(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, WebSocketError>;
