//! Handler capability for receive-loop callbacks
//!
//! Every callback runs on the connection's receive task. Keep them short or
//! hand the work off (see `ChannelHandler`).

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::core::CloseCode;
use crate::ws::connection::WebSocket;
use crate::ws::error::WebSocketError;

/// Which side of the connection an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Send,
    Receive,
}

/// Receive-loop callbacks. All default to no-ops.
#[async_trait]
pub trait WebSocketHandler: Send + Sync {
    async fn on_string(&self, _ws: &WebSocket, _data: &str) {}

    async fn on_binary(&self, _ws: &WebSocket, _data: Bytes) {}

    async fn on_pong(&self, _ws: &WebSocket, _data: Bytes) {}

    /// Fatal for the connection; the loop stops after this returns
    async fn on_error(&self, _ws: &WebSocket, _operation: Operation, _error: WebSocketError) {}

    /// Peer-initiated Close frame; the echo is sent after this returns
    async fn on_shutdown(&self, _ws: &WebSocket, _code: CloseCode, _data: Bytes) {}

    /// Peer closed the stream without a Close frame
    async fn on_closed(&self, _ws: &WebSocket) {}
}

/// One receive-loop callback as a value
#[derive(Debug)]
pub enum WsEvent {
    Text(String),
    Binary(Bytes),
    Pong(Bytes),
    Error {
        operation: Operation,
        error: WebSocketError,
    },
    Shutdown {
        code: CloseCode,
        data: Bytes,
    },
    Closed,
}

/// Republishes every callback on an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<WsEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WsEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    #[inline]
    fn publish(&self, event: WsEvent) {
        // Receiver gone means nobody is listening; not an error for the loop
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl WebSocketHandler for ChannelHandler {
    async fn on_string(&self, _ws: &WebSocket, data: &str) {
        self.publish(WsEvent::Text(data.to_string()));
    }

    async fn on_binary(&self, _ws: &WebSocket, data: Bytes) {
        self.publish(WsEvent::Binary(data));
    }

    async fn on_pong(&self, _ws: &WebSocket, data: Bytes) {
        self.publish(WsEvent::Pong(data));
    }

    async fn on_error(&self, _ws: &WebSocket, operation: Operation, error: WebSocketError) {
        self.publish(WsEvent::Error { operation, error });
    }

    async fn on_shutdown(&self, _ws: &WebSocket, code: CloseCode, data: Bytes) {
        self.publish(WsEvent::Shutdown { code, data });
    }

    async fn on_closed(&self, _ws: &WebSocket) {
        self.publish(WsEvent::Closed);
    }
}
