//! Pusher protocol client
//!
//! Every text frame is one JSON envelope `{"event", "data", "channel"?}`.
//! `data` arrives either as a JSON-encoded string or as an inline object.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};

use crate::core::CloseCode;
use crate::log_pusher;
use crate::protocols::{ProtocolError, Result};
use crate::ws::stream::AsyncStream;
use crate::ws::{Operation, WebSocket, WebSocketConfig, WebSocketError, WebSocketHandler};

pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const SUBSCRIBE: &str = "pusher:subscribe";
pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const PING: &str = "pusher:ping";
pub const PONG: &str = "pusher:pong";
pub const ERROR: &str = "pusher:error";
pub const DATA: &str = "data";

/// One Pusher message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PusherEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl PusherEnvelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            channel: None,
        }
    }

    /// Decode `data`, whether it came as a JSON string or inline
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.data {
            Value::String(text) => Ok(serde_json::from_str(text)?),
            other => Ok(T::deserialize(other)?),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload of `pusher:connection_established`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    pub socket_id: String,
    /// Seconds of silence before the server expects a ping
    #[serde(default = "default_activity_timeout")]
    pub activity_timeout: u64,
}

fn default_activity_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ErrorData {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<u16>,
}

/// What the Pusher client publishes
#[derive(Debug)]
pub enum PusherEvent {
    Connected(ConnectionEstablished),
    SubscriptionSucceeded { channel: Option<String> },
    /// Channel data
    Data(PusherEnvelope),
    Pong,
    /// `pusher:error` from the server
    ServerError {
        message: Option<String>,
        code: Option<u16>,
    },
    /// Event name this client does not handle; the connection stays up
    Unexpected(PusherEnvelope),
    /// Undecodable message or transport failure
    Error(ProtocolError),
    /// Connection ended. Fires at most once per session
    Closed,
}

struct Shared {
    events: mpsc::UnboundedSender<PusherEvent>,
    session: RwLock<Option<ConnectionEstablished>>,
    closed: AtomicBool,
}

impl Shared {
    fn publish(&self, event: PusherEvent) {
        let _ = self.events.send(event);
    }

    fn finish(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.publish(PusherEvent::Closed);
        }
    }
}

struct PusherHandler {
    shared: Arc<Shared>,
}

impl PusherHandler {
    async fn handle(&self, ws: &WebSocket, envelope: PusherEnvelope) -> Result<()> {
        match envelope.event.as_str() {
            CONNECTION_ESTABLISHED => {
                let established: ConnectionEstablished = envelope.data_as()?;
                info!(
                    target: "pusher",
                    socket_id = %established.socket_id,
                    activity_timeout = established.activity_timeout,
                    "Connection established"
                );
                *self.shared.session.write() = Some(established.clone());
                self.shared.publish(PusherEvent::Connected(established));
            }
            SUBSCRIPTION_SUCCEEDED => {
                debug!(target: "pusher", channel = ?envelope.channel, "Subscribed");
                self.shared.publish(PusherEvent::SubscriptionSucceeded {
                    channel: envelope.channel,
                });
            }
            DATA => self.shared.publish(PusherEvent::Data(envelope)),
            PING => {
                let pong = PusherEnvelope::new(PONG, json!({})).to_json()?;
                ws.send_text(&pong).await?;
            }
            PONG => self.shared.publish(PusherEvent::Pong),
            ERROR => {
                // A bare error event carries no data; anything else must decode
                let error: ErrorData = match envelope.data {
                    Value::Null => ErrorData::default(),
                    _ => envelope.data_as()?,
                };
                warn!(target: "pusher", message = ?error.message, code = ?error.code, "Server error");
                self.shared.publish(PusherEvent::ServerError {
                    message: error.message,
                    code: error.code,
                });
            }
            other => {
                log_pusher!(Level::WARN, event = other, "Unexpected event");
                self.shared.publish(PusherEvent::Unexpected(envelope));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WebSocketHandler for PusherHandler {
    async fn on_string(&self, ws: &WebSocket, data: &str) {
        let result = match serde_json::from_str::<PusherEnvelope>(data) {
            Ok(envelope) => self.handle(ws, envelope).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(target: "pusher", error = %e, "Bad message");
            self.shared.publish(PusherEvent::Error(e));
        }
    }

    async fn on_error(&self, _ws: &WebSocket, operation: Operation, error: WebSocketError) {
        warn!(target: "pusher", ?operation, error = %error, "Transport error");
        self.shared.publish(PusherEvent::Error(ProtocolError::Transport(error)));
        self.shared.finish();
    }

    async fn on_shutdown(&self, _ws: &WebSocket, code: CloseCode, _data: Bytes) {
        info!(target: "pusher", ?code, "Server closed the connection");
        self.shared.finish();
    }

    async fn on_closed(&self, _ws: &WebSocket) {
        self.shared.finish();
    }
}

/// Pusher client
#[derive(Clone)]
pub struct PusherClient {
    ws: WebSocket,
    shared: Arc<Shared>,
}

impl PusherClient {
    pub fn new(config: WebSocketConfig) -> (Self, mpsc::UnboundedReceiver<PusherEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            events: tx,
            session: RwLock::new(None),
            closed: AtomicBool::new(true),
        });

        let ws = WebSocket::new(config);
        ws.set_handler(Arc::new(PusherHandler {
            shared: shared.clone(),
        }));

        (Self { ws, shared }, rx)
    }

    /// Open `ws(s)://.../app/<key>?protocol=...`
    pub async fn open(&self, url: &str) -> Result<()> {
        self.begin();
        self.ws.open(url).await?;
        Ok(())
    }

    /// Open over a caller-supplied stream
    pub async fn connect_stream<S>(&self, url: &str, stream: S) -> Result<()>
    where
        S: AsyncStream + 'static,
    {
        self.begin();
        self.ws.connect_stream(url, stream).await?;
        Ok(())
    }

    fn begin(&self) {
        *self.shared.session.write() = None;
        self.shared.closed.store(false, Ordering::Release);
    }

    pub fn websocket(&self) -> &WebSocket {
        &self.ws
    }

    /// Socket id from `pusher:connection_established`
    pub fn socket_id(&self) -> Option<String> {
        self.shared
            .session
            .read()
            .as_ref()
            .map(|s| s.socket_id.clone())
    }

    pub fn activity_timeout(&self) -> Option<u64> {
        self.shared.session.read().as_ref().map(|s| s.activity_timeout)
    }

    pub async fn send_event(&self, envelope: &PusherEnvelope) -> Result<()> {
        self.ws.send_text(&envelope.to_json()?).await?;
        Ok(())
    }

    /// `pusher:subscribe` with `{"channel": ...}` JSON-encoded into `data`
    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        self.send_event(&channel_envelope(SUBSCRIBE, channel)?).await
    }

    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.send_event(&channel_envelope(UNSUBSCRIBE, channel)?).await
    }

    /// Application-level ping; the server answers `pusher:pong`
    pub async fn ping(&self) -> Result<()> {
        self.send_event(&PusherEnvelope::new(PING, json!({}))).await
    }

    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.ws.close().await;
    }
}

fn channel_envelope(event: &str, channel: &str) -> Result<PusherEnvelope> {
    let data = serde_json::to_string(&json!({ "channel": channel }))?;
    Ok(PusherEnvelope::new(event, Value::String(data)))
}
