//! socket.io v0.9 client over the WebSocket transport
//!
//! `open` negotiates a session over HTTP, then upgrades to the returned
//! WebSocket URL. Heartbeat and noop packets are echoed straight back from
//! the receive loop. Everything else is published as a `SocketIoEvent`.

pub mod negotiate;
pub mod packet;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn, Level};

use crate::core::CloseCode;
use crate::log_socketio;
use crate::protocols::{ProtocolError, Result};
use crate::ws::stream::AsyncStream;
use crate::ws::{Operation, PendingRequests, WebSocket, WebSocketConfig, WebSocketError, WebSocketHandler};

pub use negotiate::{negotiate, Handshake};
pub use packet::{decode_packet, encode_packet, Envelope, Packet, PacketType};

/// What the socket.io client publishes
#[derive(Debug)]
pub enum SocketIoEvent {
    Packet(Packet),
    /// Undecodable packet or transport failure; the first two keep the
    /// connection open
    Error(ProtocolError),
    /// Connection ended. Fires at most once per session
    Closed,
}

/// State shared between the client handle and the receive-loop handler
struct Shared {
    events: mpsc::UnboundedSender<SocketIoEvent>,
    /// Ack args (if any) keyed by request token
    pending: PendingRequests<Option<String>>,
    closed: AtomicBool,
}

impl Shared {
    fn publish(&self, event: SocketIoEvent) {
        let _ = self.events.send(event);
    }

    /// Publish `Closed` once and fail outstanding requests
    fn finish(&self) {
        let failed = self.pending.fail_all();
        if failed > 0 {
            debug!(target: "socketio", failed, "Pending requests dropped");
        }
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.publish(SocketIoEvent::Closed);
        }
    }
}

struct SocketIoHandler {
    shared: Arc<Shared>,
}

#[async_trait]
impl WebSocketHandler for SocketIoHandler {
    async fn on_string(&self, ws: &WebSocket, line: &str) {
        trace!(target: "socketio", line, "Packet received");
        match decode_packet(line) {
            Ok(Packet::Heartbeat) | Ok(Packet::Noop) => {
                // Keep-alive: same line straight back
                if let Err(e) = ws.send_text(line).await {
                    warn!(target: "socketio", error = %e, "Heartbeat echo failed");
                }
            }
            Ok(Packet::Ack(envelope)) => {
                let resolved = envelope.ack_parts().is_some_and(|(id, args)| {
                    self.shared.pending.resolve(id, args.map(str::to_string))
                });
                if !resolved {
                    self.shared.publish(SocketIoEvent::Packet(Packet::Ack(envelope)));
                }
            }
            Ok(packet) => self.shared.publish(SocketIoEvent::Packet(packet)),
            Err(e) => {
                log_socketio!(Level::WARN, error = %e, "Bad packet");
                self.shared.publish(SocketIoEvent::Error(e));
            }
        }
    }

    async fn on_error(&self, _ws: &WebSocket, operation: Operation, error: WebSocketError) {
        warn!(target: "socketio", ?operation, error = %error, "Transport error");
        self.shared.publish(SocketIoEvent::Error(ProtocolError::Transport(error)));
        self.shared.finish();
    }

    async fn on_shutdown(&self, _ws: &WebSocket, code: CloseCode, _data: bytes::Bytes) {
        info!(target: "socketio", ?code, "Server closed the session");
        self.shared.finish();
    }

    async fn on_closed(&self, _ws: &WebSocket) {
        self.shared.finish();
    }
}

/// socket.io v0.9 client
#[derive(Clone)]
pub struct SocketIoClient {
    ws: WebSocket,
    shared: Arc<Shared>,
    session: Arc<RwLock<Option<Handshake>>>,
}

impl SocketIoClient {
    /// Create a client and the receiver for its events.
    ///
    /// socket.io servers expect masked client frames, so masking is forced on.
    pub fn new(mut config: WebSocketConfig) -> (Self, mpsc::UnboundedReceiver<SocketIoEvent>) {
        config.masking = true;
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            events: tx,
            pending: PendingRequests::new(),
            closed: AtomicBool::new(true),
        });

        let ws = WebSocket::new(config);
        ws.set_handler(Arc::new(SocketIoHandler {
            shared: shared.clone(),
        }));

        (
            Self {
                ws,
                shared,
                session: Arc::new(RwLock::new(None)),
            },
            rx,
        )
    }

    /// Negotiate over HTTP(S) at `url`, then open the WebSocket
    pub async fn open(&self, url: &str) -> Result<()> {
        self.close().await;
        let handshake = negotiate(url, self.ws.config().accept_invalid_certs).await?;
        let ws_url = handshake.ws_url.to_string();
        self.begin(handshake);
        self.ws.open(&ws_url).await?;
        info!(target: "socketio", url = %ws_url, "socket.io session open");
        Ok(())
    }

    /// Open an already-negotiated session over a caller-supplied stream
    pub async fn connect_stream<S>(&self, handshake: Handshake, stream: S) -> Result<()>
    where
        S: AsyncStream + 'static,
    {
        self.close().await;
        let ws_url = handshake.ws_url.to_string();
        self.begin(handshake);
        self.ws.connect_stream(&ws_url, stream).await?;
        Ok(())
    }

    fn begin(&self, handshake: Handshake) {
        *self.session.write() = Some(handshake);
        self.shared.closed.store(false, Ordering::Release);
    }

    /// Negotiated session, if any
    pub fn handshake(&self) -> Option<Handshake> {
        self.session.read().clone()
    }

    pub fn websocket(&self) -> &WebSocket {
        &self.ws
    }

    /// Open and a frame arrived within the negotiated timeout
    pub fn is_alive(&self) -> bool {
        let timeout = match self.session.read().as_ref() {
            Some(handshake) => handshake.timeout,
            None => return false,
        };
        self.ws.is_open() && !self.ws.monitor().is_stale(timeout)
    }

    #[inline]
    async fn send_line(&self, line: &str) -> Result<()> {
        trace!(target: "socketio", line, "Packet sent");
        self.ws.send_text(line).await.map_err(ProtocolError::from)
    }

    /// Send `0::<endpoint>` and close without publishing `Closed`
    pub async fn disconnect(&self, endpoint: Option<&str>) -> Result<()> {
        let sent = self.send_line(&packet::disconnect(endpoint)).await;
        self.close().await;
        sent
    }

    pub async fn connect(&self, path: Option<&str>, query: Option<&str>) -> Result<()> {
        self.send_line(&packet::connect(path, query)).await
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.send_line(&packet::heartbeat()).await
    }

    pub async fn message(&self, data: &str, id: Option<u64>, endpoint: Option<&str>) -> Result<()> {
        self.send_line(&encode_packet(PacketType::Message, id, endpoint, Some(data)))
            .await
    }

    pub async fn json(&self, data: &str, id: Option<u64>, endpoint: Option<&str>) -> Result<()> {
        self.send_line(&encode_packet(PacketType::Json, id, endpoint, Some(data)))
            .await
    }

    pub async fn event(&self, data: &str, id: Option<u64>, endpoint: Option<&str>) -> Result<()> {
        self.send_line(&encode_packet(PacketType::Event, id, endpoint, Some(data)))
            .await
    }

    pub async fn ack(&self, id: u64, args: Option<&str>) -> Result<()> {
        self.send_line(&packet::ack(id, args)).await
    }

    pub async fn error(&self, reason: &str, advice: Option<&str>, endpoint: Option<&str>) -> Result<()> {
        self.send_line(&packet::error(reason, advice, endpoint)).await
    }

    pub async fn noop(&self) -> Result<()> {
        self.send_line(&packet::noop()).await
    }

    /// Send a packet that asks for an acknowledgement and wait for it.
    ///
    /// Returns the ack args. Fails with `Timeout` after `timeout`, or
    /// `ConnectionClosed` if the session ends first.
    pub async fn request(
        &self,
        kind: PacketType,
        endpoint: Option<&str>,
        data: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let (token, rx) = self.shared.pending.register();
        let line = packet::encode_request(kind, token, endpoint, data);
        if let Err(e) = self.send_line(&line).await {
            self.shared.pending.remove(token);
            return Err(e);
        }
        self.shared
            .pending
            .wait(token, rx, timeout)
            .await
            .map_err(ProtocolError::from)
    }

    /// Close the transport without publishing `Closed`. Outstanding
    /// requests fail.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.pending.fail_all();
        self.ws.close().await;
    }
}
