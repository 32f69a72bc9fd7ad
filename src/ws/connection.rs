//! WebSocket connection (transport socket)
//!
//! One `WebSocket` owns at most one live stream. Lifecycle:
//! Closed -> Handshaking -> Open -> Closed.
//!
//! - Sends are serialized by one async mutex holding the write half and the
//!   64 KiB scratch encoder, so frames never interleave on the wire.
//! - One receive task per stream decodes frames and calls the handler.
//! - Every stream gets a generation number and a cancellation token.
//!   `close`, a fatal error or a finished close handshake bumps the
//!   generation; anything still holding the old number stops without
//!   touching the new stream.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::core::{close_payload, CloseCode, Frame, OpCode};
use crate::hot_path::{Decoder, FrameEncoder, Role};
use crate::infrastructure::metrics::TransportMetrics;
use crate::ws::error::{Result, WebSocketError};
use crate::ws::handler::{Operation, WebSocketHandler};
use crate::ws::handshake::{self, HandshakeRequest, HandshakeResponse};
use crate::ws::ping::ActivityMonitor;
use crate::ws::stream::{self, AsyncStream, BoxedStream};

/// Largest Ping payload accepted by `ping`
pub const MAX_PING_PAYLOAD: usize = 125;

/// Largest data accepted by `shutdown` (2 bytes go to the status code)
pub const MAX_SHUTDOWN_DATA: usize = 123;

/// Transport configuration (`[transport]` section)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Mask client frames. Off by default: legacy servers reject masked frames
    #[serde(default)]
    pub masking: bool,
    /// Origin header; defaults to `<scheme>://<host>`
    #[serde(default)]
    pub origin: Option<String>,
    /// Sec-WebSocket-Version value
    #[serde(default = "default_version")]
    pub version: String,
    /// Additional request headers
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
    /// Accept any TLS certificate
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Largest incoming payload before `FrameTooLarge`
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u64,
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
    /// TCP connect / TLS negotiation timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_version() -> String {
    "13".to_string()
}

fn default_max_frame_size() -> u64 {
    64 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            masking: false,
            origin: None,
            version: default_version(),
            extra_headers: BTreeMap::new(),
            accept_invalid_certs: false,
            max_frame_size: default_max_frame_size(),
            tcp_nodelay: true,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Closed,
    Handshaking,
    Open,
}

#[derive(Default)]
struct Session {
    state: ConnectionState,
    url: Option<Url>,
    response: Option<HandshakeResponse>,
    cancel: Option<CancellationToken>,
    reader: Option<JoinHandle<()>>,
}

/// Send side, guarded by the send lock
struct Writer {
    generation: u64,
    sink: Option<WriteHalf<BoxedStream>>,
    encoder: FrameEncoder,
}

struct Inner {
    config: WebSocketConfig,
    handler: RwLock<Option<Arc<dyn WebSocketHandler>>>,
    session: Mutex<Session>,
    generation: AtomicU64,
    open_lock: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Writer>,
    shutting_down: AtomicBool,
    monitor: ActivityMonitor,
    metrics: TransportMetrics,
}

/// Cloneable handle to one transport socket
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("state", &self.state())
            .field("url", &self.url())
            .finish()
    }
}

impl WebSocket {
    pub fn new(config: WebSocketConfig) -> Self {
        let encoder = FrameEncoder::new(config.masking);
        Self {
            inner: Arc::new(Inner {
                config,
                handler: RwLock::new(None),
                session: Mutex::new(Session::default()),
                generation: AtomicU64::new(0),
                open_lock: tokio::sync::Mutex::new(()),
                writer: tokio::sync::Mutex::new(Writer {
                    generation: 0,
                    sink: None,
                    encoder,
                }),
                shutting_down: AtomicBool::new(false),
                monitor: ActivityMonitor::new(),
                metrics: TransportMetrics::new(),
            }),
        }
    }

    /// Install the receive-loop handler (replaces any previous one)
    pub fn set_handler(&self, handler: Arc<dyn WebSocketHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    #[inline]
    fn handler(&self) -> Option<Arc<dyn WebSocketHandler>> {
        self.inner.handler.read().clone()
    }

    #[inline]
    pub fn config(&self) -> &WebSocketConfig {
        &self.inner.config
    }

    /// Get current connection state
    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.inner.session.lock().state
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// URL of the current (or last) stream
    pub fn url(&self) -> Option<Url> {
        self.inner.session.lock().url.clone()
    }

    /// Handshake response of the current stream
    pub fn response(&self) -> Option<HandshakeResponse> {
        self.inner.session.lock().response.clone()
    }

    #[inline]
    pub fn metrics(&self) -> &TransportMetrics {
        &self.inner.metrics
    }

    #[inline]
    pub fn monitor(&self) -> &ActivityMonitor {
        &self.inner.monitor
    }

    #[inline]
    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    #[inline]
    fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.session.lock().state = state;
    }

    /// Connect to `ws://` or `wss://` and run the opening handshake.
    ///
    /// Any existing stream is closed first.
    pub async fn open(&self, url: &str) -> Result<()> {
        let url = Url::parse(url).map_err(|e| WebSocketError::InvalidUrl(format!("{url}: {e}")))?;
        let _open = self.inner.open_lock.lock().await;

        self.close().await;
        let expected = self.generation();
        self.set_state(ConnectionState::Handshaking);

        let stream = match stream::connect(&url, &self.inner.config).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target: "ws", url = %url, error = %e, "Connect failed");
                self.set_state(ConnectionState::Closed);
                return Err(e);
            }
        };
        self.establish(url, stream, expected).await
    }

    /// Run the opening handshake over a caller-supplied stream
    pub async fn connect_stream<S>(&self, url: &str, stream: S) -> Result<()>
    where
        S: AsyncStream + 'static,
    {
        let url = Url::parse(url).map_err(|e| WebSocketError::InvalidUrl(format!("{url}: {e}")))?;
        let _open = self.inner.open_lock.lock().await;

        self.close().await;
        let expected = self.generation();
        self.set_state(ConnectionState::Handshaking);
        self.establish(url, Box::new(stream), expected).await
    }

    async fn establish(&self, url: Url, mut stream: BoxedStream, expected: u64) -> Result<()> {
        let response = match self.handshake(&url, &mut stream).await {
            Ok(response) => response,
            Err(e) => {
                warn!(target: "ws", url = %url, error = %e, "Handshake failed");
                self.set_state(ConnectionState::Closed);
                return Err(e);
            }
        };

        // A concurrent close() during the handshake wins. The generation
        // moves under the send lock so no send sees a half-installed sink.
        let generation = expected + 1;
        let (reader, sink) = tokio::io::split(stream);
        {
            let mut writer = self.inner.writer.lock().await;
            if self
                .inner
                .generation
                .compare_exchange(expected, generation, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                drop(writer);
                self.set_state(ConnectionState::Closed);
                return Err(WebSocketError::ConnectionClosed);
            }
            writer.generation = generation;
            writer.sink = Some(sink);
            self.inner.shutting_down.store(false, Ordering::Release);
        }
        self.inner.monitor.record();

        // close() bumps the generation under the session lock, so it either
        // ran before this check or sees the Open state and tears it down
        let cancel = CancellationToken::new();
        {
            let mut session = self.inner.session.lock();
            if self.generation() != generation {
                session.state = ConnectionState::Closed;
                return Err(WebSocketError::ConnectionClosed);
            }
            session.state = ConnectionState::Open;
            session.url = Some(url.clone());
            session.response = Some(response);
            session.cancel = Some(cancel.clone());
        }
        self.inner.metrics.set_connected(true);

        let receive_loop = ReceiveLoop {
            ws: self.clone(),
            generation,
            cancel,
            reader,
            decoder: Decoder::new(Role::Client, self.inner.config.max_frame_size),
        };
        let handle = tokio::spawn(receive_loop.run());
        {
            let mut session = self.inner.session.lock();
            if self.generation() == generation {
                session.reader = Some(handle);
            }
        }

        info!(target: "ws", url = %url, generation, "WebSocket open");
        Ok(())
    }

    async fn handshake(&self, url: &Url, stream: &mut BoxedStream) -> Result<HandshakeResponse> {
        let request = HandshakeRequest::new(url, &self.inner.config)?;
        handshake::perform(stream, &request).await
    }

    /// Send one frame. Serialized with every other send on this connection.
    ///
    /// Fails with `ConnectionClosed` when not Open or after `shutdown`.
    pub async fn send(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if self.is_shutting_down() {
            return Err(WebSocketError::ConnectionClosed);
        }
        let mut writer = self.inner.writer.lock().await;
        self.write_locked(&mut writer, None, opcode, payload).await
    }

    /// Send text message
    #[inline]
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(OpCode::Text, text.as_bytes()).await
    }

    /// Send binary message
    #[inline]
    pub async fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.send(OpCode::Binary, data).await
    }

    /// Send a Ping (payload at most 125 bytes)
    pub async fn ping(&self, data: Option<&[u8]>) -> Result<()> {
        let data = data.unwrap_or_default();
        if data.len() > MAX_PING_PAYLOAD {
            return Err(WebSocketError::InvalidArgument("ping payload must be under 126 bytes"));
        }
        self.send(OpCode::Ping, data).await
    }

    /// Send a Close frame and mark the connection as shutting down.
    ///
    /// The peer's Close that follows is treated as the echo. Data needs a
    /// code and must be under 124 bytes.
    pub async fn shutdown(&self, code: Option<CloseCode>, data: Option<&[u8]>) -> Result<()> {
        let payload = match (code, data) {
            (None, Some(_)) => {
                return Err(WebSocketError::InvalidArgument("shutdown data requires a close code"))
            }
            (_, Some(data)) if data.len() > MAX_SHUTDOWN_DATA => {
                return Err(WebSocketError::InvalidArgument("shutdown data must be under 124 bytes"))
            }
            (Some(code), data) => close_payload(code, data.unwrap_or_default()),
            (None, None) => Vec::new(),
        };

        let mut writer = self.inner.writer.lock().await;
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return Err(WebSocketError::ConnectionClosed);
        }
        debug!(target: "ws", ?code, "Shutdown sent");
        self.write_locked(&mut writer, None, OpCode::Close, &payload).await
    }

    /// Drop the stream and stop the receive loop. Idempotent.
    ///
    /// Waits for an in-flight send to finish. Does not wait for the receive
    /// task, so it is safe to call from a handler callback.
    pub async fn close(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);

        let (cancel, reader, was_live) = {
            let mut session = self.inner.session.lock();
            let was_live = session.cancel.is_some();
            session.state = ConnectionState::Closed;
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            (session.cancel.take(), session.reader.take(), was_live)
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        drop(reader);

        let sink = self.inner.writer.lock().await.sink.take();
        if let Some(mut sink) = sink {
            let _ = sink.shutdown().await;
        }
        self.inner.metrics.set_connected(false);

        if was_live {
            info!(target: "ws", "WebSocket closed");
        }
    }

    /// Close the stream `generation` if it is still current
    async fn teardown(&self, generation: u64) {
        if self
            .inner
            .generation
            .compare_exchange(generation, generation + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let cancel = {
            let mut session = self.inner.session.lock();
            session.state = ConnectionState::Closed;
            session.reader = None;
            session.cancel.take()
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let sink = {
            let mut writer = self.inner.writer.lock().await;
            if writer.generation == generation {
                writer.sink.take()
            } else {
                None
            }
        };
        if let Some(mut sink) = sink {
            let _ = sink.shutdown().await;
        }
        self.inner.metrics.set_connected(false);
        debug!(target: "ws", generation, "Stream torn down");
    }

    /// Write one frame while holding the send lock.
    ///
    /// `expected` pins the write to one stream generation (receive-loop
    /// replies). Without it the write goes to the current generation. A
    /// superseded or closed stream fails with `ConnectionClosed`.
    async fn write_locked(
        &self,
        writer: &mut Writer,
        expected: Option<u64>,
        opcode: OpCode,
        payload: &[u8],
    ) -> Result<()> {
        let current = expected.unwrap_or_else(|| self.generation());
        if writer.generation != current || self.generation() != current {
            return Err(WebSocketError::ConnectionClosed);
        }
        let Writer { sink, encoder, .. } = writer;
        let sink = sink.as_mut().ok_or(WebSocketError::ConnectionClosed)?;

        let written = if FrameEncoder::fits(payload.len()) {
            let frame = encoder.encode(opcode, payload)?;
            let len = frame.len();
            match sink.write_all(frame).await {
                Ok(()) => sink.flush().await.map(|_| len),
                Err(e) => Err(e),
            }
        } else {
            let frame = encoder.encode_overflow(opcode, payload);
            match sink.write_all(&frame).await {
                Ok(()) => sink.flush().await.map(|_| frame.len()),
                Err(e) => Err(e),
            }
        };

        match written {
            Ok(len) => {
                self.inner.metrics.record_sent(len as u64);
                trace!(target: "ws", ?opcode, len, "Frame sent");
                Ok(())
            }
            Err(e) => {
                self.inner.metrics.record_error();
                Err(WebSocketError::Io(e))
            }
        }
    }

    /// Reply from the receive loop, pinned to its generation
    async fn reply(&self, generation: u64, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        self.write_locked(&mut writer, Some(generation), opcode, payload).await
    }

    /// Echo a peer-initiated Close unless a local shutdown already went out
    async fn echo_close(&self, generation: u64, code: CloseCode) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let payload = close_payload(code, &[]);
        self.write_locked(&mut writer, Some(generation), OpCode::Close, &payload)
            .await
    }
}

/// Receive loop state, owned by the spawned task
struct ReceiveLoop {
    ws: WebSocket,
    generation: u64,
    cancel: CancellationToken,
    reader: ReadHalf<BoxedStream>,
    decoder: Decoder,
}

impl ReceiveLoop {
    async fn run(mut self) {
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                result = self.decoder.read_frame(&mut self.reader) => result,
            };
            if self.ws.generation() != self.generation {
                return;
            }

            match result {
                Ok(Some(frame)) => {
                    if !self.dispatch(frame).await {
                        break;
                    }
                }
                Ok(None) => {
                    info!(target: "ws", "Peer closed the stream");
                    if let Some(handler) = self.ws.handler() {
                        handler.on_closed(&self.ws).await;
                    }
                    break;
                }
                Err(e) => {
                    warn!(target: "ws", error = %e, "Receive failed");
                    self.ws.inner.metrics.record_error();
                    if let Some(handler) = self.ws.handler() {
                        handler.on_error(&self.ws, Operation::Receive, e).await;
                    }
                    break;
                }
            }
        }
        self.ws.teardown(self.generation).await;
    }

    /// Handle one frame; false ends the loop
    async fn dispatch(&mut self, frame: Frame) -> bool {
        let ws = &self.ws;
        ws.inner.monitor.record();
        ws.inner.metrics.record_received(frame.payload.len() as u64);
        trace!(target: "ws", opcode = ?frame.opcode, len = frame.payload.len(), "Frame received");

        let handler = ws.handler();
        match frame.opcode {
            OpCode::Text => {
                if let Some(handler) = handler {
                    let text = String::from_utf8_lossy(&frame.payload);
                    handler.on_string(ws, &text).await;
                }
            }
            OpCode::Binary => {
                if let Some(handler) = handler {
                    handler.on_binary(ws, frame.payload).await;
                }
            }
            OpCode::Ping => {
                if !ws.is_shutting_down() {
                    if let Err(e) = ws.reply(self.generation, OpCode::Pong, &frame.payload).await {
                        return self.send_failed(e).await;
                    }
                    ws.inner.metrics.record_auto_pong();
                }
            }
            OpCode::Pong => {
                if !ws.is_shutting_down() {
                    if let Some(handler) = handler {
                        handler.on_pong(ws, frame.payload).await;
                    }
                }
            }
            OpCode::Close => {
                let (code, data) = frame.close_parts();
                if ws.is_shutting_down() {
                    debug!(target: "ws", ?code, "Close echo received");
                } else {
                    info!(target: "ws", ?code, "Peer sent Close");
                    if let Some(handler) = handler {
                        handler.on_shutdown(ws, code, data).await;
                    }
                    if let Err(e) = ws.echo_close(self.generation, code).await {
                        return self.send_failed(e).await;
                    }
                }
                return false;
            }
            // Rejected by the decoder
            OpCode::Continuation => {}
        }
        true
    }

    async fn send_failed(&mut self, error: WebSocketError) -> bool {
        warn!(target: "ws", error = %error, "Reply failed");
        if let Some(handler) = self.ws.handler() {
            handler.on_error(&self.ws, Operation::Send, error).await;
        }
        false
    }
}

// Transport Checklist:
// ✓ One frame on the wire at a time (send lock)
// ✓ Scratch encoder reused for payloads under 64 KiB
// ✓ Superseded streams never written (generation check under the send lock)
// ✓ close() idempotent and safe from handler callbacks
// ✓ No logging per frame above trace

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{wait_for_state, TestServer};
    use crate::ws::handler::{ChannelHandler, WsEvent};
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    const URL: &str = "ws://feed.test/stream";

    async fn open_pair(config: WebSocketConfig) -> (WebSocket, TestServer, UnboundedReceiver<WsEvent>) {
        let ws = WebSocket::new(config);
        let (handler, events) = ChannelHandler::new();
        ws.set_handler(Arc::new(handler));

        let (client, mut server) = TestServer::pair();
        let (opened, _) = tokio::join!(ws.connect_stream(URL, client), server.accept());
        opened.unwrap();
        (ws, server, events)
    }

    async fn next_event(events: &mut UnboundedReceiver<WsEvent>) -> WsEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event timeout")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_open_transitions_to_open() {
        let (ws, _server, _events) = open_pair(WebSocketConfig::default()).await;
        assert_eq!(ws.state(), ConnectionState::Open);
        assert!(ws.response().unwrap().header("Sec-WebSocket-Accept").is_some());
        assert_eq!(ws.url().unwrap().as_str(), URL);
        assert!(ws.metrics().snapshot().connected);
    }

    #[tokio::test]
    async fn test_bad_accept_fails_handshake() {
        let ws = WebSocket::new(WebSocketConfig::default());
        let (client, mut server) = TestServer::pair();
        let (opened, _) = tokio::join!(ws.connect_stream(URL, client), server.accept_corrupted());
        assert!(matches!(opened, Err(WebSocketError::HandshakeFailed(_))));
        assert_eq!(ws.state(), ConnectionState::Closed);
        assert!(matches!(
            ws.send_text("x").await,
            Err(WebSocketError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dispatch_by_opcode() {
        let (_ws, mut server, mut events) = open_pair(WebSocketConfig::default()).await;

        server.send_frame(OpCode::Text, b"hello").await;
        server.send_frame(OpCode::Binary, &[1, 2, 3]).await;
        server.send_frame(OpCode::Pong, b"p").await;
        server.send_frame(OpCode::Text, &[b'o', 0xFF, b'k']).await;

        assert!(matches!(next_event(&mut events).await, WsEvent::Text(t) if t == "hello"));
        assert!(matches!(next_event(&mut events).await, WsEvent::Binary(b) if &b[..] == [1, 2, 3]));
        assert!(matches!(next_event(&mut events).await, WsEvent::Pong(b) if &b[..] == b"p"));
        assert!(matches!(next_event(&mut events).await, WsEvent::Text(t) if t == "o\u{FFFD}k"));
    }

    #[tokio::test]
    async fn test_ping_gets_auto_pong() {
        let (ws, mut server, _events) = open_pair(WebSocketConfig::default()).await;

        server.send_frame(OpCode::Ping, b"hb").await;
        let frame = server.read_frame().await.unwrap();
        assert_eq!(frame.opcode, OpCode::Pong);
        assert_eq!(&frame.payload[..], b"hb");

        ws.close().await;
        server.send_frame(OpCode::Ping, b"late").await;
        assert!(server.read_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_masked_sends_are_unmasked_by_server() {
        let config = WebSocketConfig {
            masking: true,
            ..Default::default()
        };
        let (ws, mut server, _events) = open_pair(config).await;
        ws.send_text("masked").await.unwrap();
        let frame = server.read_frame().await.unwrap();
        assert_eq!(&frame.payload[..], b"masked");
    }

    #[tokio::test]
    async fn test_peer_close_gets_one_echo() {
        let (ws, mut server, mut events) = open_pair(WebSocketConfig::default()).await;

        server
            .send_frame(OpCode::Close, &close_payload(CloseCode::GoingAway, b"bye"))
            .await;

        match next_event(&mut events).await {
            WsEvent::Shutdown { code, data } => {
                assert_eq!(code, CloseCode::GoingAway);
                assert_eq!(&data[..], b"bye");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let echo = server.read_frame().await.unwrap();
        assert_eq!(echo.opcode, OpCode::Close);
        assert_eq!(echo.close_parts().0, CloseCode::GoingAway);
        assert!(server.read_frame().await.is_none());
        assert_eq!(ws.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_local_shutdown_no_second_close() {
        let (ws, mut server, mut events) = open_pair(WebSocketConfig::default()).await;

        ws.shutdown(Some(CloseCode::Normal), Some(b"done")).await.unwrap();
        let sent = server.read_frame().await.unwrap();
        assert_eq!(sent.opcode, OpCode::Close);
        assert_eq!(sent.close_parts(), (CloseCode::Normal, Bytes::from_static(b"done")));

        assert!(matches!(
            ws.send_text("late").await,
            Err(WebSocketError::ConnectionClosed)
        ));

        server.send_frame(OpCode::Close, &close_payload(CloseCode::Normal, &[])).await;
        assert!(server.read_frame().await.is_none());
        assert_eq!(ws.state(), ConnectionState::Closed);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_argument_checks() {
        let (ws, _server, _events) = open_pair(WebSocketConfig::default()).await;
        assert!(matches!(
            ws.shutdown(None, Some(b"x")).await,
            Err(WebSocketError::InvalidArgument(_))
        ));
        assert!(matches!(
            ws.shutdown(Some(CloseCode::Normal), Some(&[0; 124])).await,
            Err(WebSocketError::InvalidArgument(_))
        ));
        assert!(matches!(
            ws.ping(Some(&[0; 126])).await,
            Err(WebSocketError::InvalidArgument(_))
        ));
        assert!(ws.ping(Some(&[0; 125])).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (ws, mut server, _events) = open_pair(WebSocketConfig::default()).await;
        ws.close().await;
        ws.close().await;
        assert_eq!(ws.state(), ConnectionState::Closed);
        assert!(server.read_frame().await.is_none());
        assert!(matches!(
            ws.send_binary(b"x").await,
            Err(WebSocketError::ConnectionClosed)
        ));
        assert!(!ws.metrics().snapshot().connected);
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (ws, mut server, _events) = open_pair(WebSocketConfig::default()).await;
        const N: usize = 32;

        let mut tasks = Vec::new();
        for i in 0..N {
            let ws = ws.clone();
            tasks.push(tokio::spawn(async move {
                // Mix of 7-bit, 16-bit and 64-bit length classes
                let body = format!("{i}:") + &"x".repeat((i % 3) * 40_000);
                ws.send_text(&body).await.unwrap();
                body
            }));
        }

        let mut expected = HashSet::new();
        let mut received = HashSet::new();
        for _ in 0..N {
            let frame = server.read_frame().await.unwrap();
            assert_eq!(frame.opcode, OpCode::Text);
            received.insert(String::from_utf8(frame.payload.to_vec()).unwrap());
        }
        for task in tasks {
            expected.insert(task.await.unwrap());
        }
        assert_eq!(expected, received);
    }

    #[tokio::test]
    async fn test_eof_reports_closed() {
        let (ws, server, mut events) = open_pair(WebSocketConfig::default()).await;
        drop(server);
        assert!(matches!(next_event(&mut events).await, WsEvent::Closed));
        wait_for_state(&ws, ConnectionState::Closed).await;
    }

    #[tokio::test]
    async fn test_protocol_violation_reports_error() {
        let (ws, mut server, mut events) = open_pair(WebSocketConfig::default()).await;
        server.send_masked_frame(OpCode::Text, b"bad").await;

        match next_event(&mut events).await {
            WsEvent::Error { operation, error } => {
                assert_eq!(operation, Operation::Receive);
                assert!(matches!(error, WebSocketError::UnexpectedServerMasking));
            }
            other => panic!("unexpected event {:?}", other),
        }
        wait_for_state(&ws, ConnectionState::Closed).await;
        assert_eq!(ws.metrics().snapshot().errors, 1);
    }

    #[tokio::test]
    async fn test_reopen_supersedes_old_stream() {
        let (ws, mut old_server, _events) = open_pair(WebSocketConfig::default()).await;

        let (client, mut new_server) = TestServer::pair();
        let (opened, _) = tokio::join!(ws.connect_stream(URL, client), new_server.accept());
        opened.unwrap();

        assert!(old_server.read_frame().await.is_none());
        ws.send_text("fresh").await.unwrap();
        let frame = new_server.read_frame().await.unwrap();
        assert_eq!(&frame.payload[..], b"fresh");
    }

    async fn wait_for_generation_change(ws: &WebSocket, before: u64) {
        let changed = timeout(Duration::from_secs(2), async {
            while ws.generation() == before {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        assert!(changed.is_ok(), "generation stuck at {before}");
    }

    #[tokio::test]
    async fn test_close_during_open_wins() {
        let ws = WebSocket::new(WebSocketConfig::default());
        let (client, mut server) = TestServer::pair();

        let opener = ws.clone();
        let open = tokio::spawn(async move { opener.connect_stream(URL, client).await });
        wait_for_state(&ws, ConnectionState::Handshaking).await;

        // The opener finishes the handshake and parks on the send lock
        let writer = ws.inner.writer.lock().await;
        server.accept().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let before = ws.generation();
        let closer = ws.clone();
        let close = tokio::spawn(async move { closer.close().await });
        wait_for_generation_change(&ws, before).await;
        drop(writer);

        let opened = open.await.unwrap();
        close.await.unwrap();
        assert!(matches!(opened, Err(WebSocketError::ConnectionClosed)));
        assert_eq!(ws.state(), ConnectionState::Closed);
        assert!(matches!(
            ws.send_text("late").await,
            Err(WebSocketError::ConnectionClosed)
        ));
        assert!(server.read_frame().await.is_none());
        assert!(!ws.metrics().snapshot().connected);
    }

    #[tokio::test]
    async fn test_send_racing_reopen_skips_both_streams() {
        let (ws, mut old_server, _events) = open_pair(WebSocketConfig::default()).await;

        // Queue a send behind the lock, then start a reopen behind it
        let writer = ws.inner.writer.lock().await;
        let sender = ws.clone();
        let send = tokio::spawn(async move { sender.send_text("stale").await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let before = ws.generation();
        let (client, mut new_server) = TestServer::pair();
        let reopener = ws.clone();
        let reopen = tokio::spawn(async move { reopener.connect_stream(URL, client).await });
        wait_for_generation_change(&ws, before).await;
        drop(writer);

        assert!(matches!(
            send.await.unwrap(),
            Err(WebSocketError::ConnectionClosed)
        ));
        new_server.accept().await;
        reopen.await.unwrap().unwrap();
        assert!(old_server.read_frame().await.is_none());

        ws.send_text("fresh").await.unwrap();
        let frame = new_server.read_frame().await.unwrap();
        assert_eq!(&frame.payload[..], b"fresh");
    }

    /// Duplex stream whose flush can be switched to fail
    struct FlakyFlush {
        inner: tokio::io::DuplexStream,
        fail: Arc<AtomicBool>,
    }

    impl tokio::io::AsyncRead for FlakyFlush {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl tokio::io::AsyncWrite for FlakyFlush {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.fail.load(Ordering::Acquire) {
                return std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }
            std::pin::Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_flush_failure_counts_as_error() {
        let ws = WebSocket::new(WebSocketConfig::default());
        let (client, mut server) = TestServer::pair();
        let fail = Arc::new(AtomicBool::new(false));
        let stream = FlakyFlush {
            inner: client,
            fail: fail.clone(),
        };
        let (opened, _) = tokio::join!(ws.connect_stream(URL, stream), server.accept());
        opened.unwrap();

        fail.store(true, Ordering::Release);
        assert!(matches!(
            ws.send_text("lost").await,
            Err(WebSocketError::Io(_))
        ));
        let snapshot = ws.metrics().snapshot();
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.frames_sent, 0);
    }

    #[test]
    fn test_receive_loop_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        fn check(receive_loop: ReceiveLoop) {
            assert_send(&receive_loop.run());
        }
        let _ = check as fn(ReceiveLoop);
    }

    #[tokio::test]
    async fn test_interop_with_tungstenite_echo() {
        use futures_util::{SinkExt, StreamExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut peer = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = peer.next().await {
                if msg.is_text() || msg.is_binary() {
                    peer.send(msg).await.unwrap();
                }
            }
        });

        // Compliant servers require masked client frames
        let ws = WebSocket::new(WebSocketConfig {
            masking: true,
            ..Default::default()
        });
        let (handler, mut events) = ChannelHandler::new();
        ws.set_handler(Arc::new(handler));
        ws.open(&format!("ws://127.0.0.1:{port}/echo")).await.unwrap();

        ws.send_text("hello interop").await.unwrap();
        assert!(matches!(next_event(&mut events).await, WsEvent::Text(t) if t == "hello interop"));

        let big = vec![0xAB; 70_000];
        ws.send_binary(&big).await.unwrap();
        assert!(matches!(next_event(&mut events).await, WsEvent::Binary(b) if b.len() == 70_000));

        ws.close().await;
    }
}
