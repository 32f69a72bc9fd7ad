//! Feed engine
//!
//! Opens every configured feed, sends its subscriptions and fans all feed
//! output into one channel tagged with the feed name. Each feed gets a
//! forwarding task, an optional keep-alive task, and shares one periodic
//! stats task with the others.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Level;

use crate::infrastructure::config::{EngineConfig, FeedConfig, FeedProtocol};
use crate::infrastructure::metrics::TransportSnapshot;
use crate::log_engine;
use crate::protocols::{Packet, PusherClient, PusherEvent, SocketIoClient, SocketIoEvent};
use crate::ws::{ChannelHandler, KeepAlive, WebSocket, WebSocketConfig, WebSocketError, WsEvent};
use crate::Result;

/// Output of one feed
#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub feed: Arc<str>,
    pub kind: FeedEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEventKind {
    /// Application payload: socket.io message/json/event data, Pusher
    /// channel data, or a raw text frame
    Text(String),
    Binary(Bytes),
    Error(String),
    Closed,
}

enum Feed {
    SocketIo(SocketIoClient),
    Pusher(PusherClient),
    Raw(WebSocket),
}

impl Feed {
    fn websocket(&self) -> &WebSocket {
        match self {
            Feed::SocketIo(client) => client.websocket(),
            Feed::Pusher(client) => client.websocket(),
            Feed::Raw(ws) => ws,
        }
    }

    async fn close(&self) {
        match self {
            Feed::SocketIo(client) => client.close().await,
            Feed::Pusher(client) => client.close().await,
            Feed::Raw(ws) => ws.close().await,
        }
    }
}

/// Runs a set of feeds over a shared transport configuration
pub struct FeedEngine {
    transport: WebSocketConfig,
    settings: EngineConfig,
    feeds: Vec<(Arc<str>, Feed)>,
    tasks: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<FeedEvent>,
}

impl FeedEngine {
    pub fn new(
        transport: WebSocketConfig,
        settings: EngineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<FeedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            transport,
            settings,
            feeds: Vec::new(),
            tasks: Vec::new(),
            events: tx,
        };
        (engine, rx)
    }

    /// Open all feeds, then start the stats task. Stops at the first feed
    /// that fails to open and closes the ones already open.
    pub async fn start(&mut self, feeds: &[FeedConfig]) -> Result<()> {
        log_engine!(Level::INFO, feeds = feeds.len(), "Starting feed engine");
        for feed in feeds {
            if let Err(e) = self.add_feed(feed).await {
                log_engine!(Level::ERROR, feed = %feed.name, error = %e, "Failed to open feed");
                self.shutdown().await;
                return Err(e);
            }
        }
        self.spawn_stats();
        Ok(())
    }

    /// Open one feed and send its subscriptions
    pub async fn add_feed(&mut self, config: &FeedConfig) -> Result<()> {
        let name: Arc<str> = Arc::from(config.name.as_str());
        log_engine!(Level::INFO, feed = %name, protocol = ?config.protocol, url = %config.url, "Opening feed");

        let feed = match config.protocol {
            FeedProtocol::SocketIo => self.open_socketio(&name, config).await?,
            FeedProtocol::Pusher => self.open_pusher(&name, config).await?,
            FeedProtocol::WebSocket => self.open_raw(&name, config).await?,
        };

        if let Some(secs) = config.keepalive_secs.filter(|s| *s > 0) {
            let interval = Duration::from_secs(secs);
            self.spawn_keepalive(name.clone(), feed.websocket().clone(), interval);
        }

        self.feeds.push((name, feed));
        Ok(())
    }

    async fn open_socketio(&mut self, name: &Arc<str>, config: &FeedConfig) -> Result<Feed> {
        let (client, mut rx) = SocketIoClient::new(self.transport.clone());
        client.open(&config.url).await?;

        let endpoint = config.endpoint.as_deref();
        if endpoint.is_some() {
            client.connect(endpoint, None).await?;
        }
        for payload in &config.subscribe {
            client.json(payload, None, endpoint).await?;
        }

        let feed = name.clone();
        let tx = self.events.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let kind = match event {
                    SocketIoEvent::Packet(Packet::Message(env))
                    | SocketIoEvent::Packet(Packet::Json(env))
                    | SocketIoEvent::Packet(Packet::Event(env)) => FeedEventKind::Text(env.data),
                    SocketIoEvent::Packet(Packet::Error(env)) => FeedEventKind::Error(env.data),
                    SocketIoEvent::Packet(other) => {
                        log_engine!(Level::DEBUG, feed = %feed, packet = ?other.packet_type(), "Control packet");
                        continue;
                    }
                    SocketIoEvent::Error(e) => FeedEventKind::Error(e.to_string()),
                    SocketIoEvent::Closed => FeedEventKind::Closed,
                };
                if !forward(&tx, &feed, kind) {
                    break;
                }
            }
        }));

        Ok(Feed::SocketIo(client))
    }

    async fn open_pusher(&mut self, name: &Arc<str>, config: &FeedConfig) -> Result<Feed> {
        let (client, mut rx) = PusherClient::new(self.transport.clone());
        client.open(&config.url).await?;
        for channel in &config.channels {
            client.subscribe(channel).await?;
        }

        let feed = name.clone();
        let tx = self.events.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let kind = match event {
                    PusherEvent::Data(envelope) => FeedEventKind::Text(match envelope.data {
                        Value::String(text) => text,
                        other => other.to_string(),
                    }),
                    PusherEvent::Connected(established) => {
                        log_engine!(Level::INFO, feed = %feed, socket_id = %established.socket_id, "Pusher connected");
                        continue;
                    }
                    PusherEvent::ServerError { message, code } => FeedEventKind::Error(format!(
                        "pusher error {}: {}",
                        code.map(|c| c.to_string()).unwrap_or_default(),
                        message.unwrap_or_default()
                    )),
                    PusherEvent::Error(e) => FeedEventKind::Error(e.to_string()),
                    PusherEvent::Closed => FeedEventKind::Closed,
                    PusherEvent::SubscriptionSucceeded { .. }
                    | PusherEvent::Pong
                    | PusherEvent::Unexpected(_) => continue,
                };
                if !forward(&tx, &feed, kind) {
                    break;
                }
            }
        }));

        Ok(Feed::Pusher(client))
    }

    async fn open_raw(&mut self, name: &Arc<str>, config: &FeedConfig) -> Result<Feed> {
        let ws = WebSocket::new(self.transport.clone());
        let (handler, mut rx) = ChannelHandler::new();
        ws.set_handler(Arc::new(handler));
        ws.open(&config.url).await?;
        for payload in &config.subscribe {
            ws.send_text(payload).await?;
        }

        let feed = name.clone();
        let tx = self.events.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let kind = match event {
                    WsEvent::Text(text) => FeedEventKind::Text(text),
                    WsEvent::Binary(data) => FeedEventKind::Binary(data),
                    WsEvent::Pong(_) => continue,
                    WsEvent::Error { error, .. } => {
                        // Errors end the connection
                        if !forward(&tx, &feed, FeedEventKind::Error(error.to_string())) {
                            break;
                        }
                        FeedEventKind::Closed
                    }
                    WsEvent::Shutdown { .. } | WsEvent::Closed => FeedEventKind::Closed,
                };
                if !forward(&tx, &feed, kind) {
                    break;
                }
            }
        }));

        Ok(Feed::Raw(ws))
    }

    fn spawn_keepalive(&mut self, feed: Arc<str>, ws: WebSocket, interval: Duration) {
        self.tasks.push(tokio::spawn(async move {
            let keepalive = KeepAlive::new(interval, interval);
            match keepalive.run(&ws).await {
                Err(WebSocketError::Timeout) => {
                    log_engine!(Level::WARN, feed = %feed, "Feed stale, closing");
                    ws.close().await;
                }
                Err(WebSocketError::ConnectionClosed) | Ok(()) => {}
                Err(e) => {
                    log_engine!(Level::WARN, feed = %feed, error = %e, "Keep-alive stopped");
                }
            }
        }));
    }

    fn spawn_stats(&mut self) {
        if self.settings.stats_interval_secs == 0 || self.feeds.is_empty() {
            return;
        }
        let period = Duration::from_secs(self.settings.stats_interval_secs);
        let sockets: Vec<(Arc<str>, WebSocket)> = self
            .feeds
            .iter()
            .map(|(name, feed)| (name.clone(), feed.websocket().clone()))
            .collect();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for (name, ws) in &sockets {
                    let s = ws.metrics().snapshot();
                    log_engine!(
                        Level::INFO,
                        feed = %name,
                        connected = s.connected,
                        frames_received = s.frames_received,
                        frames_sent = s.frames_sent,
                        bytes_received = s.bytes_received,
                        frame_rate = s.frame_rate,
                        errors = s.errors,
                        "Feed stats"
                    );
                }
            }
        }));
    }

    pub fn feed_names(&self) -> Vec<Arc<str>> {
        self.feeds.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Current transport metrics of every feed
    pub fn snapshots(&self) -> Vec<(Arc<str>, TransportSnapshot)> {
        self.feeds
            .iter()
            .map(|(name, feed)| (name.clone(), feed.websocket().metrics().snapshot()))
            .collect()
    }

    /// Close all feeds and stop the background tasks
    pub async fn shutdown(&mut self) {
        log_engine!(Level::INFO, feeds = self.feeds.len(), "Shutting down feed engine");
        for (_, feed) in &self.feeds {
            feed.close().await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.feeds.clear();
    }
}

/// Returns false once nobody is listening
fn forward(tx: &mpsc::UnboundedSender<FeedEvent>, feed: &Arc<str>, kind: FeedEventKind) -> bool {
    tx.send(FeedEvent {
        feed: feed.clone(),
        kind,
    })
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    /// tungstenite server that expects one subscription, then pushes two
    /// updates and closes
    async fn spawn_feed_server() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut peer = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let first = peer.next().await.unwrap().unwrap();
            assert_eq!(first.into_text().unwrap().as_str(), r#"{"op":"subscribe"}"#);
            peer.send(Message::text("tick 1")).await.unwrap();
            peer.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
            peer.close(None).await.unwrap();
        });
        port
    }

    fn raw_feed(name: &str, port: u16) -> FeedConfig {
        FeedConfig {
            name: name.into(),
            protocol: FeedProtocol::WebSocket,
            url: format!("ws://127.0.0.1:{port}/stream"),
            endpoint: None,
            subscribe: vec![r#"{"op":"subscribe"}"#.into()],
            channels: Vec::new(),
            keepalive_secs: Some(5),
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<FeedEvent>) -> FeedEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("engine dropped")
    }

    #[tokio::test]
    async fn test_raw_feed_fan_in() {
        let port = spawn_feed_server().await;
        let transport = WebSocketConfig {
            masking: true,
            ..Default::default()
        };
        let (mut engine, mut rx) = FeedEngine::new(transport, EngineConfig::default());
        engine.start(&[raw_feed("tickers", port)]).await.unwrap();
        assert_eq!(engine.feed_names(), vec![Arc::<str>::from("tickers")]);

        let event = next(&mut rx).await;
        assert_eq!(&*event.feed, "tickers");
        assert_eq!(event.kind, FeedEventKind::Text("tick 1".into()));
        assert_eq!(
            next(&mut rx).await.kind,
            FeedEventKind::Binary(Bytes::from_static(&[1, 2, 3]))
        );
        assert_eq!(next(&mut rx).await.kind, FeedEventKind::Closed);

        let snapshots = engine.snapshots();
        assert!(snapshots[0].1.frames_received >= 2);
        engine.shutdown().await;
        assert!(engine.feed_names().is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_on_unreachable_feed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (mut engine, _rx) = FeedEngine::new(WebSocketConfig::default(), EngineConfig::default());
        let result = engine.start(&[raw_feed("dead", port)]).await;
        assert!(result.is_err());
        assert!(engine.feed_names().is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_closes_opened_feeds() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = listener.local_addr().unwrap().port();
        let (ended_tx, ended_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut peer = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(_)) = peer.next().await {}
            let _ = ended_tx.send(());
        });

        let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let transport = WebSocketConfig {
            masking: true,
            ..Default::default()
        };
        let (mut engine, _rx) = FeedEngine::new(transport, EngineConfig::default());
        let result = engine
            .start(&[raw_feed("live", live_port), raw_feed("dead", dead_port)])
            .await;
        assert!(result.is_err());
        assert!(engine.feed_names().is_empty());
        assert!(engine.tasks.is_empty());
        timeout(Duration::from_secs(2), ended_rx)
            .await
            .expect("live feed left open")
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_url_is_rejected() {
        let (mut engine, _rx) = FeedEngine::new(WebSocketConfig::default(), EngineConfig::default());
        let mut feed = raw_feed("bad", 1);
        feed.url = "ftp://example.com".into();
        assert!(matches!(
            engine.add_feed(&feed).await,
            Err(crate::ExchangeWsError::WebSocket(WebSocketError::InvalidUrl(_)))
        ));
    }
}
