//! Link activity tracking and WebSocket-level keep-alive
//!
//! `ActivityMonitor` is stamped by the receive loop on every frame.
//! `KeepAlive` runs beside a connection and pings when the link goes quiet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, Level};

use crate::log_ws;
use crate::ws::connection::{ConnectionState, WebSocket};
use crate::ws::error::{Result, WebSocketError};

/// Time of the last received frame
#[derive(Debug)]
pub struct ActivityMonitor {
    /// Reference point for the stored offsets
    started: Instant,
    /// Millis since `started` at the last frame
    last_frame_ms: AtomicU64,
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last_frame_ms: AtomicU64::new(0),
        }
    }

    /// Record activity now
    #[inline]
    pub fn record(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_frame_ms.store(now, Ordering::Relaxed);
    }

    /// Time since the last recorded activity
    #[inline]
    pub fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        let last = self.last_frame_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Idle for longer than `limit`
    #[inline]
    pub fn is_stale(&self, limit: Duration) -> bool {
        self.idle_for() > limit
    }
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic ping driver for one connection
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    /// Idle time before a ping goes out
    pub interval: Duration,
    /// Extra idle time allowed after the ping before giving up
    pub timeout: Duration,
}

impl KeepAlive {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Run until the connection closes or goes stale.
    ///
    /// Returns `ConnectionClosed` once the connection leaves Open and
    /// `Timeout` after `interval + timeout` without any received frame.
    /// Spawn it as a separate task.
    pub async fn run(&self, ws: &WebSocket) -> Result<()> {
        let period = (self.interval / 2).max(Duration::from_millis(10));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if ws.state() != ConnectionState::Open {
                return Err(WebSocketError::ConnectionClosed);
            }

            let idle = ws.monitor().idle_for();
            if idle > self.interval + self.timeout {
                log_ws!(Level::WARN, idle_ms = idle.as_millis() as u64, "Connection stale");
                return Err(WebSocketError::Timeout);
            }
            if idle >= self.interval {
                debug!(target: "ws", idle_ms = idle.as_millis() as u64, "Idle, sending ping");
                ws.ping(None).await?;
            }
        }
    }
}
