//! Metrics collection for transport monitoring
//!
//! Lock-free counters using atomic operations.
//! Updated from the send path and the receive loop, read via `snapshot()`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use serde::Serialize;

/// Per-connection transport counters
#[derive(Debug)]
pub struct TransportMetrics {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    /// Pongs sent by the receive loop in reply to pings
    auto_pongs: AtomicU64,
    errors: AtomicU64,
    connected: AtomicBool,
    /// Last received frame (Unix millis)
    last_frame_time: AtomicU64,
    /// Start time for uptime and rate calculation
    start_time: Instant,
}

/// Metrics snapshot for logging/export
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransportSnapshot {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub auto_pongs: u64,
    pub errors: u64,
    pub connected: bool,
    pub last_frame_time: u64,
    pub frame_rate: f64, // frames received per second
    pub uptime_seconds: u64,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            auto_pongs: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            last_frame_time: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record one received frame of `payload_len` bytes
    #[inline]
    pub fn record_received(&self, payload_len: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(payload_len, Ordering::Relaxed);
        self.update_last_frame_time();
    }

    /// Record one sent frame of `wire_len` bytes
    #[inline]
    pub fn record_sent(&self, wire_len: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(wire_len, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_auto_pong(&self) {
        self.auto_pongs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    #[inline]
    fn update_last_frame_time(&self) {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_frame_time.store(now, Ordering::Relaxed);
    }

    /// Get current snapshot
    pub fn snapshot(&self) -> TransportSnapshot {
        let uptime = self.start_time.elapsed();
        let frames_received = self.frames_received.load(Ordering::Relaxed);
        let frame_rate = if uptime.as_secs_f64() > 0.0 {
            frames_received as f64 / uptime.as_secs_f64()
        } else {
            0.0
        };

        TransportSnapshot {
            frames_received,
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            auto_pongs: self.auto_pongs.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            last_frame_time: self.last_frame_time.load(Ordering::Relaxed),
            frame_rate,
            uptime_seconds: uptime.as_secs(),
        }
    }
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}
