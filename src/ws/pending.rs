//! Request/response correlation table
//!
//! The send path registers a one-shot slot under a fresh token; the receive
//! loop resolves it when the matching reply arrives. Waiting is bounded by a
//! timeout and fails fast when the connection drops the table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::ws::error::{Result, WebSocketError};

/// Pending requests keyed by a monotonically increasing token
#[derive(Debug)]
pub struct PendingRequests<T> {
    slots: Mutex<HashMap<u64, oneshot::Sender<T>>>,
    next_token: AtomicU64,
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Allocate a token and its completion slot
    pub fn register(&self) -> (u64, oneshot::Receiver<T>) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(token, tx);
        (token, rx)
    }

    /// Complete the request `token`. False if nobody is waiting on it.
    pub fn resolve(&self, token: u64, value: T) -> bool {
        match self.slots.lock().remove(&token) {
            // Receiver may have timed out already
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Forget `token` without notifying the waiter
    pub fn remove(&self, token: u64) -> bool {
        self.slots.lock().remove(&token).is_some()
    }

    /// Drop every slot; waiters fail with `ConnectionClosed`
    pub fn fail_all(&self) -> usize {
        let mut slots = self.slots.lock();
        let count = slots.len();
        slots.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Wait for the reply to `token`, at most `timeout`
    pub async fn wait(&self, token: u64, rx: oneshot::Receiver<T>, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(WebSocketError::ConnectionClosed),
            Err(_) => {
                self.remove(token);
                Err(WebSocketError::Timeout)
            }
        }
    }
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}
