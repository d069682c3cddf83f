//! Buffering and replay bookkeeping for cluster messages.
//!
//! [`MessageBuffer`] holds outbound facade messages so members that join
//! late still receive them. [`ReplayLog`] is the receiving-side dual: it
//! remembers message ids so a message that arrives both live and via replay
//! is executed only once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use berth_net::ClusterMessage;

/// How long a buffered message (or a seen-id record) stays relevant.
pub const MAX_MESSAGE_LIFETIME: Duration = Duration::from_secs(5 * 60);

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Ordered queue of cluster messages awaiting delivery to late joiners.
///
/// The queue is shared mutable state touched from the membership listener
/// task and from facade send paths; every multi-element operation happens
/// under the lock, so a message drained for one newly added member can
/// never be drained again for a later one.
#[derive(Default)]
pub struct MessageBuffer {
    inner: Mutex<Vec<ClusterMessage>>,
}

impl MessageBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the buffer.
    pub fn push(&self, msg: ClusterMessage) {
        self.inner.lock().expect("buffer lock poisoned").push(msg);
    }

    /// Take every currently buffered message, leaving the buffer empty.
    ///
    /// The swap happens atomically under the lock: concurrent drains for
    /// two different members split the buffer between them instead of
    /// delivering anything twice.
    pub fn drain(&self) -> Vec<ClusterMessage> {
        std::mem::take(&mut *self.inner.lock().expect("buffer lock poisoned"))
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("buffer lock poisoned").len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop messages older than `max_age`. Returns how many were dropped.
    pub fn purge_expired(&self, max_age: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(max_age.as_millis() as u64);
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        let before = inner.len();
        inner.retain(|msg| msg.timestamp >= cutoff);
        before - inner.len()
    }
}

/// Receiver-side record of message ids already executed.
#[derive(Default)]
pub struct ReplayLog {
    /// Message id → receipt timestamp (millis).
    seen: Mutex<HashMap<String, u64>>,
}

impl ReplayLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` as seen. Returns `true` if this is the first sighting,
    /// `false` for a duplicate (the caller should skip execution).
    pub fn first_seen(&self, id: &str) -> bool {
        let mut seen = self.seen.lock().expect("replay log lock poisoned");
        if seen.contains_key(id) {
            return false;
        }
        seen.insert(id.to_string(), now_millis());
        true
    }

    /// Drop seen-id records older than `max_age`. Returns how many were
    /// dropped.
    pub fn purge_expired(&self, max_age: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(max_age.as_millis() as u64);
        let mut seen = self.seen.lock().expect("replay log lock poisoned");
        let before = seen.len();
        seen.retain(|_, received_at| *received_at >= cutoff);
        before - seen.len()
    }
}
