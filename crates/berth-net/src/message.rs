//! The cluster message unit carried by the transport.

use serde::{Deserialize, Serialize};

/// A serialized cluster-facade message.
///
/// The membership subsystem treats the payload as opaque: the facade
/// serializes whatever it wants delivered to members, and the id lets
/// receivers drop duplicates when a message reaches them both live and via
/// the late-joiner replay path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMessage {
    /// Opaque unique id, assigned by the sender.
    pub id: String,
    /// Serialized facade payload.
    pub payload: Vec<u8>,
    /// Unix timestamp (millis) when the message entered the buffer. Used
    /// for expiry, not ordering.
    pub timestamp: u64,
}

impl ClusterMessage {
    /// Create a message stamped with the current wall-clock time.
    pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            id: id.into(),
            payload,
            timestamp,
        }
    }

    /// Create a message with a generated id: the first 16 hex chars of a
    /// blake3 digest over a nanosecond timestamp.
    pub fn with_generated_id(payload: Vec<u8>) -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let id = blake3::hash(&nanos.to_le_bytes()).to_hex()[..16].to_string();
        Self::new(id, payload)
    }
}
