//! Error types for network operations.

/// Errors that can occur during network operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Failed to connect to a remote member.
    #[error("connection error: {0}")]
    Connect(String),

    /// An I/O error on an established connection.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An inbound frame exceeded the maximum allowed size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Size announced in the length prefix.
        size: usize,
        /// The configured maximum.
        max: usize,
    },
}
