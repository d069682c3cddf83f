//! Error types for the cluster membership subsystem.

/// An error surfaced by the group-communication provider.
///
/// Providers own their own failure modes; this wrapper carries whatever
/// description the implementation gives.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ProviderError(pub String);

/// Errors produced by the membership subsystem.
///
/// Initialization and join failures are caller-visible and not retried
/// internally; the caller decides whether to retry the whole startup
/// sequence.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Seed configuration or provider setup failed during `init`.
    #[error("membership scheme initialization failed: {0}")]
    Init(String),

    /// Attaching to the provider or the registry failed during `join_group`.
    #[error("failed to join cluster group: {0}")]
    Join(String),

    /// Invalid or malformed configuration values.
    #[error("configuration error: {0}")]
    Config(String),

    /// A network-level error.
    #[error("network error: {0}")]
    Net(#[from] berth_net::NetError),

    /// An error from the group-communication provider.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}
