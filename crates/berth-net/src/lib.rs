//! Network layer for the Berth cluster membership subsystem.
//!
//! This crate implements the pieces of networking the membership scheme
//! needs:
//!
//! - [`ClusterMessage`] — the replayable cluster message unit, sent as a
//!   length-prefixed postcard frame.
//! - [`TcpTransport`] — pooled TCP connections for delivering messages to
//!   members addressed by `host:port`.
//! - [`probe`] — the synchronous-in-spirit reachability probe used to check
//!   whether a well-known address is currently live.

mod error;
mod message;
pub mod probe;
mod transport;

pub use error::NetError;
pub use message::ClusterMessage;
pub use transport::TcpTransport;

/// Trait abstracting message delivery to a cluster member.
///
/// The membership scheme only needs "send this serialized message to member
/// X"; keeping it behind a trait lets tests substitute a recording mock for
/// the real TCP transport.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a message to the given member, addressed by its
    /// `host:port` identity.
    async fn send_to(
        &self,
        member: &berth_types::ClusterMember,
        msg: &ClusterMessage,
    ) -> Result<(), NetError>;
}
