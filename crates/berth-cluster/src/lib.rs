//! Well-known-address (WKA) cluster membership.
//!
//! This crate implements the membership subsystem of a Berth cluster
//! domain:
//!
//! - [`resolver`] — builds the local member descriptor from configuration.
//! - [`registry`] — the shared, replicated membership map (seam + in-process
//!   implementation).
//! - [`provider`] — the group-communication provider seam.
//! - [`scheme`] — the WKA coordinator: seed configuration, group join,
//!   membership reconciliation, late-joiner message replay.
//! - [`buffer`] — outbound message buffering and replay dedup.

pub mod buffer;
mod error;
pub mod provider;
pub mod registry;
pub mod resolver;
pub mod scheme;

#[cfg(test)]
mod tests;

pub use buffer::{MessageBuffer, ReplayLog, MAX_MESSAGE_LIFETIME};
pub use error::{ClusterError, ProviderError};
pub use provider::{DiscoveryMode, GroupProvider, LocalProvider, ProviderEvent};
pub use registry::{members_map_name, MembershipRegistry, MemoryRegistry, RegistryEvent};
pub use resolver::ResolverContext;
pub use scheme::{WkaConfig, WkaMembershipScheme};
