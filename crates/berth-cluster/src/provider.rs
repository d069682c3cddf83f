//! Seam to the group-communication provider.
//!
//! The provider is the external primitive that detects low-level member
//! join/leave and transports group messages — the ground truth of "who is
//! currently reachable". The membership scheme only configures its
//! discovery mechanism and address list and listens to its membership
//! notifications; everything else stays behind [`GroupProvider`].

use std::time::Duration;

use berth_types::{ClusterMember, WkaAddress};
use tokio::sync::{broadcast, RwLock};

use crate::error::ProviderError;

/// How the provider discovers peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Network-level multicast discovery.
    Multicast,
    /// Discovery by dialing a configured address list (used by the WKA
    /// scheme; multicast is disabled when this is selected).
    AddressList,
}

/// A membership notification from the provider.
///
/// For a single member, added/removed arrive in the order the provider
/// observed them; no ordering holds between these and registry entry
/// events for the same member.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// The provider established contact with a member.
    MemberAdded(ClusterMember),
    /// The provider lost contact with a member.
    MemberRemoved(ClusterMember),
}

/// The group-communication provider as seen by the membership scheme.
#[async_trait::async_trait]
pub trait GroupProvider: Send + Sync {
    /// This process's own member descriptor, as the provider knows it.
    fn local_member(&self) -> ClusterMember;

    /// Select the discovery mechanism.
    async fn set_discovery(&self, mode: DiscoveryMode) -> Result<(), ProviderError>;

    /// The currently selected discovery mechanism.
    async fn discovery(&self) -> DiscoveryMode;

    /// Override the provider's connect timeout for address-list dialing.
    async fn set_connect_timeout(&self, timeout: Duration) -> Result<(), ProviderError>;

    /// Add an address to the provider's address list.
    ///
    /// Returns `false` when the address was already present (`host:port`
    /// string identity). The provider owns its own locking; callers must
    /// treat the dedup as best-effort, not a correctness guarantee.
    async fn add_address(&self, address: &WkaAddress) -> Result<bool, ProviderError>;

    /// Snapshot of the configured address list.
    async fn addresses(&self) -> Vec<WkaAddress>;

    /// Subscribe to membership notifications.
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;
}

struct ProviderState {
    discovery: DiscoveryMode,
    connect_timeout: Option<Duration>,
    addresses: Vec<WkaAddress>,
}

/// In-process provider implementation.
///
/// Used by the daemon's single-process mode and by tests, which drive
/// membership changes through [`LocalProvider::announce_member_added`] and
/// [`LocalProvider::announce_member_removed`].
pub struct LocalProvider {
    local: ClusterMember,
    state: RwLock<ProviderState>,
    event_tx: broadcast::Sender<ProviderEvent>,
}

impl LocalProvider {
    /// Create a provider for the given local member.
    pub fn new(local: ClusterMember) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            local,
            state: RwLock::new(ProviderState {
                discovery: DiscoveryMode::Multicast,
                connect_timeout: None,
                addresses: Vec::new(),
            }),
            event_tx,
        }
    }

    /// The configured connect timeout, if one was set.
    pub async fn connect_timeout(&self) -> Option<Duration> {
        self.state.read().await.connect_timeout
    }

    /// Emit a member-added notification to all listeners.
    pub fn announce_member_added(&self, member: ClusterMember) {
        let _ = self.event_tx.send(ProviderEvent::MemberAdded(member));
    }

    /// Emit a member-removed notification to all listeners.
    pub fn announce_member_removed(&self, member: ClusterMember) {
        let _ = self.event_tx.send(ProviderEvent::MemberRemoved(member));
    }
}

#[async_trait::async_trait]
impl GroupProvider for LocalProvider {
    fn local_member(&self) -> ClusterMember {
        self.local.clone()
    }

    async fn set_discovery(&self, mode: DiscoveryMode) -> Result<(), ProviderError> {
        self.state.write().await.discovery = mode;
        Ok(())
    }

    async fn discovery(&self) -> DiscoveryMode {
        self.state.read().await.discovery
    }

    async fn set_connect_timeout(&self, timeout: Duration) -> Result<(), ProviderError> {
        self.state.write().await.connect_timeout = Some(timeout);
        Ok(())
    }

    async fn add_address(&self, address: &WkaAddress) -> Result<bool, ProviderError> {
        let mut state = self.state.write().await;
        if state.addresses.contains(address) {
            return Ok(false);
        }
        state.addresses.push(address.clone());
        Ok(true)
    }

    async fn addresses(&self) -> Vec<WkaAddress> {
        self.state.read().await.addresses.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.event_tx.subscribe()
    }
}
