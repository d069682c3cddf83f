//! Shared membership registry: the replicated, domain-scoped view of who
//! belongs to the cluster.
//!
//! The registry itself is an external primitive — a replicated key-value
//! map owning its own consistency and locking. This module defines the
//! seam the membership scheme talks through ([`MembershipRegistry`]) and an
//! in-process implementation ([`MemoryRegistry`]) used by the daemon and by
//! tests to stand in for the real primitive.

use std::collections::HashMap;

use berth_types::ClusterMember;
use tokio::sync::{broadcast, RwLock};

/// Registry map naming convention: one map per cluster domain.
pub fn members_map_name(domain: &str) -> String {
    format!("${domain}.members")
}

/// An entry-change notification from the registry.
///
/// Delivered asynchronously on the registry's own delivery thread(s); the
/// registry view may lag or lead the provider's live membership view since
/// the two propagate independently.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A descriptor was published under a new member id.
    EntryAdded(ClusterMember),
    /// A member's entry was removed.
    EntryRemoved(ClusterMember),
    /// An existing entry was overwritten.
    EntryUpdated(ClusterMember),
    /// The primitive evicted an entry on its own.
    EntryEvicted(ClusterMember),
}

/// The replicated membership map, keyed by provider-assigned member id.
#[async_trait::async_trait]
pub trait MembershipRegistry: Send + Sync {
    /// The registry map name (see [`members_map_name`]).
    fn map_name(&self) -> &str;

    /// Look up the descriptor registered under `id`.
    async fn get(&self, id: &str) -> Option<ClusterMember>;

    /// Publish `member` under `id`, replacing any existing entry.
    async fn put(&self, id: &str, member: ClusterMember);

    /// Remove the entry under `id`, returning the removed descriptor.
    async fn remove(&self, id: &str) -> Option<ClusterMember>;

    /// Snapshot of all currently registered descriptors.
    async fn members(&self) -> Vec<ClusterMember>;

    /// Number of registered members.
    async fn member_count(&self) -> usize;

    /// Subscribe to entry-change notifications.
    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;
}

/// In-process registry implementation.
///
/// Backs the daemon's single-process mode and the test suite. Entry
/// listeners are fanned out through a broadcast channel, matching the
/// asynchronous delivery semantics of the real replicated primitive.
pub struct MemoryRegistry {
    name: String,
    entries: RwLock<HashMap<String, ClusterMember>>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl MemoryRegistry {
    /// Create an empty registry with an explicit map name.
    pub fn new(name: impl Into<String>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Create the registry for a cluster domain, using the standard
    /// naming convention.
    pub fn for_domain(domain: &str) -> Self {
        Self::new(members_map_name(domain))
    }
}

#[async_trait::async_trait]
impl MembershipRegistry for MemoryRegistry {
    fn map_name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str) -> Option<ClusterMember> {
        self.entries.read().await.get(id).cloned()
    }

    async fn put(&self, id: &str, member: ClusterMember) {
        let previous = self
            .entries
            .write()
            .await
            .insert(id.to_string(), member.clone());

        let event = if previous.is_some() {
            RegistryEvent::EntryUpdated(member)
        } else {
            RegistryEvent::EntryAdded(member)
        };
        let _ = self.event_tx.send(event);
    }

    async fn remove(&self, id: &str) -> Option<ClusterMember> {
        let removed = self.entries.write().await.remove(id);
        if let Some(member) = &removed {
            let _ = self.event_tx.send(RegistryEvent::EntryRemoved(member.clone()));
        }
        removed
    }

    async fn members(&self) -> Vec<ClusterMember> {
        self.entries.read().await.values().cloned().collect()
    }

    async fn member_count(&self) -> usize {
        self.entries.read().await.len()
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }
}
