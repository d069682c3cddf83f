//! The well-known-address (WKA) membership scheme.
//!
//! Coordinates the pieces of domain membership: configures the provider's
//! address-list discovery from the seed list, joins the shared membership
//! registry, reconciles the provider's live view with the registry's
//! replicated view, and replays buffered cluster messages to members that
//! join late.
//!
//! The scheme owns no threads of its own beyond one listener task spawned
//! by [`WkaMembershipScheme::join_group`]; that task is the single writer
//! for all membership bookkeeping, so the two independent notification
//! sources (provider and registry) never race each other inside the
//! scheme.

use std::sync::Arc;

use berth_net::{probe, ClusterMessage, Transport};
use berth_types::{ClusterMember, MembershipEvent, WkaAddress};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::buffer::MessageBuffer;
use crate::error::ClusterError;
use crate::provider::{DiscoveryMode, GroupProvider, ProviderEvent};
use crate::registry::{MembershipRegistry, RegistryEvent};

/// Static configuration for the WKA scheme.
#[derive(Debug, Clone)]
pub struct WkaConfig {
    /// Cluster domain this process joins.
    pub domain: String,
    /// Ordered well-known (seed) addresses. Immutable after `init`.
    pub wka_addresses: Vec<WkaAddress>,
    /// Optional override for the provider's address-list connect timeout.
    pub connection_timeout: Option<std::time::Duration>,
}

/// Lifecycle of the scheme. Transitions only move forward; a failed
/// operation leaves the scheme in its prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemeState {
    Uninitialized,
    Initialized,
    Joined,
}

/// The WKA membership scheme coordinator.
pub struct WkaMembershipScheme {
    domain: String,
    wka_addresses: Arc<Vec<WkaAddress>>,
    connection_timeout: Option<std::time::Duration>,
    provider: Arc<dyn GroupProvider>,
    registry: Arc<dyn MembershipRegistry>,
    transport: Arc<dyn Transport>,
    buffer: Arc<MessageBuffer>,
    event_tx: broadcast::Sender<MembershipEvent>,
    shutdown_tx: watch::Sender<bool>,
    state: SchemeState,
    listener_task: Option<tokio::task::JoinHandle<()>>,
}

impl WkaMembershipScheme {
    /// Create a scheme over the given collaborators. The scheme starts
    /// uninitialized; call [`init`](Self::init) then
    /// [`join_group`](Self::join_group).
    pub fn new(
        config: WkaConfig,
        provider: Arc<dyn GroupProvider>,
        registry: Arc<dyn MembershipRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            domain: config.domain,
            wka_addresses: Arc::new(config.wka_addresses),
            connection_timeout: config.connection_timeout,
            provider,
            registry,
            transport,
            buffer: Arc::new(MessageBuffer::new()),
            event_tx,
            shutdown_tx,
            state: SchemeState::Uninitialized,
            listener_task: None,
        }
    }

    /// The cluster domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The configured seed addresses.
    pub fn wka_addresses(&self) -> &[WkaAddress] {
        &self.wka_addresses
    }

    /// Subscribe to the membership events this scheme forwards to the
    /// cluster facade.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.event_tx.subscribe()
    }

    /// Handle to the outbound message buffer, for the facade's send path.
    pub fn message_buffer(&self) -> Arc<MessageBuffer> {
        self.buffer.clone()
    }

    /// Buffer a facade message for replay to members that join late.
    pub fn enqueue(&self, msg: ClusterMessage) {
        self.buffer.push(msg);
    }

    /// Number of members currently in the registry.
    pub async fn alive_member_count(&self) -> usize {
        self.registry.member_count().await
    }

    /// Configure the provider for WKA membership.
    ///
    /// Switches discovery to the address list (disabling multicast),
    /// applies the connect-timeout override, and adds every configured
    /// seed to the provider's address list, probing each one so the log
    /// records which seeds are currently live. Runs once during startup
    /// and may block on network I/O; not retried internally.
    pub async fn init(&mut self) -> Result<(), ClusterError> {
        if self.state != SchemeState::Uninitialized {
            return Err(ClusterError::Init(
                "membership scheme is already initialized".to_string(),
            ));
        }

        self.provider
            .set_discovery(DiscoveryMode::AddressList)
            .await
            .map_err(|e| ClusterError::Init(format!("could not configure discovery: {e}")))?;

        if let Some(timeout) = self.connection_timeout {
            self.provider
                .set_connect_timeout(timeout)
                .await
                .map_err(|e| {
                    ClusterError::Init(format!("could not apply connection timeout: {e}"))
                })?;
        }

        for seed in self.wka_addresses.iter() {
            // Advisory probe: seeds are added even when currently offline,
            // the provider detects them once they come up.
            let reachable = probe::can_connect(&seed.host, seed.port).await;
            let added = self
                .provider
                .add_address(seed)
                .await
                .map_err(|e| ClusterError::Init(format!("could not add {seed}: {e}")))?;
            match (added, reachable) {
                (true, true) => info!(%seed, "added well-known member"),
                (true, false) => info!(%seed, "added well-known member (not yet reachable)"),
                (false, _) => debug!(%seed, "well-known member already configured"),
            }
        }

        self.state = SchemeState::Initialized;
        info!(domain = %self.domain, seeds = self.wka_addresses.len(), "WKA membership scheme initialized");
        Ok(())
    }

    /// Join the cluster group.
    ///
    /// Installs the provider-level membership listener and the
    /// registry-level entry listener, then seeds the provider's address
    /// list with every member already in the registry (excluding the local
    /// member) so a late joiner dials everyone directly instead of waiting
    /// for discovery.
    pub async fn join_group(&mut self) -> Result<(), ClusterError> {
        match self.state {
            SchemeState::Uninitialized => {
                return Err(ClusterError::Join(
                    "membership scheme is not initialized".to_string(),
                ));
            }
            SchemeState::Joined => {
                return Err(ClusterError::Join(
                    "membership scheme has already joined".to_string(),
                ));
            }
            SchemeState::Initialized => {}
        }

        let local = self.provider.local_member();

        // Subscribe before seeding so notifications raced with the join
        // are buffered in the receivers rather than lost.
        let provider_rx = self.provider.subscribe();
        let registry_rx = self.registry.subscribe();

        for member in self.registry.members().await {
            if member.same_address(&local) {
                continue;
            }
            let address = WkaAddress::new(member.host().to_string(), member.port());
            self.provider
                .add_address(&address)
                .await
                .map_err(|e| ClusterError::Join(format!("could not add {address}: {e}")))?;
            debug!(%address, "seeded address list from registry");
        }

        let listener = SchemeListener {
            local,
            wka_addresses: self.wka_addresses.clone(),
            provider: self.provider.clone(),
            registry: self.registry.clone(),
            transport: self.transport.clone(),
            buffer: self.buffer.clone(),
            event_tx: self.event_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        self.listener_task = Some(tokio::spawn(listener.run(provider_rx, registry_rx)));

        self.state = SchemeState::Joined;
        info!(domain = %self.domain, "joined cluster group");
        Ok(())
    }

    /// Stop the listener task. The scheme cannot be re-joined.
    pub fn leave(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether the listener task is still running.
    pub fn is_running(&self) -> bool {
        self.listener_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

/// The single-writer listener over both notification sources.
struct SchemeListener {
    local: ClusterMember,
    wka_addresses: Arc<Vec<WkaAddress>>,
    provider: Arc<dyn GroupProvider>,
    registry: Arc<dyn MembershipRegistry>,
    transport: Arc<dyn Transport>,
    buffer: Arc<MessageBuffer>,
    event_tx: broadcast::Sender<MembershipEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SchemeListener {
    async fn run(
        mut self,
        mut provider_rx: broadcast::Receiver<ProviderEvent>,
        mut registry_rx: broadcast::Receiver<RegistryEvent>,
    ) {
        debug!("membership listener started");
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                event = provider_rx.recv() => match event {
                    Ok(ProviderEvent::MemberAdded(member)) => self.member_added(member).await,
                    Ok(ProviderEvent::MemberRemoved(member)) => self.member_removed(member).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "lagged behind provider notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = registry_rx.recv() => match event {
                    Ok(RegistryEvent::EntryAdded(member)) => self.entry_added(member).await,
                    // Removal propagation is handled through the provider's
                    // view; reacting to it here as well would be redundant
                    // and racy.
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "lagged behind registry notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        debug!("membership listener stopped");
    }

    /// Provider reported a member as reachable.
    async fn member_added(&mut self, member: ClusterMember) {
        // Some providers echo the local member's own join back; suppress
        // it by exact host+port identity.
        if member.same_address(&self.local) {
            debug!(%member, "ignoring self membership notification");
            return;
        }

        info!(%member, "member joined cluster");
        let _ = self.event_tx.send(MembershipEvent::Added(member.clone()));

        // Replay the buffer to exactly this member. The drain removes the
        // messages, so a later joiner never sees them again; delivery is
        // at-most-once — a failed send is logged and dropped.
        let pending = self.buffer.drain();
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), %member, "replaying buffered messages to new member");
        for msg in &pending {
            if let Err(e) = self.transport.send_to(&member, msg).await {
                warn!(id = %msg.id, %member, "dropped buffered message: {e}");
            }
        }
    }

    /// Provider lost contact with a member.
    async fn member_removed(&mut self, member: ClusterMember) {
        info!(%member, "member left cluster");
        let _ = self.event_tx.send(MembershipEvent::Removed(member.clone()));

        let Some(id) = member.id() else {
            debug!(%member, "removed member carries no registry id");
            return;
        };
        if self.registry.get(id).await.is_none() {
            // Already gone from the replicated view.
            return;
        }

        if self.wka_addresses.iter().any(|seed| seed.matches(&member)) {
            // Seed members are kept in the registry so every process keeps
            // attempting reconnection against them.
            info!(%member, "well-known member left; retaining registry entry for reconnection");
        } else {
            self.registry.remove(id).await;
            debug!(%member, "removed member from registry");
        }
    }

    /// Some process published a new registry entry; mirror it into the
    /// provider's address list so address-based discovery stays in sync
    /// even before the provider-level event arrives locally.
    async fn entry_added(&mut self, member: ClusterMember) {
        if member.same_address(&self.local) {
            return;
        }
        let address = WkaAddress::new(member.host().to_string(), member.port());
        match self.provider.add_address(&address).await {
            Ok(true) => debug!(%address, "added registry member to address list"),
            Ok(false) => {}
            Err(e) => warn!(%address, "could not add registry member to address list: {e}"),
        }
    }
}
