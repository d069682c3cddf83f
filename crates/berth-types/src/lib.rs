//! Shared types for the Berth cluster membership subsystem.
//!
//! This crate defines the types passed between the membership scheme, the
//! network layer, and the daemon:
//!
//! - [`ClusterMember`] — the descriptor for one cluster participant.
//! - [`MembershipEvent`] — added/removed notifications pushed to the facade.
//! - [`WkaAddress`] — a configured well-known (seed) address.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Property key that overrides the host a member advertises to others.
///
/// A member may be reachable externally through a different host than the
/// one its group-communication socket is bound to (NAT, proxies). When the
/// property is present, [`ClusterMember::host_name`] returns it instead of
/// the constructor host.
pub const REMOTE_HOST_PROPERTY: &str = "remoteHost";

/// Descriptor for one cluster participant.
///
/// Identity is defined **solely** by `(host, port)`: two descriptors with
/// the same host and port are the same member regardless of property bag,
/// domain, active flag, or provider-assigned id. `PartialEq` and `Hash` are
/// implemented by hand to keep that invariant — a property change after
/// registration never re-keys the member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMember {
    host: String,
    port: u16,
    /// Whether the member currently participates in load handling. A higher
    /// layer may flip this (administrative pause) without removing the
    /// member from the registry.
    active: bool,
    /// Cluster domain, set once when the member joins.
    domain: Option<String>,
    /// Free-form properties replicated with the descriptor.
    properties: BTreeMap<String, String>,
    /// Opaque unique id assigned by the group-communication provider.
    id: Option<String>,
}

impl ClusterMember {
    /// Create a descriptor for a member reachable at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            active: true,
            domain: None,
            properties: BTreeMap::new(),
            id: None,
        }
    }

    /// The advertised host name: the `remoteHost` property override if
    /// present, else the constructor host.
    pub fn host_name(&self) -> &str {
        self.properties
            .get(REMOTE_HOST_PROPERTY)
            .map(String::as_str)
            .unwrap_or(&self.host)
    }

    /// The host this member was constructed with (ignores `remoteHost`).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The member's port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The `host:port` socket address string, derived from the identity
    /// fields (not from the `remoteHost` override).
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether this member and `other` are the same network endpoint.
    ///
    /// Exact host **and** port equality. Used for self-echo suppression and
    /// local-member exclusion when seeding address lists.
    pub fn same_address(&self, other: &ClusterMember) -> bool {
        self.host == other.host && self.port == other.port
    }

    /// Whether the member is active.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Flip the active flag.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// The cluster domain, if already set.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Set the cluster domain. Done once, at join time.
    pub fn set_domain(&mut self, domain: impl Into<String>) {
        self.domain = Some(domain.into());
    }

    /// The provider-assigned unique id, if the member has one yet.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Record the provider-assigned unique id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    /// The property bag.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Replace the whole property bag. No merge.
    pub fn set_properties(&mut self, properties: BTreeMap<String, String>) {
        self.properties = properties;
    }

    /// Set a single property, returning the previous value.
    pub fn set_property(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Option<String> {
        self.properties.insert(key.into(), value.into())
    }

    /// Look up a single property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

impl PartialEq for ClusterMember {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for ClusterMember {}

impl Hash for ClusterMember {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for ClusterMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_name(), self.port)
    }
}

/// A membership change notification pushed to the cluster facade.
///
/// Created by the membership scheme each time the provider reports a
/// change; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipEvent {
    /// The member became reachable.
    Added(ClusterMember),
    /// The member left or was declared unreachable.
    Removed(ClusterMember),
}

impl MembershipEvent {
    /// The member the event is about.
    pub fn member(&self) -> &ClusterMember {
        match self {
            MembershipEvent::Added(m) | MembershipEvent::Removed(m) => m,
        }
    }
}

/// A configured well-known (seed) address.
///
/// The ordered seed list is immutable after scheme initialization; members
/// whose `(host, port)` matches a seed address are retained in the registry
/// on disconnect so reconnection keeps being attempted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WkaAddress {
    /// Seed host name or IP address.
    pub host: String,
    /// Seed port.
    pub port: u16,
}

impl WkaAddress {
    /// Create a seed address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether `member` is this seed, by exact host+port equality.
    pub fn matches(&self, member: &ClusterMember) -> bool {
        self.host == member.host() && self.port == member.port()
    }
}

impl fmt::Display for WkaAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error parsing a `host:port` string into a [`WkaAddress`].
#[derive(Debug, thiserror::Error)]
#[error("invalid well-known address {input:?}: {reason}")]
pub struct AddressParseError {
    /// The string that failed to parse.
    pub input: String,
    /// What was wrong with it.
    pub reason: String,
}

impl FromStr for WkaAddress {
    type Err = AddressParseError;

    /// Parse `host:port`. The port must be numeric; the host must be
    /// non-empty. Malformed values are configuration errors, not defaults.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| AddressParseError {
            input: s.to_string(),
            reason: "expected host:port".to_string(),
        })?;
        if host.is_empty() {
            return Err(AddressParseError {
                input: s.to_string(),
                reason: "empty host".to_string(),
            });
        }
        let port: u16 = port.parse().map_err(|_| AddressParseError {
            input: s.to_string(),
            reason: format!("malformed port {port:?}"),
        })?;
        Ok(WkaAddress::new(host, port))
    }
}
