//! Resolution of the local member descriptor from configuration.
//!
//! [`ResolverContext`] carries everything resolution needs — configuration
//! parameters, transport listener ports, and an environment snapshot — as
//! an explicit immutable value. There is no process-wide init step: build a
//! context, call [`ResolverContext::local_member`], and multiple
//! configurations can coexist in one process.

use std::collections::BTreeMap;

use berth_types::ClusterMember;
use tracing::debug;

use crate::error::ClusterError;

/// Transport listener name whose configured port becomes `httpPort`.
pub const HTTP_TRANSPORT: &str = "http";
/// Transport listener name whose configured port becomes `httpsPort`.
pub const HTTPS_TRANSPORT: &str = "https";

/// Environment variable holding the per-instance port offset.
pub const PORT_OFFSET_ENV: &str = "PORT_OFFSET";

/// Transient property available to `${...}` substitution but removed
/// before the descriptor is published.
const HOST_NAME_KEY: &str = "hostName";

/// Bound on placeholder rescanning; values that keep expanding into new
/// placeholders stop here instead of looping.
const MAX_PLACEHOLDER_PASSES: usize = 8;

/// Configuration context for local member resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolverContext {
    /// When true, this process does not initiate services and the port
    /// offset is never applied.
    pub avoid_initiation: bool,
    /// Configured `isActive` flag, copied into the property bag when set.
    pub is_active: Option<bool>,
    /// Configured property block, in declaration order. Names and values
    /// may contain `${token}` placeholders.
    pub properties: Vec<(String, String)>,
    /// Transport listener ports by name (`"http"`, `"https"`), as the raw
    /// configured strings.
    pub transports: BTreeMap<String, String>,
    /// Environment snapshot consulted for the port offset and for
    /// placeholder fallback.
    pub env: BTreeMap<String, String>,
}

impl ResolverContext {
    /// Capture the process environment into an otherwise empty context.
    pub fn from_env() -> Self {
        Self {
            env: std::env::vars().collect(),
            ..Self::default()
        }
    }

    /// Build this process's member descriptor.
    ///
    /// `host` and `port` are the advertised local address; `domain` is the
    /// cluster domain the member joins. Malformed port or offset values
    /// fail the whole resolution — no silent defaulting.
    pub fn local_member(
        &self,
        domain: &str,
        host: &str,
        port: u16,
    ) -> Result<ClusterMember, ClusterError> {
        let mut member = ClusterMember::new(host, port);
        let offset = self.port_offset()?;

        let mut bag: BTreeMap<String, String> = BTreeMap::new();
        bag.insert(HOST_NAME_KEY.to_string(), host.to_string());

        if let Some(raw) = self.transports.get(HTTP_TRANSPORT) {
            bag.insert(
                "httpPort".to_string(),
                offset_port(raw, offset, HTTP_TRANSPORT)?.to_string(),
            );
        }
        if let Some(raw) = self.transports.get(HTTPS_TRANSPORT) {
            bag.insert(
                "httpsPort".to_string(),
                offset_port(raw, offset, HTTPS_TRANSPORT)?.to_string(),
            );
        }

        if let Some(active) = self.is_active {
            bag.insert("isActive".to_string(), active.to_string());
        }

        for (name, value) in &self.properties {
            let name = resolve_placeholders(name, &bag, &self.env);
            let value = resolve_placeholders(value, &bag, &self.env);
            bag.insert(name, value);
        }

        // The helper key exists only for substitution and must not leak
        // into the published bag.
        bag.remove(HOST_NAME_KEY);

        member.set_properties(bag);
        member.set_domain(domain);
        debug!(%member, domain, "resolved local member");
        Ok(member)
    }

    /// The effective port offset: 0 unless service initiation is allowed
    /// and the environment provides an override.
    fn port_offset(&self) -> Result<i32, ClusterError> {
        if self.avoid_initiation {
            return Ok(0);
        }
        match self.env.get(PORT_OFFSET_ENV) {
            Some(raw) => raw.trim().parse().map_err(|_| {
                ClusterError::Config(format!("malformed {PORT_OFFSET_ENV} value {raw:?}"))
            }),
            None => Ok(0),
        }
    }
}

/// Parse a configured listener port and apply the offset.
fn offset_port(raw: &str, offset: i32, listener: &str) -> Result<u16, ClusterError> {
    let port: u16 = raw.trim().parse().map_err(|_| {
        ClusterError::Config(format!("malformed {listener} listener port {raw:?}"))
    })?;
    u16::try_from(port as i32 + offset).map_err(|_| {
        ClusterError::Config(format!(
            "{listener} listener port {port} with offset {offset} is out of range"
        ))
    })
}

/// Resolve `${token}` placeholders in `input`.
///
/// Each token is looked up in the partially-built property bag first, then
/// in the environment snapshot; unresolved tokens are left verbatim. The
/// string is rescanned (a substituted value may itself contain
/// placeholders) up to a fixed pass limit.
fn resolve_placeholders(
    input: &str,
    bag: &BTreeMap<String, String>,
    env: &BTreeMap<String, String>,
) -> String {
    let mut current = input.to_string();
    for _ in 0..MAX_PLACEHOLDER_PASSES {
        let (next, substituted) = substitute_pass(&current, bag, env);
        current = next;
        if !substituted {
            break;
        }
    }
    current
}

/// One left-to-right pass: replace every resolvable `${token}`, leave the
/// rest untouched. Returns whether any substitution happened.
fn substitute_pass(
    input: &str,
    bag: &BTreeMap<String, String>,
    env: &BTreeMap<String, String>,
) -> (String, bool) {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    let mut substituted = false;

    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start + 2..].find('}') else {
            // Unterminated token: keep the tail verbatim.
            break;
        };
        let token = &rest[start + 2..start + 2 + end];
        let after = &rest[start + 2 + end + 1..];

        out.push_str(&rest[..start]);
        match bag.get(token).or_else(|| env.get(token)) {
            Some(value) => {
                out.push_str(value);
                substituted = true;
            }
            None => {
                // No substitution available: leave the token literal.
                out.push_str(&rest[start..start + 2 + end + 1]);
            }
        }
        rest = after;
    }
    out.push_str(rest);
    (out, substituted)
}
