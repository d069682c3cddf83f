//! TOML configuration for the Berth daemon.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use berth_cluster::ResolverContext;
use berth_types::WkaAddress;
use serde::Deserialize;

/// Sub-domain assigned to members that do not declare one.
pub const DEFAULT_SUB_DOMAIN: &str = "__$default";

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Local member identity.
    pub node: NodeSection,
    /// Cluster membership.
    pub cluster: ClusterSection,
    /// Transport listener ports by name (`http = "9763"`), published into
    /// the member's property bag with the port offset applied.
    pub transport: BTreeMap<String, String>,
    /// Ordered member properties, replicated with the descriptor. Names and
    /// values may contain `${token}` placeholders.
    pub property: Vec<PropertyEntry>,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Cluster domain this process joins.
    pub domain: String,
    /// Host advertised to other members.
    pub local_host: String,
    /// Port for inter-member communication.
    pub local_port: u16,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            domain: "default".to_string(),
            local_host: "127.0.0.1".to_string(),
            local_port: 4100,
        }
    }
}

/// `[cluster]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Membership scheme kind. This daemon only runs `"wka"`.
    pub scheme: String,
    /// Well-known (seed) addresses, as `host:port` strings.
    pub well_known: Vec<String>,
    /// Override for the provider's address-list connect timeout.
    pub connection_timeout_secs: Option<u64>,
    /// When true, this process does not initiate services and no port
    /// offset is applied to transport ports.
    pub avoid_initiation: bool,
    /// Whether the member starts out handling load.
    pub is_active: Option<bool>,
    /// Sub-domain published in the member's property bag.
    pub sub_domain: Option<String>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            scheme: "wka".to_string(),
            well_known: Vec::new(),
            connection_timeout_secs: None,
            avoid_initiation: false,
            is_active: None,
            sub_domain: None,
        }
    }
}

/// One `[[property]]` entry.
#[derive(Debug, Deserialize)]
pub struct PropertyEntry {
    /// Property name; may contain `${token}` placeholders.
    pub name: String,
    /// Property value; may contain `${token}` placeholders.
    pub value: String,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// The membership scheme kinds a configuration may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemeKind {
    Multicast,
    Wka,
    Aws,
    Generic,
}

impl FromStr for SchemeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "multicast" => Ok(SchemeKind::Multicast),
            "wka" => Ok(SchemeKind::Wka),
            "aws" => Ok(SchemeKind::Aws),
            "generic" => Ok(SchemeKind::Generic),
            other => anyhow::bail!(
                "unknown membership scheme {other:?} (known: multicast, wka, aws, generic)"
            ),
        }
    }
}

impl fmt::Display for SchemeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchemeKind::Multicast => "multicast",
            SchemeKind::Wka => "wka",
            SchemeKind::Aws => "aws",
            SchemeKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// The configured membership scheme kind. Unknown kinds are
    /// configuration errors, not defaults.
    pub fn scheme_kind(&self) -> anyhow::Result<SchemeKind> {
        self.cluster.scheme.parse()
    }

    /// Parse the configured well-known addresses.
    pub fn wka_addresses(&self) -> anyhow::Result<Vec<WkaAddress>> {
        self.cluster
            .well_known
            .iter()
            .map(|s| {
                s.parse::<WkaAddress>()
                    .with_context(|| format!("invalid well-known address {s:?}"))
            })
            .collect()
    }

    /// Effective connect-timeout override for the provider.
    pub fn connection_timeout(&self) -> Option<Duration> {
        self.cluster.connection_timeout_secs.map(Duration::from_secs)
    }

    /// Effective sub-domain for the local member.
    pub fn sub_domain(&self) -> &str {
        self.cluster.sub_domain.as_deref().unwrap_or(DEFAULT_SUB_DOMAIN)
    }

    /// Build the local-member resolution context from this configuration
    /// and the process environment.
    pub fn resolver_context(&self) -> ResolverContext {
        let mut ctx = ResolverContext::from_env();
        ctx.avoid_initiation = self.cluster.avoid_initiation;
        ctx.is_active = self.cluster.is_active;
        ctx.properties = self
            .property
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect();
        ctx.transports = self.transport.clone();
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[node]
domain = "prod"
local_host = "10.0.0.1"
local_port = 4200

[cluster]
scheme = "wka"
well_known = ["10.0.0.1:4200", "10.0.0.2:4200"]
connection_timeout_secs = 30
avoid_initiation = true
is_active = false
sub_domain = "worker"

[transport]
http = "9763"
https = "9443"

[[property]]
name = "rack"
value = "r1"

[[property]]
name = "endpoint"
value = "${hostName}:${httpPort}"

[log]
level = "debug"
"#;

        let config = CliConfig::from_toml(toml).unwrap();
        assert_eq!(config.node.domain, "prod");
        assert_eq!(config.node.local_host, "10.0.0.1");
        assert_eq!(config.node.local_port, 4200);
        assert_eq!(config.scheme_kind().unwrap(), SchemeKind::Wka);
        assert_eq!(
            config.wka_addresses().unwrap(),
            vec![
                WkaAddress::new("10.0.0.1", 4200),
                WkaAddress::new("10.0.0.2", 4200),
            ]
        );
        assert_eq!(config.connection_timeout(), Some(Duration::from_secs(30)));
        assert!(config.cluster.avoid_initiation);
        assert_eq!(config.cluster.is_active, Some(false));
        assert_eq!(config.sub_domain(), "worker");
        assert_eq!(config.transport.get("http").map(String::as_str), Some("9763"));
        assert_eq!(config.property.len(), 2);
        assert_eq!(config.property[0].name, "rack");
        assert_eq!(config.property[1].value, "${hostName}:${httpPort}");
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = CliConfig::from_toml("").unwrap();
        assert_eq!(config.node.domain, "default");
        assert_eq!(config.node.local_host, "127.0.0.1");
        assert_eq!(config.node.local_port, 4100);
        assert_eq!(config.scheme_kind().unwrap(), SchemeKind::Wka);
        assert!(config.wka_addresses().unwrap().is_empty());
        assert_eq!(config.connection_timeout(), None);
        assert_eq!(config.sub_domain(), DEFAULT_SUB_DOMAIN);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[cluster]
well_known = ["10.0.0.9:4100"]
"#;
        let config = CliConfig::from_toml(toml).unwrap();
        assert_eq!(config.wka_addresses().unwrap().len(), 1);
        // Unspecified sections get defaults.
        assert_eq!(config.node.domain, "default");
        assert_eq!(config.scheme_kind().unwrap(), SchemeKind::Wka);
    }

    #[test]
    fn test_scheme_kind_validation() {
        assert_eq!("multicast".parse::<SchemeKind>().unwrap(), SchemeKind::Multicast);
        assert_eq!("aws".parse::<SchemeKind>().unwrap(), SchemeKind::Aws);
        assert_eq!("generic".parse::<SchemeKind>().unwrap(), SchemeKind::Generic);
        assert!("gossip".parse::<SchemeKind>().is_err());

        let config = CliConfig::from_toml("[cluster]\nscheme = \"bogus\"\n").unwrap();
        assert!(config.scheme_kind().is_err());
    }

    #[test]
    fn test_malformed_well_known_address_is_an_error() {
        let toml = r#"
[cluster]
well_known = ["10.0.0.1:4100", "not-an-address"]
"#;
        let config = CliConfig::from_toml(toml).unwrap();
        assert!(config.wka_addresses().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berth.toml");
        std::fs::write(
            &path,
            r#"
[node]
domain = "staging"
local_port = 4300
"#,
        )
        .unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.node.domain, "staging");
        assert_eq!(config.node.local_port, 4300);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = CliConfig::load(None).unwrap();
        assert_eq!(config.node.domain, "default");
    }

    #[test]
    fn test_resolver_context_mirrors_config() {
        let toml = r#"
[cluster]
avoid_initiation = true
is_active = true

[transport]
http = "9763"

[[property]]
name = "rack"
value = "r2"
"#;
        let config = CliConfig::from_toml(toml).unwrap();
        let ctx = config.resolver_context();
        assert!(ctx.avoid_initiation);
        assert_eq!(ctx.is_active, Some(true));
        assert_eq!(ctx.transports.get("http").map(String::as_str), Some("9763"));
        assert_eq!(ctx.properties, vec![("rack".to_string(), "r2".to_string())]);
    }
}
