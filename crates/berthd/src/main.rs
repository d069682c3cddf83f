//! `berthd` — the Berth cluster membership daemon.
//!
//! Binary entrypoint that resolves the local member descriptor, joins the
//! cluster domain via the well-known-address membership scheme, and serves
//! the inter-member message listener.
//!
//! # Usage
//!
//! ```text
//! berthd start                               # start with defaults
//! berthd start -c berth.toml                 # start with a config file
//! berthd start -l 10.0.0.2:4100 --wka 10.0.0.1:4100
//! berthd check -c berth.toml                 # validate config and exit
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use berth_cluster::{
    LocalProvider, MemoryRegistry, MembershipRegistry, ReplayLog, WkaConfig, WkaMembershipScheme,
    MAX_MESSAGE_LIFETIME,
};
use berth_net::{ClusterMessage, TcpTransport};
use berth_types::{ClusterMember, MembershipEvent, WkaAddress};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use config::{CliConfig, SchemeKind};

/// How often expired buffered messages and seen-id records are purged.
const PURGE_INTERVAL: Duration = Duration::from_secs(2 * 60);

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "berthd", version, about = "Berth cluster membership daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon and join the cluster domain.
    Start {
        /// Override the cluster domain.
        #[arg(short, long, env = "BERTH_DOMAIN")]
        domain: Option<String>,

        /// Override the advertised local address (`host:port`).
        #[arg(short = 'l', long)]
        local_addr: Option<String>,

        /// Well-known member address (`host:port`). Can be specified
        /// multiple times; overrides the config file's list.
        #[arg(long)]
        wka: Vec<String>,
    },

    /// Validate the configuration and print the resolved local member.
    Check,
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    match cli.command {
        Commands::Start {
            domain,
            local_addr,
            wka,
        } => {
            // CLI args override config file values.
            if let Some(d) = domain {
                config.node.domain = d;
            }
            if let Some(addr) = local_addr {
                let addr: WkaAddress = addr
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid --local-addr: {e}"))?;
                config.node.local_host = addr.host;
                config.node.local_port = addr.port;
            }
            if !wka.is_empty() {
                config.cluster.well_known = wka;
            }
            cmd_start(config).await
        }
        Commands::Check => cmd_check(&config),
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// -----------------------------------------------------------------------
// berthd start
// -----------------------------------------------------------------------

async fn cmd_start(config: CliConfig) -> Result<()> {
    info!("starting berthd");

    let scheme_kind = config.scheme_kind()?;
    if scheme_kind != SchemeKind::Wka {
        bail!("membership scheme {scheme_kind} is not supported by this daemon (supported: wka)");
    }

    let wka_addresses = config.wka_addresses()?;
    if wka_addresses.is_empty() {
        bail!("no well-known addresses configured");
    }
    if is_loopback(&config.node.local_host) {
        warn!(
            host = %config.node.local_host,
            "advertised local host is a loopback address; remote members will not be able to connect to it"
        );
    }

    info!(
        domain = %config.node.domain,
        local = %format!("{}:{}", config.node.local_host, config.node.local_port),
        seeds = wka_addresses.len(),
        "node configuration"
    );

    // --- Local member descriptor ---
    let ctx = config.resolver_context();
    let mut local = ctx.local_member(
        &config.node.domain,
        &config.node.local_host,
        config.node.local_port,
    )?;
    if local.property("subDomain").is_none() {
        local.set_property("subDomain", config.sub_domain());
    }
    let member_id = member_id(&local);
    local.set_id(member_id.clone());
    info!(%local, id = %member_id, "local member resolved");

    // Bind the inter-member listener before joining, so the advertised port
    // is owned by this process by the time seeds probe it.
    let listener = TcpListener::bind((config.node.local_host.as_str(), config.node.local_port))
        .await
        .with_context(|| {
            format!(
                "failed to bind {}:{}",
                config.node.local_host, config.node.local_port
            )
        })?;

    // --- Membership scheme ---
    let provider = Arc::new(LocalProvider::new(local.clone()));
    let registry = Arc::new(MemoryRegistry::for_domain(&config.node.domain));
    let transport = Arc::new(TcpTransport::new());

    let mut scheme = WkaMembershipScheme::new(
        WkaConfig {
            domain: config.node.domain.clone(),
            wka_addresses,
            connection_timeout: config.connection_timeout(),
        },
        provider.clone(),
        registry.clone(),
        transport,
    );

    scheme
        .init()
        .await
        .context("membership scheme initialization failed")?;
    scheme
        .join_group()
        .await
        .context("failed to join cluster group")?;

    // Publish this member so every process in the domain sees it.
    registry.put(&member_id, local).await;

    // --- Inbound message listener ---
    // A message can reach us both live and via the late-joiner replay path;
    // the replay log makes sure it is handled only once.
    let replay_log = Arc::new(ReplayLog::new());
    {
        let log = replay_log.clone();
        tokio::spawn(TcpTransport::serve(listener, move |msg: ClusterMessage| {
            let log = log.clone();
            async move {
                if log.first_seen(&msg.id) {
                    info!(id = %msg.id, bytes = msg.payload.len(), "received cluster message");
                } else {
                    debug!(id = %msg.id, "dropped duplicate cluster message");
                }
            }
        }));
    }

    // --- Periodic expiry of buffered messages and seen-id records ---
    {
        let buffer = scheme.message_buffer();
        let log = replay_log.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let dropped = buffer.purge_expired(MAX_MESSAGE_LIFETIME)
                    + log.purge_expired(MAX_MESSAGE_LIFETIME);
                if dropped > 0 {
                    debug!(dropped, "purged expired cluster messages");
                }
            }
        });
    }

    // --- Event loop ---
    let mut events = scheme.subscribe();
    info!(domain = %scheme.domain(), "berthd ready");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(MembershipEvent::Added(member)) => {
                    info!(%member, alive = scheme.alive_member_count().await, "member added");
                }
                Ok(MembershipEvent::Removed(member)) => {
                    info!(%member, alive = scheme.alive_member_count().await, "member removed");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "lagged behind membership events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    scheme.leave();
    info!("berthd stopped");
    Ok(())
}

// -----------------------------------------------------------------------
// berthd check
// -----------------------------------------------------------------------

fn cmd_check(config: &CliConfig) -> Result<()> {
    let scheme_kind = config.scheme_kind()?;
    if scheme_kind != SchemeKind::Wka {
        bail!("membership scheme {scheme_kind} is not supported by this daemon (supported: wka)");
    }

    let wka_addresses = config.wka_addresses()?;
    let ctx = config.resolver_context();
    let mut local = ctx.local_member(
        &config.node.domain,
        &config.node.local_host,
        config.node.local_port,
    )?;
    if local.property("subDomain").is_none() {
        local.set_property("subDomain", config.sub_domain());
    }

    println!("Domain:       {}", config.node.domain);
    println!("Local member: {local}");
    println!("Member id:    {}", member_id(&local));
    println!("Seeds:        {}", wka_addresses.len());
    for addr in &wka_addresses {
        println!("  {addr}");
    }
    println!("Properties:");
    for (name, value) in local.properties() {
        println!("  {name} = {value}");
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------

/// Derive a stable member id from the member's `host:port` identity.
fn member_id(member: &ClusterMember) -> String {
    blake3::hash(member.socket_address().as_bytes()).to_hex()[..16].to_string()
}

/// Whether `host` is a loopback name or address.
fn is_loopback(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
