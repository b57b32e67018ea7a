//! udsonip - command-line front end for multi-ECU UDS over DoIP
//!
//! Discovers DoIP entities on the local segment and talks to the named
//! peers from a configuration file through one shared gateway connection.

mod commands;
mod output;

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use udsonip::UdsOnIpConfig;

use crate::output::OutputContext;

#[derive(Parser)]
#[command(name = "udsonip")]
#[command(author, version, about = "Multi-ECU UDS over DoIP")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "UDSONIP_CONFIG")]
    config: Option<PathBuf>,

    /// Gateway address, overriding the configured DoIP host
    #[arg(long, env = "UDSONIP_GATEWAY")]
    gateway: Option<IpAddr>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover DoIP entities (broadcast request + announcements)
    Discover {
        /// Discovery window in milliseconds (defaults to the configured value)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Ask one entity to identify itself
    Identify {
        /// Entity IP address
        ip: IpAddr,

        /// Wait in milliseconds
        #[arg(long, default_value = "2000")]
        timeout_ms: u64,
    },

    /// Send identification requests to every host of an IPv4 network
    Scan {
        /// Network in CIDR notation, e.g. 192.168.1.0/24
        network: String,

        /// Wait per batch of hosts in milliseconds
        #[arg(long, default_value = "1000")]
        timeout_ms: u64,

        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// List configured peers
    Peers,

    /// Read a data identifier from a peer
    Read {
        /// Peer name
        peer: String,

        /// Data identifier (hex, e.g. F190 or 0xF190)
        did: String,
    },

    /// Send Tester Present to a peer
    TesterPresent {
        /// Peer name
        peer: String,
    },

    /// Change the diagnostic session of a peer
    Session {
        /// Peer name
        peer: String,

        /// Session: default, programming, extended, or a hex id
        #[arg(value_name = "SESSION")]
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "udsonip=debug"
    } else {
        "udsonip=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let config = match &cli.config {
        Some(path) => UdsOnIpConfig::from_file(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => UdsOnIpConfig::default(),
    };

    let ctx = OutputContext::new(cli.no_color, cli.quiet);

    match &cli.command {
        Commands::Discover { timeout_ms, json } => {
            commands::discover(&config, *timeout_ms, *json, &ctx).await?;
        }

        Commands::Identify { ip, timeout_ms } => {
            commands::identify(&config, *ip, *timeout_ms, &ctx).await?;
        }

        Commands::Scan {
            network,
            timeout_ms,
            json,
        } => {
            commands::scan(&config, network, *timeout_ms, *json, &ctx).await?;
        }

        Commands::Peers => {
            commands::peers(&config, &ctx)?;
        }

        Commands::Read { peer, did } => {
            let registry = commands::open_registry(&config, cli.gateway).await?;
            let result = commands::read(&registry, peer, did, &ctx).await;
            registry.close().await;
            result?;
        }

        Commands::TesterPresent { peer } => {
            let registry = commands::open_registry(&config, cli.gateway).await?;
            let result = commands::tester_present(&registry, peer, &ctx).await;
            registry.close().await;
            result?;
        }

        Commands::Session { peer, session } => {
            let registry = commands::open_registry(&config, cli.gateway).await?;
            let result = commands::session(&registry, peer, session, &ctx).await;
            registry.close().await;
            result?;
        }
    }

    Ok(())
}
