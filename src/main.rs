//! socksbridge - expose remote services locally through a SOCKS5 proxy
//!
//! Every mapping in the config file gets its own listener. Connections to it
//! are carried through the mapping's SOCKS5 upstream to a fixed IPv4 target.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use socksbridge_config::{MappingConfig, DEFAULT_CONFIG_PATH};
use socksbridge_server::ProxyEndpoint;

/// socksbridge - forward local ports to remote services through SOCKS5
#[derive(Parser, Debug)]
#[command(name = "socksbridge")]
#[command(about = "Forward local ports to remote services through SOCKS5 proxies")]
#[command(version)]
#[command(long_about = r#"
Listens on one local address per configured mapping. Each accepted
connection is carried through the mapping's SOCKS5 proxy (no auth,
IPv4 CONNECT) to the mapping's target service.

CONFIG FILE (JSON, or YAML with a .yml/.yaml extension):
  [
    {
      "name": "db",
      "socks5_ip": "10.0.0.1", "socks5_port": "1080",
      "service_ip": "192.168.1.20", "service_port": "5432",
      "listen_addr": "127.0.0.1", "listen_port": "15432"
    }
  ]

ENVIRONMENT VARIABLES:
  SOCKSBRIDGE_CONFIG  Config file path
  RUST_LOG            Log filter (overrides --log-level)
"#)]
struct Cli {
    /// Config file path
    #[arg(short, long, env = "SOCKSBRIDGE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate the config file, print the mappings and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    info!("Loading config from {}", cli.config.display());

    let mappings = socksbridge_config::load(&cli.config)
        .with_context(|| format!("Failed to load config file {:?}", cli.config))?;

    if cli.check {
        print_mappings(&mappings);
        return Ok(());
    }

    run_endpoints(mappings).await
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn print_mappings(mappings: &[MappingConfig]) {
    println!("{} mapping(s):", mappings.len());
    for mapping in mappings {
        let state = if mapping.enabled { "" } else { " (disabled)" };
        println!("  {}{}", mapping, state);
    }
}

/// Serve every enabled mapping. Endpoints fail independently; the process
/// only exits once none is left running.
async fn run_endpoints(mappings: Vec<MappingConfig>) -> Result<()> {
    let mut endpoints = JoinSet::new();

    for mapping in mappings {
        if !mapping.enabled {
            info!("Mapping {} is disabled, skipping", mapping.name);
            continue;
        }

        let name = mapping.name.clone();
        endpoints.spawn(async move { (name, ProxyEndpoint::start(mapping).await) });
    }

    let total = endpoints.len();
    let mut stopped = 0;

    while let Some(joined) = endpoints.join_next().await {
        stopped += 1;
        match joined {
            Ok((name, Err(e))) => error!("Endpoint {} stopped: {}", name, e),
            Ok((name, Ok(()))) => warn!("Endpoint {} stopped", name),
            Err(e) => error!("Endpoint task failed: {}", e),
        }

        let remaining = total - stopped;
        if remaining > 0 {
            warn!("{} of {} endpoint(s) still running", remaining, total);
        }
    }

    bail!("All {} endpoint(s) stopped", total)
}
