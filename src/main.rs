//! Okura node binary.
//!
//! Loads `okura.toml` from the data directory, applies command-line
//! overrides and runs the node until Ctrl-C.
//!
//! Usage:
//!   okura-node                                  # run with ./okura-data
//!   okura-node --data-dir /srv/okura --my-ip 10.0.0.4 \
//!              --peers 10.0.0.5,10.0.0.6 --delegated-account 3

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use okura::config::OkuraConfig;
use okura::node::Node;

/// Okura delegated proof-of-synergy node.
#[derive(Parser, Debug)]
#[command(name = "okura-node", version, about = "Okura blockchain node")]
struct Cli {
    /// Data directory holding okura.toml, the ledger and wallet keys.
    #[arg(long, default_value = "./okura-data")]
    data_dir: PathBuf,

    /// Address to bind the topic listeners on.
    #[arg(long)]
    listen_host: Option<IpAddr>,

    /// Our own address as peers see it.
    #[arg(long)]
    my_ip: Option<Ipv4Addr>,

    /// Bootstrap peer addresses (comma-separated).
    #[arg(long, value_delimiter = ',')]
    peers: Vec<Ipv4Addr>,

    /// Delegated account this node operates; 0 runs a non-validating node.
    #[arg(long)]
    delegated_account: Option<u8>,
}

impl Cli {
    fn apply(self, config: &mut OkuraConfig) {
        if let Some(host) = self.listen_host {
            config.network.listen_host = host;
        }
        if let Some(ip) = self.my_ip {
            config.node.my_ip = ip;
        }
        if !self.peers.is_empty() {
            config.node.bootstrap_peers = self.peers;
        }
        if let Some(id) = self.delegated_account {
            config.node.delegated_account = id;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = OkuraConfig::load(&cli.data_dir);
    cli.apply(&mut config);

    tracing::info!("Starting Okura node...");
    tracing::info!("Data: {}", config.node.data_dir);
    tracing::info!("Listen: {}", config.network.listen_host);

    let shutdown = CancellationToken::new();
    let mut node = Node::start(config, shutdown.clone()).await?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal.cancel(),
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    node.run(shutdown).await;
    Ok(())
}
