//! utxo-node daemon: entry point for running a node.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use utxo_node::logging::{init_logging, LogFormat};
use utxo_node::{Miner, Node, NodeConfig, Store, Synchronizer};

#[derive(Parser)]
#[command(name = "utxo-node", about = "Minimal proof-of-work UTXO node")]
struct Cli {
    /// Path to a TOML configuration file. CLI flags override its values.
    #[arg(long, env = "UTXO_NODE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to accept peer connections on.
    #[arg(long, env = "UTXO_NODE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Bootstrap peer; may be repeated.
    #[arg(long = "peer", env = "UTXO_NODE_PEERS", value_delimiter = ',')]
    peers: Vec<SocketAddr>,

    /// Directory for chain state and the peer list.
    #[arg(long, env = "UTXO_NODE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Mine blocks in the background.
    #[arg(long)]
    mine: bool,

    /// Use the low-difficulty regtest chain.
    #[arg(long)]
    regtest: bool,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[arg(long, env = "UTXO_NODE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: "human" or "json".
    #[arg(long, env = "UTXO_NODE_LOG_FORMAT")]
    log_format: Option<String>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_toml_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => NodeConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if !self.peers.is_empty() {
            config.bootstrap_peers = self.peers;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if self.mine {
            config.mining.enabled = true;
        }
        if self.regtest {
            config.chain = utxo_node::ChainParams::regtest();
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config()?;
    init_logging(config.log_format.parse::<LogFormat>()?, &config.log_level)?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let store = Store::new(&config.data_dir);
    let (ledger, mempool) = store.load_or_genesis(&config.chain, &config.mempool);
    tracing::info!(
        height = ledger.height(),
        tip = %hex::encode(ledger.tip().hash),
        data_dir = %config.data_dir.display(),
        "chain state loaded"
    );

    let persist_interval = Duration::from_secs(config.persist_retry_secs.max(1));
    let (handle, node_task) = Node::new(ledger, mempool)
        .with_store(store.clone(), persist_interval)
        .spawn();

    let (shutdown_tx, shutdown) = watch::channel(false);
    let sync = Synchronizer::new(config.clone(), handle.clone(), Some(store), shutdown.clone());
    let listen = sync.start().await?;
    tracing::info!(%listen, peers = config.bootstrap_peers.len(), "node started");

    let miner_task = if config.mining.enabled {
        let miner = Miner::new(handle.clone(), config.mining.recipient()?, config.mining.nonce_batch);
        Some(tokio::spawn(miner.run(shutdown.clone())))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping node");
    let _ = shutdown_tx.send(true);
    if let Some(task) = miner_task {
        let _ = task.await;
    }
    handle.flush().await?;
    drop(handle);
    drop(sync);
    // Peer tasks may still hold handles; the flush above already saved
    let _ = tokio::time::timeout(Duration::from_secs(2), node_task).await;

    tracing::info!("node exited cleanly");
    Ok(())
}
