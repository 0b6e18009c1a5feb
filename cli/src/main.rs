//! stampindex — digest stamp indexer for a co-located bitcoind.
//!
//! # Commands
//! ```text
//! stampindex run                 index the chain and serve the query API
//! stampindex tip                 print the persisted tip hash
//! stampindex lookup <digest>     scan the local index for a digest
//! stampindex info                print defaults and the store location
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use stampindex_core::keys::{decode_tip, TIP_KEY};
use stampindex_core::store::IndexStore;
use stampindex_storage::{store_path, RocksStore};

mod cmd_run;
mod config;
mod logging;

use config::{DaemonConfig, Overrides};

#[derive(Parser)]
#[command(
    name = "stampindex",
    about = "Index OP_RETURN digest stamps from a bitcoin full node",
    long_about = "
stampindex follows a co-located bitcoind, records every data-carrier output
as a digest index entry, and answers \"was this digest ever stamped\" queries.

ENVIRONMENT VARIABLES:
  STAMPINDEX_CONFIG        Path to the TOML configuration file
  STAMPINDEX_DATADIR       Node data directory (the index lives under it)
  STAMPINDEX_NETWORK       bitcoin | testnet | signet | regtest
  STAMPINDEX_RPC_URL       bitcoind RPC endpoint
  STAMPINDEX_RPC_USER      bitcoind RPC user
  STAMPINDEX_RPC_PASSWORD  bitcoind RPC password
  STAMPINDEX_LISTEN        Query API listen address
  STAMPINDEX_LOG           Log level
",
    version
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "STAMPINDEX_CONFIG")]
    config: Option<PathBuf>,

    /// Node data directory
    #[arg(long, global = true, env = "STAMPINDEX_DATADIR")]
    datadir: Option<PathBuf>,

    /// Network name
    #[arg(long, global = true, env = "STAMPINDEX_NETWORK")]
    network: Option<String>,

    /// bitcoind RPC endpoint
    #[arg(long, global = true, env = "STAMPINDEX_RPC_URL")]
    rpc_url: Option<String>,

    /// bitcoind RPC user
    #[arg(long, global = true, env = "STAMPINDEX_RPC_USER")]
    rpc_user: Option<String>,

    /// bitcoind RPC password
    #[arg(long, global = true, env = "STAMPINDEX_RPC_PASSWORD", hide_env_values = true)]
    rpc_password: Option<String>,

    /// Query API listen address
    #[arg(long, global = true, env = "STAMPINDEX_LISTEN")]
    listen: Option<String>,

    /// Log level
    #[arg(long, global = true, env = "STAMPINDEX_LOG")]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index the chain and serve the query API until interrupted
    Run,

    /// Print the persisted tip hash (does not contact the node)
    Tip,

    /// Scan the local index for a digest (no node enrichment)
    Lookup {
        /// Hex digest
        digest: String,
    },

    /// Print defaults and the resolved store location
    Info,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            datadir: self.datadir.clone(),
            network: self.network.clone(),
            rpc_url: self.rpc_url.clone(),
            rpc_user: self.rpc_user.clone(),
            rpc_password: self.rpc_password.clone(),
            listen: self.listen.clone(),
            log_level: self.log_level.clone(),
            log_json: self.log_json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    config.apply(&cli.overrides());
    logging::init_tracing(&config.log);

    match cli.command {
        Commands::Run => cmd_run::run(config).await,
        Commands::Tip => cmd_tip(&config).await,
        Commands::Lookup { digest } => cmd_lookup(&config, &digest).await,
        Commands::Info => cmd_info(&config),
    }
}

fn open_store(config: &DaemonConfig) -> Result<RocksStore> {
    let network = config.node.network()?;
    RocksStore::open_for_network(&config.node.datadir, network).context("open index store")
}

async fn cmd_tip(config: &DaemonConfig) -> Result<()> {
    let store = open_store(config)?;
    match store.get(TIP_KEY).await? {
        Some(raw) => println!("{}", decode_tip(&raw)),
        None => println!("no tip record (index is empty)"),
    }
    store.close().await?;
    Ok(())
}

async fn cmd_lookup(config: &DaemonConfig, digest: &str) -> Result<()> {
    let store = open_store(config)?;
    let entries = stampindex_api::scan_digest(&store, digest).await?;
    if entries.is_empty() {
        println!("{digest}: not found");
    }
    for entry in &entries {
        println!(
            "height {:>8}  {}:{}  block {}",
            entry.height, entry.txid, entry.output_index, entry.block_hash
        );
    }
    store.close().await?;
    Ok(())
}

fn cmd_info(config: &DaemonConfig) -> Result<()> {
    let network = config.node.network()?;
    let indexer = &config.indexer;
    println!("stampindex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Network: {network}");
    println!("  Node RPC: {}", config.node.rpc_url);
    println!(
        "  Store: {}",
        store_path(&config.node.datadir, network).display()
    );
    println!(
        "  Startup tip resolution: {} attempts, {}ms apart",
        indexer.tip_retry_attempts, indexer.tip_retry_interval_ms
    );
    println!("  Max reorg depth per pass: {} blocks", indexer.max_reorg_depth);
    println!(
        "  Query API: {}{}",
        config.api.listen,
        if config.api.route_prefix.is_empty() { "/" } else { &config.api.route_prefix }
    );
    Ok(())
}
