#![doc = include_str!("../README.md")]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{command, Parser};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, subscriber::set_global_default, warn};
use tracing_subscriber::filter::EnvFilter;

use ccwallet_bitcoin_client::BitcoinClient;
use ccwallet_spv_chain::{BlockchainConfig, ChainEvent, SqliteChunkStore, VerifiedBlockchain};
use ccwallet_spv_verify::ChainParams;

use crate::{
    network::BitcoindNetwork,
    rpc::{RpcConfig, RpcServer},
    shutdown::Shutdown,
};

mod network;
mod rpc;
mod shutdown;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// RPC server host
    #[arg(long, default_value = "127.0.0.1:5000")]
    rpc_host: String,
    /// Bitcoin RPC URL
    #[arg(long, env = "BITCOIN_RPC")]
    bitcoin_rpc_url: String,
    /// Bitcoin RPC user:password (optional)
    #[arg(long, env = "USERPWD")]
    bitcoin_rpc_userpwd: Option<String>,
    /// Path to the database storing the verified header chain
    #[arg(long, default_value = "./.spv_data/chain.sqlite")]
    db_path: PathBuf,
    /// Verify against testnet rules (minimum-difficulty blocks)
    #[arg(long)]
    testnet: bool,
    /// Maximum number of cached verified transactions
    #[arg(long, default_value = "250")]
    tx_cache_size: usize,
    /// Maximum number of cached verified headers
    #[arg(long, default_value = "5000")]
    header_cache_size: usize,
    /// Interval between Bitcoin Core tip polls, in seconds
    #[arg(long, default_value = "10")]
    poll_interval_secs: u64,
    /// Logging level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber_builder =
        tracing_subscriber::fmt::Subscriber::builder().with_env_filter(env_filter);

    let subscriber = subscriber_builder.with_writer(std::io::stderr).finish();
    if let Err(err) = set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {err}");
    }
}

/// Connect to Bitcoin Core and restore the verified chain from disk
async fn create_chain(cli: &Cli) -> Result<(Arc<BitcoindNetwork>, Arc<VerifiedBlockchain>), anyhow::Error> {
    let client = BitcoinClient::new(cli.bitcoin_rpc_url.clone(), cli.bitcoin_rpc_userpwd.clone())?;
    let network = Arc::new(BitcoindNetwork::new(client));
    info!("Bitcoin RPC client initialized");

    // Learn the remote tip before the initial sync
    if let Err(err) = network.poll().await {
        warn!("Failed to get remote tip: {}", err);
    }

    let store = Arc::new(SqliteChunkStore::open(&cli.db_path).await?);
    let config = BlockchainConfig {
        params: if cli.testnet {
            ChainParams::testnet()
        } else {
            ChainParams::mainnet()
        },
        tx_cache_size: cli.tx_cache_size,
        header_cache_size: cli.header_cache_size,
    };
    let chain = VerifiedBlockchain::new(network.clone(), store, config).await?;
    Ok((network, Arc::new(chain)))
}

/// Report chain progress and failed sync runs until shutdown
async fn log_chain_events(
    mut rx_events: broadcast::Receiver<ChainEvent>,
    mut rx_shutdown: broadcast::Receiver<()>,
) -> Result<(), ()> {
    loop {
        tokio::select! {
            event = rx_events.recv() => match event {
                Ok(ChainEvent::NewHeight(height)) => info!("Verified chain at height {}", height),
                Ok(ChainEvent::TouchAddress(address)) => info!("Activity on {}", address),
                Ok(ChainEvent::Error(err)) => error!("Sync failed: {}", err),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} chain events", skipped),
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = rx_shutdown.recv() => return Ok(()),
        }
    }
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if it exists
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    info!("SPV node is launching...");

    let shutdown = Shutdown::default();
    let (network, chain) = match create_chain(&cli).await {
        Ok(components) => components,
        Err(err) => {
            error!("Failed to initialize: {:#}", err);
            std::process::exit(1);
        }
    };

    let rpc_config = RpcConfig {
        rpc_host: cli.rpc_host,
    };
    let rpc_server = RpcServer::new(rpc_config, chain.clone(), shutdown.subscribe());
    let poll_interval = Duration::from_secs(cli.poll_interval_secs);
    let rx_poller_shutdown = shutdown.subscribe();
    let rx_events = chain.subscribe();
    let rx_events_shutdown = shutdown.subscribe();

    // Launching tasks for each component
    let poller_handle =
        tokio::spawn(async move { network.run(poll_interval, rx_poller_shutdown).await });
    let events_handle = tokio::spawn(log_chain_events(rx_events, rx_events_shutdown));
    let rpc_handle = tokio::spawn(async move { rpc_server.run().await });
    let shutdown_handle = tokio::spawn(async move { shutdown.run().await });

    // If at least one component exits with an error, the node will exit with an error
    let result = tokio::try_join!(
        flatten(poller_handle),
        flatten(events_handle),
        flatten(rpc_handle),
        flatten(shutdown_handle)
    );
    chain.shutdown();

    match result {
        Ok(_) => {
            info!("SPV node has shut down");
            std::process::exit(0);
        }
        Err(_) => {
            error!("SPV node has exited with error");
            std::process::exit(1);
        }
    }
}

async fn flatten<T>(handle: JoinHandle<Result<T, ()>>) -> Result<T, ()> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(()),
    }
}
