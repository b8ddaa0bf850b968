//! Network backend over a Bitcoin Core node.
//!
//! Bitcoin Core has no push notifications over JSON-RPC, so the tip is polled and
//! a `NewHeight` event is emitted whenever the best block hash changes.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use futures::{StreamExt, TryStreamExt};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use ccwallet_bitcoin_client::{BitcoinClient, BitcoinClientError};
use ccwallet_spv_chain::{HistoryEntry, MerkleInfo, Network, NetworkError, NetworkEvent};
use ccwallet_spv_verify::{merkle_branch, Hash256, Header, CHUNK_SIZE};

/// Concurrent header requests while assembling a chunk
const CHUNK_FETCH_CONCURRENCY: usize = 16;

/// Capacity of the network event channel
const EVENTS_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy)]
struct RemoteTip {
    height: i64,
    hash: Hash256,
}

/// [`Network`] implementation backed by Bitcoin Core JSON-RPC
pub struct BitcoindNetwork {
    client: BitcoinClient,
    tip: RwLock<RemoteTip>,
    events: broadcast::Sender<NetworkEvent>,
}

fn to_network_error(err: BitcoinClientError) -> NetworkError {
    if err.is_not_found() {
        NetworkError::NotFound(err.to_string())
    } else {
        NetworkError::Transport(Box::new(err))
    }
}

impl BitcoindNetwork {
    pub fn new(client: BitcoinClient) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            client,
            tip: RwLock::new(RemoteTip {
                height: -1,
                hash: Hash256::ZERO,
            }),
            events,
        }
    }

    fn remote_tip(&self) -> RemoteTip {
        *self.tip.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refresh the remote tip; returns whether it changed
    pub async fn poll(&self) -> Result<bool, BitcoinClientError> {
        let best = self.client.get_best_block_hash().await?;
        let hash = Hash256::from(best);
        if hash == self.remote_tip().hash {
            return Ok(false);
        }

        let header = self.client.get_block_header_ex(&best).await?;
        let height = header.height as i64;
        *self.tip.write().unwrap_or_else(PoisonError::into_inner) = RemoteTip { height, hash };
        debug!("Remote tip is now #{height} {hash}");

        let _ = self.events.send(NetworkEvent::NewHeight(height));
        Ok(true)
    }

    /// Poll the tip every `interval` until shutdown
    pub async fn run(
        &self,
        interval: Duration,
        mut rx_shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ()> {
        info!("Polling Bitcoin Core every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll().await {
                        warn!("Failed to poll remote tip: {}", err);
                    }
                },
                _ = rx_shutdown.recv() => {
                    info!("Tip poller terminated");
                    return Ok(());
                }
            }
        }
    }

    async fn raw_header(&self, height: u32) -> Result<Vec<u8>, NetworkError> {
        let hash = self
            .client
            .get_block_hash(height)
            .await
            .map_err(to_network_error)?;
        self.client
            .get_block_header_hex(&hash)
            .await
            .map_err(to_network_error)
    }
}

#[async_trait]
impl Network for BitcoindNetwork {
    fn current_height(&self) -> i64 {
        self.remote_tip().height
    }

    fn current_block_hash(&self) -> Hash256 {
        self.remote_tip().hash
    }

    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    async fn get_header(&self, height: u32) -> Result<Header, NetworkError> {
        let raw = self.raw_header(height).await?;
        Ok(Header::decode(&raw)?)
    }

    async fn get_chunk(&self, index: u32) -> Result<Vec<u8>, NetworkError> {
        let tip = self.current_height();
        let start = i64::from(index) * i64::from(CHUNK_SIZE);
        if start > tip {
            return Err(NetworkError::NotFound(format!("chunk {index}")));
        }
        let end = (start + i64::from(CHUNK_SIZE) - 1).min(tip);

        let headers: Vec<Vec<u8>> = futures::stream::iter(start as u32..=end as u32)
            .map(|height| self.raw_header(height))
            .buffered(CHUNK_FETCH_CONCURRENCY)
            .try_collect()
            .await?;
        debug!("Assembled chunk {index} from {} headers", headers.len());
        Ok(headers.concat())
    }

    async fn get_tx(&self, txid: &Txid) -> Result<Transaction, NetworkError> {
        self.client
            .get_raw_transaction(txid)
            .await
            .map_err(to_network_error)
    }

    async fn get_merkle(&self, txid: &Txid) -> Result<MerkleInfo, NetworkError> {
        let info = self
            .client
            .get_raw_transaction_info(txid)
            .await
            .map_err(to_network_error)?;
        let Some(block_hash) = info.blockhash else {
            return Err(NetworkError::BlockNotFound);
        };

        let block = self
            .client
            .get_block_txids(&block_hash)
            .await
            .map_err(to_network_error)?;
        let txids: Vec<Hash256> = block.tx.into_iter().map(Hash256::from).collect();
        let leaf = Hash256::from(*txid);
        let proof = txids
            .iter()
            .position(|id| *id == leaf)
            .and_then(|index| merkle_branch(&txids, index))
            .ok_or_else(|| {
                error!("Block {block_hash} does not list transaction {txid}");
                NetworkError::NotFound(format!("transaction {txid} in block {block_hash}"))
            })?;

        Ok(MerkleInfo {
            height: block.height,
            merkle: proof.branch,
            index: proof.index,
        })
    }

    async fn send_tx(&self, tx: &Transaction) -> Result<Txid, NetworkError> {
        self.client
            .send_raw_transaction(tx)
            .await
            .map_err(to_network_error)
    }

    async fn get_history(&self, _address: &str) -> Result<Vec<HistoryEntry>, NetworkError> {
        Err(NetworkError::Unsupported("address history"))
    }

    async fn subscribe_address(&self, _address: &str) -> Result<(), NetworkError> {
        Err(NetworkError::Unsupported("address subscriptions"))
    }
}
