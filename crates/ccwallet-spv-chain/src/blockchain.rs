//! Verified blockchain: owns the chunk store, caches and the sync worker, and
//! answers wallet queries with data checked against the local header chain.

use std::sync::Arc;

use bitcoin::{Transaction, Txid};
use ccwallet_spv_verify::{ChainParams, ChainValidator, Hash256, Header, RawHeader, CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{HeaderCache, TxCache};
use crate::coalesce::InFlight;
use crate::error::ChainError;
use crate::network::{HistoryEntry, Network, NetworkEvent};
use crate::store::{ChunkStore, StoreError};

/// Capacity of the chain event channel
const EVENTS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainConfig {
    pub params: ChainParams,
    /// Maximum number of cached verified transactions
    pub tx_cache_size: usize,
    /// Maximum number of cached verified headers (80 bytes each)
    pub header_cache_size: usize,
}

impl Default for BlockchainConfig {
    fn default() -> Self {
        Self {
            params: ChainParams::default(),
            tx_cache_size: 250,
            header_cache_size: 5000,
        }
    }
}

/// Notifications emitted by the verified blockchain
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// Local verified height advanced (or moved to another branch)
    NewHeight(i64),
    /// Relayed address activity from the network
    TouchAddress(String),
    /// A sync run failed
    Error(ChainError),
}

/// Best locally verified header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    /// -1 for an empty chain
    pub height: i64,
    /// All-zero for an empty chain
    pub hash: Hash256,
}

impl ChainTip {
    pub const EMPTY: ChainTip = ChainTip {
        height: -1,
        hash: Hash256::ZERO,
    };
}

type Responder = oneshot::Sender<Result<(), ChainError>>;

/// Work items of the sync worker, executed one at a time in arrival order
pub(crate) enum Command {
    /// Run a sync, optionally reporting its outcome
    Sync(Option<Responder>),
    /// Wipe the local chain
    Clear(Responder),
}

/// State shared by the façade, the sync worker and coalesced requests
pub(crate) struct ChainInner {
    pub(crate) network: Arc<dyn Network>,
    pub(crate) store: Arc<dyn ChunkStore>,
    pub(crate) params: ChainParams,
    pub(crate) validator: ChainValidator,
    pub(crate) header_cache: HeaderCache,
    pub(crate) tx_cache: TxCache,
    pub(crate) chunks: InFlight<u32, Arc<Vec<RawHeader>>>,
    pub(crate) txs: InFlight<Txid, Arc<Transaction>>,
    tip: watch::Sender<ChainTip>,
    events: broadcast::Sender<ChainEvent>,
}

impl ChainInner {
    pub(crate) fn tip(&self) -> ChainTip {
        *self.tip.borrow()
    }

    pub(crate) fn current_height(&self) -> i64 {
        self.tip().height
    }

    /// Publish a new local tip.
    ///
    /// Unconfirmed transactions are dropped from the cache before subscribers
    /// hear about the new height.
    pub(crate) fn advance_tip(&self, height: i64, hash: Hash256) {
        let evicted = self.tx_cache.evict_unconfirmed();
        if evicted > 0 {
            debug!("Evicted {evicted} unconfirmed transactions");
        }
        self.tip.send_replace(ChainTip { height, hash });
        info!("Local chain at height {height} ({hash})");
        let _ = self.events.send(ChainEvent::NewHeight(height));
    }

    /// Resolve once the local chain reaches `height`
    pub(crate) async fn wait_height(&self, height: i64) -> Result<(), ChainError> {
        let mut rx = self.tip.subscribe();
        rx.wait_for(|tip| tip.height >= height)
            .await
            .map(|_| ())
            .map_err(|_| ChainError::Closed)
    }

    async fn clear(&self) -> Result<(), ChainError> {
        self.header_cache.begin_commit();
        self.store.clear().await?;
        self.header_cache.clear();
        self.tx_cache.clear();
        self.tip.send_replace(ChainTip::EMPTY);
        info!("Local chain cleared");
        Ok(())
    }

    async fn run_worker(self: Arc<Self>, mut rx_commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx_commands.recv().await {
            match command {
                Command::Sync(respond_to) => {
                    let result = self.sync().await;
                    if let Err(err) = &result {
                        error!("Sync failed: {err}");
                        let _ = self.events.send(ChainEvent::Error(err.clone()));
                    }
                    if let Some(respond_to) = respond_to {
                        let _ = respond_to.send(result);
                    }
                }
                Command::Clear(respond_to) => {
                    let _ = respond_to.send(self.clear().await);
                }
            }
        }
        debug!("Sync worker terminated");
    }
}

/// Forward network notifications: new remote heights become sync triggers,
/// address activity is re-emitted as is.
async fn relay_network_events(
    mut rx_network: broadcast::Receiver<NetworkEvent>,
    tx_commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ChainEvent>,
) {
    loop {
        match rx_network.recv().await {
            Ok(NetworkEvent::NewHeight(height)) => {
                debug!("Remote height {height}");
                if tx_commands.send(Command::Sync(None)).is_err() {
                    break;
                }
            }
            Ok(NetworkEvent::TouchAddress(address)) => {
                let _ = events.send(ChainEvent::TouchAddress(address));
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {skipped} network events, scheduling a sync");
                if tx_commands.send(Command::Sync(None)).is_err() {
                    break;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Network event relay terminated");
}

/// Header chain verified locally against an untrusted [`Network`].
pub struct VerifiedBlockchain {
    pub(crate) inner: Arc<ChainInner>,
    tx_commands: mpsc::UnboundedSender<Command>,
    tasks: Vec<JoinHandle<()>>,
}

impl VerifiedBlockchain {
    /// Restore the local tip from `store`, start the background tasks and queue an initial sync.
    pub async fn new(
        network: Arc<dyn Network>,
        store: Arc<dyn ChunkStore>,
        config: BlockchainConfig,
    ) -> Result<Self, ChainError> {
        let tip = restore_tip(store.as_ref()).await?;
        info!("Restored local chain at height {}", tip.height);

        let (tip, _) = watch::channel(tip);
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let rx_network = network.subscribe();

        let inner = Arc::new(ChainInner {
            network,
            store,
            params: config.params,
            validator: ChainValidator::new(config.params),
            header_cache: HeaderCache::new(config.header_cache_size),
            tx_cache: TxCache::new(config.tx_cache_size),
            chunks: InFlight::new(),
            txs: InFlight::new(),
            tip,
            events: events.clone(),
        });

        let (tx_commands, rx_commands) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(Arc::clone(&inner).run_worker(rx_commands)),
            tokio::spawn(relay_network_events(
                rx_network,
                tx_commands.clone(),
                events,
            )),
        ];

        let chain = Self {
            inner,
            tx_commands,
            tasks,
        };
        chain.sync_now()?;
        Ok(chain)
    }

    pub fn current_height(&self) -> i64 {
        self.inner.current_height()
    }

    pub fn current_block_hash(&self) -> Hash256 {
        self.inner.tip().hash
    }

    pub fn tip(&self) -> ChainTip {
        self.inner.tip()
    }

    /// Timestamp of the verified header at `height`
    pub async fn get_block_time(&self, height: i64) -> Result<u32, ChainError> {
        Ok(self.get_header(height).await?.timestamp)
    }

    /// Verified header at `height`, waiting for the local sync if the remote already has it
    pub async fn get_header(&self, height: i64) -> Result<Header, ChainError> {
        let raw = self.inner.get_verified_header(height).await?;
        Ok(Header::decode(&raw)?)
    }

    /// Transaction checked against its id and, if confirmed, the Merkle root of a verified header
    pub async fn get_tx(&self, txid: &Txid) -> Result<Arc<Transaction>, ChainError> {
        self.inner.get_verified_tx(*txid).await
    }

    pub async fn send_tx(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        Ok(self.inner.network.send_tx(tx).await?)
    }

    pub async fn get_history(&self, address: &str) -> Result<Vec<HistoryEntry>, ChainError> {
        Ok(self.inner.network.get_history(address).await?)
    }

    pub async fn subscribe_address(&self, address: &str) -> Result<(), ChainError> {
        Ok(self.inner.network.subscribe_address(address).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.inner.events.subscribe()
    }

    /// Queue a sync run without waiting for it
    pub fn sync_now(&self) -> Result<(), ChainError> {
        self.tx_commands
            .send(Command::Sync(None))
            .map_err(|_| ChainError::Closed)
    }

    /// Queue a sync run and wait for its outcome
    pub async fn sync(&self) -> Result<(), ChainError> {
        let (respond_to, rx) = oneshot::channel();
        self.tx_commands
            .send(Command::Sync(Some(respond_to)))
            .map_err(|_| ChainError::Closed)?;
        rx.await.map_err(|_| ChainError::Closed)?
    }

    /// Wipe the local chain; runs after any queued sync
    pub async fn clear(&self) -> Result<(), ChainError> {
        let (respond_to, rx) = oneshot::channel();
        self.tx_commands
            .send(Command::Clear(respond_to))
            .map_err(|_| ChainError::Closed)?;
        rx.await.map_err(|_| ChainError::Closed)?
    }

    /// Stop the background tasks
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for VerifiedBlockchain {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn restore_tip(store: &dyn ChunkStore) -> Result<ChainTip, ChainError> {
    let chunks = i64::from(store.chunks_count().await?);
    let headers = i64::from(store.headers_count().await?);
    if chunks == 0 && headers == 0 {
        return Ok(ChainTip::EMPTY);
    }
    let hash = store.last_hash().await?.ok_or_else(|| {
        StoreError::Inconsistent("headers are stored but the last hash is missing".to_string())
    })?;
    Ok(ChainTip {
        height: chunks * i64::from(CHUNK_SIZE) + headers - 1,
        hash,
    })
}
