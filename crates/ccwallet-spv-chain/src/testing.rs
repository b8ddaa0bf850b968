//! Synthetic chains and an in-memory network for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use ccwallet_spv_verify::header::mine;
use ccwallet_spv_verify::{
    merkle_branch, retarget, sha256d, ChainParams, Hash256, Header, Target, CHUNK_SIZE,
};
use tokio::sync::broadcast;

use crate::network::{HistoryEntry, MerkleInfo, Network, NetworkError, NetworkEvent};

/// Easiest regtest difficulty, mined in a couple of attempts
pub const EASY_BITS: u32 = 0x207fffff;

const GENESIS_TIME: u32 = 1_600_000_000;

const SPACING: u32 = 600;

pub fn params() -> ChainParams {
    ChainParams::with_pow_limit(EASY_BITS, false)
}

/// Append `count` mined headers; `salt` makes the Merkle roots differ between forks
pub fn extend_chain(headers: &mut Vec<Header>, count: usize, params: &ChainParams, salt: u8) {
    extend_chain_with_roots(headers, count, params, |height| {
        let mut seed = vec![salt];
        seed.extend_from_slice(&height.to_le_bytes());
        Some(Hash256::from_internal(sha256d(&seed)))
    })
}

/// Append `count` mined headers with Merkle roots chosen by `root`.
/// Heights without a root get one derived from the height.
pub fn extend_chain_with_roots(
    headers: &mut Vec<Header>,
    count: usize,
    params: &ChainParams,
    root: impl Fn(u32) -> Option<Hash256>,
) {
    for _ in 0..count {
        let height = headers.len() as u32;
        let bits = match headers.last() {
            None => params.pow_limit_bits,
            Some(_) if height % CHUNK_SIZE == 0 => {
                let first = &headers[(height - CHUNK_SIZE) as usize];
                retarget(first, &headers[height as usize - 1], params).bits
            }
            Some(prev) => prev.bits,
        };
        let merkle_root = root(height)
            .unwrap_or_else(|| Hash256::from_internal(sha256d(&height.to_be_bytes())));

        let mut header = Header {
            version: 4,
            prev_block_hash: headers.last().map_or(Hash256::ZERO, Header::id),
            merkle_root,
            timestamp: GENESIS_TIME + height * SPACING,
            bits,
            nonce: 0,
        };
        mine(&mut header, &Target::from_bits(bits));
        headers.push(header);
    }
}

/// Chain sharing the first `at` headers of `headers`, then mined up to `len`
pub fn fork_chain(
    headers: &[Header],
    at: usize,
    len: usize,
    params: &ChainParams,
    salt: u8,
) -> Vec<Header> {
    let mut fork = headers[..at].to_vec();
    extend_chain(&mut fork, len - at, params, salt);
    fork
}

pub fn dummy_tx(seed: u8) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([seed; 32]),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(1_000 * u64::from(seed)),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

struct KnownTx {
    tx: Transaction,
    /// Height and txids of the containing block
    block: Option<(u32, Vec<Hash256>)>,
}

#[derive(Default)]
struct State {
    headers: Vec<Header>,
    txs: HashMap<Txid, KnownTx>,
    subscribed: Vec<String>,
    chunk_delay: Duration,
    tx_delay: Duration,
}

/// Honest in-memory remote serving a configurable chain
pub struct FakeNetwork {
    state: Mutex<State>,
    events: broadcast::Sender<NetworkEvent>,
    chunk_calls: AtomicUsize,
    header_calls: AtomicUsize,
    tx_calls: AtomicUsize,
}

impl FakeNetwork {
    pub fn new(headers: Vec<Header>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(State {
                headers,
                ..Default::default()
            }),
            events,
            chunk_calls: AtomicUsize::new(0),
            header_calls: AtomicUsize::new(0),
            tx_calls: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the served chain without notifying subscribers
    pub fn set_chain(&self, headers: Vec<Header>) {
        self.state().headers = headers;
    }

    /// Announce the current tip to subscribers
    pub fn announce(&self) {
        let height = self.current_height();
        self.emit(NetworkEvent::NewHeight(height));
    }

    pub fn emit(&self, event: NetworkEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        self.state().chunk_delay = delay;
    }

    pub fn set_tx_delay(&self, delay: Duration) {
        self.state().tx_delay = delay;
    }

    pub fn add_tx(&self, tx: Transaction, block: Option<(u32, Vec<Hash256>)>) {
        self.state().txs.insert(tx.compute_txid(), KnownTx { tx, block });
    }

    /// Raw bytes of chunk `index` as currently served
    pub fn chunk(&self, index: u32) -> Vec<u8> {
        let state = self.state();
        let start = (index * CHUNK_SIZE) as usize;
        let end = state.headers.len().min(start + CHUNK_SIZE as usize);
        state.headers[start.min(end)..end]
            .iter()
            .flat_map(Header::encode)
            .collect()
    }

    pub fn chunk_calls(&self) -> usize {
        self.chunk_calls.load(Ordering::SeqCst)
    }

    pub fn header_calls(&self) -> usize {
        self.header_calls.load(Ordering::SeqCst)
    }

    pub fn tx_calls(&self) -> usize {
        self.tx_calls.load(Ordering::SeqCst)
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.state().subscribed.clone()
    }
}

#[async_trait]
impl Network for FakeNetwork {
    fn current_height(&self) -> i64 {
        self.state().headers.len() as i64 - 1
    }

    fn current_block_hash(&self) -> Hash256 {
        self.state().headers.last().map_or(Hash256::ZERO, Header::id)
    }

    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    async fn get_header(&self, height: u32) -> Result<Header, NetworkError> {
        self.header_calls.fetch_add(1, Ordering::SeqCst);
        self.state()
            .headers
            .get(height as usize)
            .copied()
            .ok_or_else(|| NetworkError::NotFound(format!("header {height}")))
    }

    async fn get_chunk(&self, index: u32) -> Result<Vec<u8>, NetworkError> {
        self.chunk_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state().chunk_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let chunk = self.chunk(index);
        if chunk.is_empty() {
            return Err(NetworkError::NotFound(format!("chunk {index}")));
        }
        Ok(chunk)
    }

    async fn get_tx(&self, txid: &Txid) -> Result<Transaction, NetworkError> {
        self.tx_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state().tx_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state()
            .txs
            .get(txid)
            .map(|known| known.tx.clone())
            .ok_or_else(|| NetworkError::NotFound(format!("transaction {txid}")))
    }

    async fn get_merkle(&self, txid: &Txid) -> Result<MerkleInfo, NetworkError> {
        let state = self.state();
        let known = state
            .txs
            .get(txid)
            .ok_or_else(|| NetworkError::NotFound(format!("transaction {txid}")))?;
        let Some((height, txids)) = &known.block else {
            return Err(NetworkError::BlockNotFound);
        };

        let leaf = Hash256::from(*txid);
        let proof = txids
            .iter()
            .position(|id| *id == leaf)
            .and_then(|index| merkle_branch(txids, index))
            .ok_or_else(|| NetworkError::NotFound(format!("transaction {txid} in block")))?;
        Ok(MerkleInfo {
            height: *height,
            merkle: proof.branch,
            index: proof.index,
        })
    }

    async fn send_tx(&self, tx: &Transaction) -> Result<Txid, NetworkError> {
        self.add_tx(tx.clone(), None);
        Ok(tx.compute_txid())
    }

    async fn get_history(&self, _address: &str) -> Result<Vec<HistoryEntry>, NetworkError> {
        Ok(vec![])
    }

    async fn subscribe_address(&self, address: &str) -> Result<(), NetworkError> {
        self.state().subscribed.push(address.to_string());
        Ok(())
    }
}
