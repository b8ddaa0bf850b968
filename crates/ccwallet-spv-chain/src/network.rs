//! Contract of the remote data source the chain is verified against.

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use ccwallet_spv_verify::{Hash256, Header, HeaderError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors reported by a network backend
#[derive(Error, Debug)]
pub enum NetworkError {
    /// The transaction is not in any block known to the remote (unconfirmed)
    #[error("block not found")]
    BlockNotFound,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
    #[error("invalid header: {0}")]
    InvalidHeader(#[from] HeaderError),
    #[error("transport error: {0}")]
    Transport(Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Notifications pushed by the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Remote tip has changed
    NewHeight(i64),
    /// Activity on a subscribed address
    TouchAddress(String),
}

/// Merkle branch of a confirmed transaction as reported by the remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleInfo {
    /// Height of the block containing the transaction
    pub height: u32,
    /// Sibling hashes, leaf level first
    pub merkle: Vec<Hash256>,
    /// Position of the transaction in the block
    pub index: u32,
}

/// Entry of an address history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub txid: Txid,
    /// Zero or negative for unconfirmed transactions
    pub height: i64,
}

/// Untrusted remote source of headers, chunks and transactions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Network: Send + Sync {
    /// Remote tip height, -1 if unknown
    fn current_height(&self) -> i64;

    /// Remote tip hash, all-zero if unknown
    fn current_block_hash(&self) -> Hash256;

    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent>;

    async fn get_header(&self, height: u32) -> Result<Header, NetworkError>;

    /// Raw concatenated headers of chunk `index` (up to 2016 headers)
    async fn get_chunk(&self, index: u32) -> Result<Vec<u8>, NetworkError>;

    async fn get_tx(&self, txid: &Txid) -> Result<Transaction, NetworkError>;

    /// Fails with [`NetworkError::BlockNotFound`] for unconfirmed transactions
    async fn get_merkle(&self, txid: &Txid) -> Result<MerkleInfo, NetworkError>;

    async fn send_tx(&self, tx: &Transaction) -> Result<Txid, NetworkError>;

    async fn get_history(&self, address: &str) -> Result<Vec<HistoryEntry>, NetworkError>;

    async fn subscribe_address(&self, address: &str) -> Result<(), NetworkError>;
}
