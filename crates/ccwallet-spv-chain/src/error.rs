use std::sync::Arc;

use bitcoin::Txid;
use ccwallet_spv_verify::{HeaderError, VerifyError};
use thiserror::Error;

use crate::network::NetworkError;
use crate::store::StoreError;

/// Errors surfaced by the verified blockchain.
///
/// Cloneable so that a single failure can be handed to every caller awaiting a
/// coalesced request and to every event subscriber.
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    /// Requested height is not available yet
    #[error("header at height {0} is not available")]
    NotFound(i64),
    /// Header linkage or proof-of-work failure
    #[error(transparent)]
    Verify(#[from] VerifyError),
    /// Downloaded chunk does not match the committed chunk hash or does not link to genesis
    #[error("chunk {0} failed verification")]
    VerifyChunk(u32),
    /// Transaction does not match its id or Merkle proof
    #[error("transaction {0} failed verification")]
    VerifyTx(Txid),
    #[error("invalid header data: {0}")]
    InvalidHeader(#[from] HeaderError),
    #[error("network error: {0}")]
    Network(Arc<NetworkError>),
    #[error("store error: {0}")]
    Store(Arc<StoreError>),
    /// Background tasks are gone
    #[error("blockchain has been shut down")]
    Closed,
}

impl From<NetworkError> for ChainError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::InvalidHeader(err) => ChainError::InvalidHeader(err),
            err => ChainError::Network(Arc::new(err)),
        }
    }
}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(Arc::new(err))
    }
}
