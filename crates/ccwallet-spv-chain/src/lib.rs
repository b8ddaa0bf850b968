//! Verified header chain for the colored-coin wallet
//!
//! [`VerifiedBlockchain`] keeps a locally validated copy of the Bitcoin header chain
//! in a [`ChunkStore`], synchronizes it from an untrusted [`Network`] and only hands
//! out headers and transactions that were checked against it.
//!
//! Closed retarget periods are stored as a single chunk hash; their headers are
//! downloaded again on demand and checked against that hash.

pub mod blockchain;
pub mod cache;
pub mod coalesce;
pub mod error;
mod headers;
pub mod network;
pub mod sqlite;
pub mod store;
mod sync;
mod tx;

#[cfg(test)]
mod testing;

pub use blockchain::{BlockchainConfig, ChainEvent, ChainTip, VerifiedBlockchain};
pub use error::ChainError;
pub use network::{HistoryEntry, MerkleInfo, Network, NetworkError, NetworkEvent};
pub use sqlite::SqliteChunkStore;
pub use store::{ChunkStore, ChunkStoreBatch, MemoryChunkStore, StoreError, StoreOp};
pub use sync::INCREMENTAL_THRESHOLD;
