//! Persistent state of the verified chain: closed chunk hashes plus the headers of
//! the still-open retarget period.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use ccwallet_spv_verify::{Hash256, RawHeader, CHUNK_SIZE};
use thiserror::Error;

/// An error that can occur when using the store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    SQLite(#[from] sqlx::Error),
    #[error("Inconsistent store state: {0}")]
    Inconsistent(String),
    #[error("Corrupted record: {0}")]
    Corrupted(String),
}

/// Single mutation of the chunk store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Append a header to the open period
    PushHeader(RawHeader),
    /// Close a chunk
    PushChunkHash(Hash256),
    /// Keep only the first `n` pending headers
    TruncateHeaders(u32),
    /// Keep only the first `n` chunk hashes
    TruncateChunks(u32),
    SetLastHash(Hash256),
}

/// Ordered list of mutations applied atomically
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStoreBatch {
    ops: Vec<StoreOp>,
}

impl ChunkStoreBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_header(&mut self, header: RawHeader) -> &mut Self {
        self.ops.push(StoreOp::PushHeader(header));
        self
    }

    pub fn push_chunk_hash(&mut self, hash: Hash256) -> &mut Self {
        self.ops.push(StoreOp::PushChunkHash(hash));
        self
    }

    pub fn truncate_headers(&mut self, len: u32) -> &mut Self {
        self.ops.push(StoreOp::TruncateHeaders(len));
        self
    }

    pub fn truncate_chunks(&mut self, len: u32) -> &mut Self {
        self.ops.push(StoreOp::TruncateChunks(len));
        self
    }

    pub fn set_last_hash(&mut self, hash: Hash256) -> &mut Self {
        self.ops.push(StoreOp::SetLastHash(hash));
        self
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Storage contract of the verified chain.
///
/// Local height is always `chunks_count * 2016 + headers_count - 1`.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Number of closed chunks
    async fn chunks_count(&self) -> Result<u32, StoreError>;

    /// Number of pending headers in the open period
    async fn headers_count(&self) -> Result<u32, StoreError>;

    /// Pending header at `index` within the open period
    async fn header(&self, index: u32) -> Result<Option<RawHeader>, StoreError>;

    /// Header at absolute `height` if it lies in the open period.
    ///
    /// The chunk count and the header are read from the same committed state.
    async fn pending_header(&self, height: u32) -> Result<Option<RawHeader>, StoreError>;

    /// All pending headers in order
    async fn headers(&self) -> Result<Vec<RawHeader>, StoreError>;

    async fn chunk_hash(&self, index: u32) -> Result<Option<Hash256>, StoreError>;

    /// Identity hash of the best committed header
    async fn last_hash(&self) -> Result<Option<Hash256>, StoreError>;

    /// Apply all operations of the batch or none of them
    async fn apply(&self, batch: ChunkStoreBatch) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    chunks: Vec<Hash256>,
    headers: Vec<RawHeader>,
    last_hash: Option<Hash256>,
}

impl MemoryState {
    fn apply(&mut self, op: &StoreOp) -> Result<(), StoreError> {
        match op {
            StoreOp::PushHeader(header) => {
                if self.headers.len() >= CHUNK_SIZE as usize {
                    return Err(StoreError::Inconsistent(
                        "open period already holds 2016 headers".to_string(),
                    ));
                }
                self.headers.push(*header);
            }
            StoreOp::PushChunkHash(hash) => self.chunks.push(*hash),
            StoreOp::TruncateHeaders(len) => self.headers.truncate(*len as usize),
            StoreOp::TruncateChunks(len) => self.chunks.truncate(*len as usize),
            StoreOp::SetLastHash(hash) => self.last_hash = Some(*hash),
        }
        Ok(())
    }
}

/// Volatile chunk store for tests and ephemeral wallets
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    state: RwLock<MemoryState>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn chunks_count(&self) -> Result<u32, StoreError> {
        Ok(self.read(|state| state.chunks.len() as u32))
    }

    async fn headers_count(&self) -> Result<u32, StoreError> {
        Ok(self.read(|state| state.headers.len() as u32))
    }

    async fn header(&self, index: u32) -> Result<Option<RawHeader>, StoreError> {
        Ok(self.read(|state| state.headers.get(index as usize).copied()))
    }

    async fn pending_header(&self, height: u32) -> Result<Option<RawHeader>, StoreError> {
        Ok(self.read(|state| {
            if height / CHUNK_SIZE != state.chunks.len() as u32 {
                return None;
            }
            state.headers.get((height % CHUNK_SIZE) as usize).copied()
        }))
    }

    async fn headers(&self) -> Result<Vec<RawHeader>, StoreError> {
        Ok(self.read(|state| state.headers.clone()))
    }

    async fn chunk_hash(&self, index: u32) -> Result<Option<Hash256>, StoreError> {
        Ok(self.read(|state| state.chunks.get(index as usize).copied()))
    }

    async fn last_hash(&self) -> Result<Option<Hash256>, StoreError> {
        Ok(self.read(|state| state.last_hash))
    }

    async fn apply(&self, batch: ChunkStoreBatch) -> Result<(), StoreError> {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        for op in batch.ops() {
            next.apply(op)?;
        }
        *guard = next;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = MemoryState::default();
        Ok(())
    }
}
