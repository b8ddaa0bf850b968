//! Acquisition of verified headers: cache, open period, or a chunk download
//! checked against its committed hash.

use std::sync::Arc;

use ccwallet_spv_verify::{chunk_hash, split_chunk, RawHeader, CHUNK_SIZE};
use tracing::debug;

use crate::blockchain::ChainInner;
use crate::error::ChainError;

impl ChainInner {
    /// Verified header at `height`.
    ///
    /// If the remote already has the height but the local chain does not, waits for
    /// the sync to get there.
    pub(crate) async fn get_verified_header(
        self: &Arc<Self>,
        height: i64,
    ) -> Result<RawHeader, ChainError> {
        let Ok(h) = u32::try_from(height) else {
            return Err(ChainError::NotFound(height));
        };
        if let Some(raw) = self.header_cache.get(h) {
            return Ok(raw);
        }

        if height > self.current_height() && height <= self.network.current_height() {
            debug!("Waiting for local chain to reach height {height}");
            self.wait_height(height).await?;
        }

        self.load_header(h).await
    }

    /// Verified header at `height` from what is already committed; never waits.
    pub(crate) async fn load_header(self: &Arc<Self>, height: u32) -> Result<RawHeader, ChainError> {
        if let Some(raw) = self.header_cache.get(height) {
            return Ok(raw);
        }

        let epoch = self.header_cache.epoch();
        if let Some(raw) = self.store.pending_header(height).await? {
            self.header_cache.insert_at(epoch, height, raw);
            return Ok(raw);
        }

        let index = height / CHUNK_SIZE;
        if index >= self.store.chunks_count().await? {
            return Err(ChainError::NotFound(height.into()));
        }

        let headers = self.get_verified_chunk(index).await?;
        headers
            .get((height % CHUNK_SIZE) as usize)
            .copied()
            .ok_or(ChainError::NotFound(height.into()))
    }

    /// Download a closed chunk and check it against the committed chunk hash.
    /// Concurrent requests for the same chunk share one download.
    pub(crate) async fn get_verified_chunk(
        self: &Arc<Self>,
        index: u32,
    ) -> Result<Arc<Vec<RawHeader>>, ChainError> {
        let inner = Arc::clone(self);
        self.chunks
            .run(index, move || async move {
                let epoch = inner.header_cache.epoch();
                let expected = inner.store.chunk_hash(index).await?;
                let chunk = inner.network.get_chunk(index).await?;
                if expected != Some(chunk_hash(&chunk)) {
                    return Err(ChainError::VerifyChunk(index));
                }

                let headers = split_chunk(&chunk)?;
                inner
                    .header_cache
                    .insert_range_at(epoch, index * CHUNK_SIZE, &headers);
                debug!("Fetched verified chunk {index}");
                Ok(Arc::new(headers))
            })
            .await
    }
}
