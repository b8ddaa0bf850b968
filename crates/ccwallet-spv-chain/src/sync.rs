//! Header synchronization: incremental single-header mode for small gaps, chunk
//! catch-up with reorg walk-back otherwise.

use std::collections::HashMap;
use std::sync::Arc;

use ccwallet_spv_verify::{
    chunk_hash, identity_hash, retarget, split_chunk, Hash256, Header, RawHeader, Target,
    CHUNK_SIZE, HEADER_SIZE,
};
use tracing::{debug, info, warn};

use crate::blockchain::{ChainInner, ChainTip};
use crate::error::ChainError;
use crate::store::{ChunkStoreBatch, StoreError};

/// Largest gap synced header by header
pub const INCREMENTAL_THRESHOLD: i64 = 50;

/// Expected targets computed during one run, keyed by retarget period
type TargetMemo = HashMap<u32, Target>;

enum Incremental {
    Committed,
    /// First candidate does not build on the local tip
    ReorgSuspected,
}

impl ChainInner {
    /// One sync run against the current remote tip
    pub(crate) async fn sync(self: &Arc<Self>) -> Result<(), ChainError> {
        let network_height = self.network.current_height();
        let network_hash = self.network.current_block_hash();
        let tip = self.tip();

        if network_height < 0 || network_hash == tip.hash {
            return Ok(());
        }
        info!("Syncing from height {} to {network_height}", tip.height);

        let mut memo = TargetMemo::new();
        if tip.height >= 0
            && network_height > tip.height
            && network_height - tip.height < INCREMENTAL_THRESHOLD
        {
            match self.sync_headers(tip, network_height, &mut memo).await? {
                Incremental::Committed => return Ok(()),
                Incremental::ReorgSuspected => {
                    warn!("Remote chain does not extend local tip {}, reorg suspected", tip.hash)
                }
            }
        }

        self.sync_chunks(network_height, &mut memo).await
    }

    /// Fetch, validate and commit the headers above the local tip one at a time
    async fn sync_headers(
        self: &Arc<Self>,
        tip: ChainTip,
        network_height: i64,
        memo: &mut TargetMemo,
    ) -> Result<Incremental, ChainError> {
        let start = tip.height as u32 + 1;
        let end = network_height as u32;

        let mut candidates = Vec::with_capacity((end - start + 1) as usize);
        for height in start..=end {
            candidates.push(self.network.get_header(height).await?);
        }

        let prev_raw = self.load_header(start - 1).await?;
        let mut prev = Header::decode(&prev_raw)?;
        let mut prev_id = identity_hash(&prev_raw);
        if candidates[0].prev_block_hash != prev_id {
            return Ok(Incremental::ReorgSuspected);
        }

        for (height, header) in (start..).zip(&candidates) {
            let target = self
                .period_target(height / CHUNK_SIZE, memo, start, &candidates)
                .await?;
            let id = header.id();
            self.validator
                .verify(height, &id, header, &prev_id, Some(&prev), &target)?;
            prev = *header;
            prev_id = id;
        }

        self.commit_headers(start, &candidates, prev_id).await?;
        Ok(Incremental::Committed)
    }

    /// Commit validated candidates starting at height `start`, closing the open
    /// period if they cross its boundary.
    async fn commit_headers(
        &self,
        start: u32,
        candidates: &[Header],
        last_id: Hash256,
    ) -> Result<(), ChainError> {
        let raws: Vec<RawHeader> = candidates.iter().map(Header::encode).collect();
        let last_height = start + raws.len() as u32 - 1;
        let last_index = last_height / CHUNK_SIZE;
        let chunks = self.store.chunks_count().await?;
        let keep = start.checked_sub(chunks * CHUNK_SIZE).ok_or_else(|| {
            StoreError::Inconsistent(format!("height {start} is below the open period"))
        })?;

        let mut batch = ChunkStoreBatch::new();
        batch.set_last_hash(last_id);

        if last_index == chunks {
            batch.truncate_headers(keep);
            for raw in &raws {
                batch.push_header(*raw);
            }
        } else if last_index == chunks + 1 {
            let boundary = last_index * CHUNK_SIZE;
            let mut closed = Vec::with_capacity(CHUNK_SIZE as usize * HEADER_SIZE);
            for raw in self.store.headers().await?.iter().take(keep as usize) {
                closed.extend_from_slice(raw);
            }
            for (_, raw) in (start..).zip(&raws).filter(|(h, _)| *h < boundary) {
                closed.extend_from_slice(raw);
            }
            if closed.len() != CHUNK_SIZE as usize * HEADER_SIZE {
                return Err(StoreError::Inconsistent(format!(
                    "closing chunk {chunks} with {} headers",
                    closed.len() / HEADER_SIZE
                ))
                .into());
            }

            batch.push_chunk_hash(chunk_hash(&closed)).truncate_headers(0);
            for (_, raw) in (start..).zip(&raws).filter(|(h, _)| *h >= boundary) {
                batch.push_header(*raw);
            }
            debug!("Closed chunk {chunks}");
        } else {
            return Err(StoreError::Inconsistent(format!(
                "cannot append height {last_height} to {chunks} closed chunks"
            ))
            .into());
        }

        self.header_cache.begin_commit();
        self.store.apply(batch).await?;
        self.header_cache.put_range(start, &raws);
        self.header_cache.evict_above(last_height.into());
        self.advance_tip(last_height.into(), last_id);
        Ok(())
    }

    /// Download and commit whole chunks from the local tip's chunk up to the remote tip.
    /// A chunk that does not link to the local chain means a reorg: step back one chunk.
    async fn sync_chunks(
        self: &Arc<Self>,
        network_height: i64,
        memo: &mut TargetMemo,
    ) -> Result<(), ChainError> {
        let network_index = (network_height.max(0) / i64::from(CHUNK_SIZE)) as u32;
        let local_index = (self.current_height().max(0) / i64::from(CHUNK_SIZE)) as u32;
        let mut index = local_index.min(network_index);

        while index <= network_index {
            let chunk = self.network.get_chunk(index).await?;
            let headers = split_chunk(&chunk)?;

            let (mut prev_id, mut prev) = if index == 0 {
                (Hash256::ZERO, None)
            } else {
                let raw = self.load_header(index * CHUNK_SIZE - 1).await?;
                (identity_hash(&raw), Some(Header::decode(&raw)?))
            };

            let first = Header::decode(&headers[0])?;
            if first.prev_block_hash != prev_id {
                if index == 0 {
                    return Err(ChainError::VerifyChunk(0));
                }
                warn!("Chunk {index} does not link to the local chain, stepping back");
                index -= 1;
                // Targets of later periods depend on headers about to be replaced
                memo.retain(|period, _| *period <= index);
                continue;
            }

            let target = self.period_target(index, memo, 0, &[]).await?;
            for (offset, raw) in headers.iter().enumerate() {
                let height = index * CHUNK_SIZE + offset as u32;
                let header = Header::decode(raw)?;
                let id = identity_hash(raw);
                self.validator
                    .verify(height, &id, &header, &prev_id, prev.as_ref(), &target)?;
                prev = Some(header);
                prev_id = id;
            }

            self.commit_chunk(index, &chunk, &headers, prev_id).await?;
            index += 1;
        }
        Ok(())
    }

    /// Commit a validated chunk: a full one closes its period, a partial one
    /// replaces the open period.
    async fn commit_chunk(
        &self,
        index: u32,
        chunk: &[u8],
        headers: &[RawHeader],
        last_id: Hash256,
    ) -> Result<(), ChainError> {
        let mut batch = ChunkStoreBatch::new();
        batch
            .set_last_hash(last_id)
            .truncate_headers(0)
            .truncate_chunks(index);
        if headers.len() == CHUNK_SIZE as usize {
            batch.push_chunk_hash(chunk_hash(chunk));
        } else {
            for raw in headers {
                batch.push_header(*raw);
            }
        }
        self.header_cache.begin_commit();
        self.store.apply(batch).await?;

        let start = index * CHUNK_SIZE;
        let height = i64::from(start) + headers.len() as i64 - 1;
        self.header_cache.put_range(start, headers);
        self.header_cache.evict_above(height);
        debug!("Committed chunk {index} with {} headers", headers.len());
        self.advance_tip(height, last_id);
        Ok(())
    }

    /// Expected target of retarget period `index`
    async fn period_target(
        self: &Arc<Self>,
        index: u32,
        memo: &mut TargetMemo,
        first_candidate: u32,
        candidates: &[Header],
    ) -> Result<Target, ChainError> {
        if index == 0 {
            return Ok(self.params.pow_limit());
        }
        if let Some(target) = memo.get(&index) {
            return Ok(*target);
        }

        let first = self
            .header_at((index - 1) * CHUNK_SIZE, first_candidate, candidates)
            .await?;
        let last = self
            .header_at(index * CHUNK_SIZE - 1, first_candidate, candidates)
            .await?;
        let target = retarget(&first, &last, &self.params);
        debug!("Target of period {index}: bits {:#010x}", target.bits);

        memo.insert(index, target);
        Ok(target)
    }

    /// Header at `height`, taken from the candidates if they cover it
    async fn header_at(
        self: &Arc<Self>,
        height: u32,
        first_candidate: u32,
        candidates: &[Header],
    ) -> Result<Header, ChainError> {
        let candidate = height
            .checked_sub(first_candidate)
            .and_then(|offset| candidates.get(offset as usize));
        match candidate {
            Some(header) => Ok(*header),
            None => Ok(Header::decode(&self.load_header(height).await?)?),
        }
    }
}
