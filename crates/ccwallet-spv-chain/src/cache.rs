//! Bounded LRU caches for verified headers and transactions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitcoin::{Transaction, Txid};
use ccwallet_spv_verify::RawHeader;
use lru_cache::LruCache;

/// Capacity below one would make every insert a no-op
fn capacity(size: usize) -> usize {
    size.max(1)
}

#[derive(Debug)]
struct HeaderEntries {
    entries: LruCache<u32, RawHeader>,
    /// Bumped whenever a commit starts replacing stored headers
    epoch: u64,
}

/// Verified raw headers keyed by absolute height.
///
/// Readers that load headers from the store capture [`HeaderCache::epoch`]
/// first and insert with it, so a commit that started in the meantime wins.
#[derive(Debug)]
pub struct HeaderCache {
    inner: Mutex<HeaderEntries>,
}

impl HeaderCache {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(HeaderEntries {
                entries: LruCache::new(capacity(size)),
                epoch: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeaderEntries> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, height: u32) -> Option<RawHeader> {
        self.lock().entries.get_mut(&height).copied()
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Mark the start of a commit; inserts made with an older epoch are dropped
    pub fn begin_commit(&self) {
        self.lock().epoch += 1;
    }

    /// Insert a header read under `epoch`; returns false if a commit started since
    pub fn insert_at(&self, epoch: u64, height: u32, header: RawHeader) -> bool {
        self.insert_range_at(epoch, height, &[header])
    }

    /// Insert consecutive headers read under `epoch`
    pub fn insert_range_at(&self, epoch: u64, start: u32, headers: &[RawHeader]) -> bool {
        let mut cache = self.lock();
        if cache.epoch != epoch {
            return false;
        }
        for (offset, header) in headers.iter().enumerate() {
            cache.entries.insert(start + offset as u32, *header);
        }
        true
    }

    /// Insert consecutive committed headers starting at `start`
    pub fn put_range(&self, start: u32, headers: &[RawHeader]) {
        let mut cache = self.lock();
        for (offset, header) in headers.iter().enumerate() {
            cache.entries.insert(start + offset as u32, *header);
        }
    }

    /// Drop every entry above `height`
    pub fn evict_above(&self, height: i64) {
        let mut cache = self.lock();
        let stale: Vec<u32> = cache
            .entries
            .iter()
            .map(|(h, _)| *h)
            .filter(|h| i64::from(*h) > height)
            .collect();
        for h in stale {
            cache.entries.remove(&h);
        }
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Verified transaction with the height it was confirmed at (0 if unconfirmed)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedTx {
    pub confirmation_height: u32,
    pub tx: Arc<Transaction>,
}

/// Verified transactions keyed by id
#[derive(Debug)]
pub struct TxCache {
    inner: Mutex<LruCache<Txid, CachedTx>>,
}

impl TxCache {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity(size))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<Txid, CachedTx>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, txid: &Txid) -> Option<CachedTx> {
        self.lock().get_mut(txid).cloned()
    }

    pub fn put(&self, txid: Txid, entry: CachedTx) {
        self.lock().insert(txid, entry);
    }

    /// Drop unconfirmed entries; returns how many were removed
    pub fn evict_unconfirmed(&self) -> usize {
        let mut cache = self.lock();
        let stale: Vec<Txid> = cache
            .iter()
            .filter(|(_, entry)| entry.confirmation_height == 0)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &stale {
            cache.remove(txid);
        }
        stale.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
