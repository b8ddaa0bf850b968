//! Deduplication of concurrent identical requests.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::ChainError;

/// Pending result shared by every caller of the same key
pub type SharedResult<V> = Shared<BoxFuture<'static, Result<V, ChainError>>>;

type Running<K, V> = Arc<Mutex<HashMap<K, SharedResult<V>>>>;

/// Map of operations in flight, keyed by what they fetch.
///
/// The first caller for a key starts the operation, later callers await the same
/// result. The entry is removed when the operation completes, whatever the outcome.
pub struct InFlight<K, V> {
    running: Running<K, V>,
}

impl<K, V> Default for InFlight<K, V> {
    fn default() -> Self {
        Self {
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn lock<K, V>(running: &Running<K, V>) -> MutexGuard<'_, HashMap<K, SharedResult<V>>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the operation running for `key`, or start it with `make`
    pub fn run<F, Fut>(&self, key: K, make: F) -> SharedResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ChainError>> + Send + 'static,
    {
        let mut running = lock(&self.running);
        if let Some(pending) = running.get(&key) {
            return pending.clone();
        }

        let operation = make();
        let registry = Arc::clone(&self.running);
        let entry = key.clone();
        let shared = async move {
            let result = operation.await;
            lock(&registry).remove(&entry);
            result
        }
        .boxed()
        .shared();

        running.insert(key, shared.clone());
        shared
    }

    /// Number of operations in flight
    pub fn len(&self) -> usize {
        lock(&self.running).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let inflight: InFlight<u32, u32> = InFlight::new();
        let started = Arc::new(AtomicUsize::new(0));

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let started = Arc::clone(&started);
                inflight.run(7, move || async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(42)
                })
            })
            .collect();
        assert_eq!(inflight.len(), 1);

        let results = futures::future::join_all(calls).await;
        assert!(results.into_iter().all(|r| r.unwrap() == 42));
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn test_failure_clears_entry() {
        let inflight: InFlight<u32, u32> = InFlight::new();

        let err = inflight
            .run(1, || async { Err(ChainError::NotFound(1)) })
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::NotFound(1)));
        assert!(inflight.is_empty());

        // Next caller starts a fresh run
        let value = inflight.run(1, || async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_separately() {
        let inflight: InFlight<u32, u32> = InFlight::new();
        let a = inflight.run(1, || async { Ok(1) });
        let b = inflight.run(2, || async { Ok(2) });
        assert_eq!(inflight.len(), 2);
        assert_eq!((a.await.unwrap(), b.await.unwrap()), (1, 2));
    }
}
