//! Request deduplication
//!
//! Concurrent callers asking for the same key share one in-flight request.
//! The registry entry is removed as soon as the request settles, success or
//! failure, so results are never kept here; that is the cache's job.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DataResult;

type SharedRequest<T> = Shared<BoxFuture<'static, DataResult<T>>>;

struct PendingRequest<T> {
    /// Distinguishes this flight from a later one under the same key
    id: u64,
    future: SharedRequest<T>,
}

/// Deduplicator statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupStats {
    /// Requests currently in flight
    pub in_flight: usize,

    /// Underlying requests started
    pub started: u64,

    /// Callers that joined an existing flight instead of starting one
    pub joined: u64,
}

/// Collapses concurrent identical requests into one
pub struct RequestDeduplicator<T> {
    pending: Arc<Mutex<HashMap<String, PendingRequest<T>>>>,
    next_id: AtomicU64,
    started: AtomicU64,
    joined: AtomicU64,
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            started: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Run `factory` for `key` unless a request for `key` is already in
    /// flight, in which case wait for that request's outcome instead.
    ///
    /// Every waiter receives the same value or the same error.
    pub async fn deduplicate<F, Fut>(&self, key: &str, factory: F) -> DataResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DataResult<T>> + Send + 'static,
    {
        let request = {
            let mut pending = self.pending.lock();

            if let Some(existing) = pending.get(key) {
                self.joined.fetch_add(1, Ordering::Relaxed);
                debug!(key, "joined in-flight request");
                existing.future.clone()
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let registry = Arc::clone(&self.pending);
                let owned_key = key.to_string();
                let upstream = factory();

                let future = async move {
                    let result = upstream.await;
                    let mut pending = registry.lock();
                    if pending.get(&owned_key).is_some_and(|p| p.id == id) {
                        pending.remove(&owned_key);
                    }
                    result
                }
                .boxed()
                .shared();

                pending.insert(key.to_string(), PendingRequest { id, future: future.clone() });
                self.started.fetch_add(1, Ordering::Relaxed);
                future
            }
        };

        request.await
    }

    /// Whether a request for `key` is currently in flight
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Number of requests currently in flight
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            in_flight: self.in_flight(),
            started: self.started.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
        }
    }
}

impl<T> Default for RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
