//! Batched writes with size and debounce triggers
//!
//! Items are grouped by operation name. A queue flushes as soon as it holds
//! `batch_size` items, or once `batch_delay` has passed without a new enqueue.
//! Delivery is at-most-once: a failed flush is logged and its items dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::BatchConfig;
use crate::error::DataResult;

/// Callback that receives a whole batch
pub type FlushFn<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, DataResult<()>> + Send + Sync>;

/// Wrap an async closure as a [`FlushFn`]
pub fn flush_fn<T, F, Fut>(f: F) -> FlushFn<T>
where
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DataResult<()>> + Send + 'static,
{
    Arc::new(move |items| f(items).boxed())
}

/// Batch statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStats {
    /// Operation names with items waiting
    pub pending_queues: usize,

    /// Items waiting across all queues
    pub pending_items: usize,

    /// Total items enqueued
    pub total_enqueued: u64,

    /// Total items delivered by successful flushes
    pub total_flushed: u64,

    /// Number of successful flushes
    pub flush_count: u64,

    /// Flushes whose callback failed
    pub failed_batches: u64,

    /// Items discarded by failed flushes
    pub dropped_items: u64,

    /// Last successful flush time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_flush_at: Option<DateTime<Utc>>,
}

struct BatchQueue<T> {
    items: Vec<T>,
    flush_fn: FlushFn<T>,
    /// Bumped on every enqueue; a timer only flushes the generation it was armed for
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Inner<T> {
    config: BatchConfig,
    queues: Mutex<HashMap<String, BatchQueue<T>>>,

    total_enqueued: AtomicU64,
    total_flushed: AtomicU64,
    flush_count: AtomicU64,
    failed_batches: AtomicU64,
    dropped_items: AtomicU64,
    last_flush_at: Mutex<Option<DateTime<Utc>>>,
}

impl<T: Send + 'static> Inner<T> {
    /// Detach the queue for `operation` and cancel its timer
    fn take_queue(&self, operation: &str) -> Option<(Vec<T>, FlushFn<T>)> {
        let mut queues = self.queues.lock();
        let mut queue = queues.remove(operation)?;
        if let Some(timer) = queue.timer.take() {
            timer.abort();
        }
        Some((queue.items, queue.flush_fn))
    }

    async fn flush_if_current(&self, operation: &str, generation: u64) {
        let ready = {
            let mut queues = self.queues.lock();
            let current = queues
                .get(operation)
                .is_some_and(|queue| queue.generation == generation);
            if current {
                queues
                    .remove(operation)
                    .map(|queue| (queue.items, queue.flush_fn))
            } else {
                None
            }
        };

        if let Some((items, flush)) = ready {
            debug!(operation, count = items.len(), "batch delay elapsed");
            self.run_flush(operation, items, flush).await;
        }
    }

    async fn run_flush(&self, operation: &str, items: Vec<T>, flush: FlushFn<T>) -> usize {
        let count = items.len();
        if count == 0 {
            return 0;
        }

        match flush(items).await {
            Ok(()) => {
                self.total_flushed.fetch_add(count as u64, Ordering::Relaxed);
                self.flush_count.fetch_add(1, Ordering::Relaxed);
                *self.last_flush_at.lock() = Some(Utc::now());
                debug!(operation, count, "batch flushed");
                count
            }
            Err(err) => {
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.dropped_items.fetch_add(count as u64, Ordering::Relaxed);
                warn!(operation, count, error = %err, "batch flush failed, items dropped");
                0
            }
        }
    }
}

/// Accumulates items per operation name and flushes them in batches
pub struct BatchManager<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> BatchManager<T> {
    /// Create a new batch manager
    pub fn new(config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                queues: Mutex::new(HashMap::new()),
                total_enqueued: AtomicU64::new(0),
                total_flushed: AtomicU64::new(0),
                flush_count: AtomicU64::new(0),
                failed_batches: AtomicU64::new(0),
                dropped_items: AtomicU64::new(0),
                last_flush_at: Mutex::new(None),
            }),
        }
    }

    /// Append `item` to the queue for `operation`.
    ///
    /// Reaching `batch_size` flushes right away (awaited here); otherwise the
    /// debounce timer is re-armed. The latest `flush` callback wins.
    pub async fn add_to_batch(&self, operation: &str, item: T, flush: FlushFn<T>) {
        let ready = {
            let mut queues = self.inner.queues.lock();
            let queue = queues
                .entry(operation.to_string())
                .or_insert_with(|| BatchQueue {
                    items: Vec::new(),
                    flush_fn: Arc::clone(&flush),
                    generation: 0,
                    timer: None,
                });

            queue.items.push(item);
            queue.flush_fn = flush;
            queue.generation += 1;
            self.inner.total_enqueued.fetch_add(1, Ordering::Relaxed);

            if let Some(timer) = queue.timer.take() {
                timer.abort();
            }

            let full = queue.items.len() >= self.inner.config.batch_size;
            if !full {
                let inner = Arc::clone(&self.inner);
                let name = operation.to_string();
                let generation = queue.generation;
                let delay = self.inner.config.batch_delay();

                queue.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.flush_if_current(&name, generation).await;
                }));
            }

            if full {
                queues
                    .remove(operation)
                    .map(|queue| (queue.items, queue.flush_fn))
            } else {
                None
            }
        };

        if let Some((items, flush)) = ready {
            debug!(operation, count = items.len(), "batch size reached");
            self.inner.run_flush(operation, items, flush).await;
        }
    }

    /// Flush one queue now. Returns the number of items delivered.
    pub async fn flush(&self, operation: &str) -> usize {
        match self.inner.take_queue(operation) {
            Some((items, flush)) => self.inner.run_flush(operation, items, flush).await,
            None => 0,
        }
    }

    /// Flush every queue now. Returns the number of items delivered.
    pub async fn flush_all(&self) -> usize {
        let operations: Vec<String> = self.inner.queues.lock().keys().cloned().collect();

        let mut delivered = 0;
        for operation in operations {
            delivered += self.flush(&operation).await;
        }
        delivered
    }

    /// Flush everything and leave no timers behind
    pub async fn dispose(&self) {
        let delivered = self.flush_all().await;
        debug!(delivered, "batch manager disposed");
    }

    /// Items waiting for `operation`
    pub fn pending_count(&self, operation: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(operation)
            .map(|q| q.items.len())
            .unwrap_or(0)
    }

    /// Whether a debounce timer is armed for `operation`
    pub fn has_pending_timer(&self, operation: &str) -> bool {
        self.inner
            .queues
            .lock()
            .get(operation)
            .is_some_and(|q| q.timer.as_ref().is_some_and(|t| !t.is_finished()))
    }

    /// Get batch statistics
    pub fn stats(&self) -> BatchStats {
        let (pending_queues, pending_items) = {
            let queues = self.inner.queues.lock();
            (queues.len(), queues.values().map(|q| q.items.len()).sum())
        };

        BatchStats {
            pending_queues,
            pending_items,
            total_enqueued: self.inner.total_enqueued.load(Ordering::Relaxed),
            total_flushed: self.inner.total_flushed.load(Ordering::Relaxed),
            flush_count: self.inner.flush_count.load(Ordering::Relaxed),
            failed_batches: self.inner.failed_batches.load(Ordering::Relaxed),
            dropped_items: self.inner.dropped_items.load(Ordering::Relaxed),
            last_flush_at: *self.inner.last_flush_at.lock(),
        }
    }
}
