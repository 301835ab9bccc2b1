//! TTL cache for avoiding redundant remote reads
//!
//! A single flat map bounded by `max_entries`. When a new key would push the
//! cache over capacity, the oldest *inserted* key is evicted (FIFO, not LRU).
//! Expired entries are dropped lazily on lookup or by [`TtlCache::evict_expired`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;

/// A cached value with its expiry bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached payload
    pub value: V,

    /// When it was stored
    pub stored_at: Instant,

    /// How long it stays valid after `stored_at`
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
            ttl,
        }
    }

    /// Valid iff `now - stored_at < ttl`
    pub fn is_expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }

    /// Get time until expiration
    pub fn ttl_remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.stored_at.elapsed())
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of entries in cache
    pub entry_count: usize,

    /// Total cache hits
    pub hits: u64,

    /// Total cache misses (including expired lookups)
    pub misses: u64,

    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,

    /// Entries removed for capacity or expiry
    pub evictions: u64,
}

struct State<V> {
    map: HashMap<String, CacheEntry<V>>,
    order: VecDeque<String>,
    /// Bumped by every invalidation, matching or not
    generation: u64,
}

impl<V> State<V> {
    fn remove(&mut self, key: &str) -> bool {
        if self.map.remove(key).is_some() {
            self.order.retain(|k| k != key);
            return true;
        }
        false
    }
}

/// Bounded key/value cache with per-entry expiration
pub struct TtlCache<V> {
    config: CacheConfig,
    state: Mutex<State<V>>,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
    /// Create a new cache. A `max_entries` of zero is treated as one.
    pub fn new(mut config: CacheConfig) -> Self {
        config.max_entries = config.max_entries.max(1);
        Self {
            config,
            state: Mutex::new(State {
                map: HashMap::new(),
                order: VecDeque::new(),
                generation: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a live entry. Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock();

        let expired = match state.map.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            state.remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value with the configured default TTL
    pub fn set(&self, key: &str, value: V) {
        self.set_with_ttl(key, value, self.config.default_ttl());
    }

    /// Store a value with an explicit TTL
    pub fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        let mut state = self.state.lock();
        Self::insert(&mut state, &self.config, &self.evictions, key, value, ttl);
    }

    /// Store a value only if nothing was invalidated since `generation` was read.
    ///
    /// Lets a slow load that started before a write landed skip filling the
    /// cache with what it read. Returns whether the value was stored.
    pub fn set_if_generation(&self, key: &str, value: V, ttl: Duration, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(key, "skipped cache fill after invalidation");
            return false;
        }
        Self::insert(&mut state, &self.config, &self.evictions, key, value, ttl);
        true
    }

    /// Current invalidation generation, see [`set_if_generation`](Self::set_if_generation)
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn insert(
        state: &mut State<V>,
        config: &CacheConfig,
        evictions: &AtomicU64,
        key: &str,
        value: V,
        ttl: Duration,
    ) {
        if !state.map.contains_key(key) {
            while state.map.len() >= config.max_entries {
                let Some(oldest) = state.order.pop_front() else { break };
                state.map.remove(&oldest);
                evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %oldest, "evicted oldest cache entry");
            }
            state.order.push_back(key.to_string());
        }

        state.map.insert(key.to_string(), CacheEntry::new(value, ttl));
    }

    /// Remove one entry by exact key
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        state.generation += 1;
        state.remove(key)
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut state = self.state.lock();
        state.generation += 1;
        let before = state.map.len();

        state.map.retain(|k, _| !k.starts_with(prefix));
        state.order.retain(|k| !k.starts_with(prefix));
        before - state.map.len()
    }

    /// Remove every entry whose key contains `pattern`. Returns how many were removed.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut state = self.state.lock();
        state.generation += 1;
        let before = state.map.len();

        state.map.retain(|k, _| !k.contains(pattern));
        state.order.retain(|k| !k.contains(pattern));

        let removed = before - state.map.len();
        if removed > 0 {
            debug!(pattern, removed, "invalidated cache entries");
        }
        removed
    }

    /// Clear the entire cache
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.map.clear();
        state.order.clear();
    }

    /// Remove expired entries
    pub fn evict_expired(&self) -> usize {
        let mut state = self.state.lock();

        let expired: Vec<String> = state
            .map
            .iter()
            .filter(|(_, v)| v.is_expired())
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }
        self.evictions.fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Number of stored entries, live or not yet swept
    pub fn len(&self) -> usize {
        self.state.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let entry_count = self.len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            entry_count,
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
