//! Scalable Data - data-access optimization layer
//!
//! Sits between application code and a remote data store and cuts down
//! redundant traffic:
//! - Caches reads with a per-entry TTL
//! - Collapses concurrent identical reads into one request
//! - Batches writes per operation, flushing on size or after a quiet period
//! - Applies per-user sliding window rate limits to state-changing calls
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ScalableDataService                         │
//! │                                                              │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐    │
//! │  │   TTL    │  │ Request  │  │  Batch   │  │  Rate    │    │
//! │  │  Cache   │  │  Dedup   │  │ Manager  │  │ Limiter  │    │
//! │  └──────────┘  └──────────┘  └──────────┘  └──────────┘    │
//! │       read path: cache → dedup → store → cache              │
//! │       write path: limiter → batch → store                   │
//! │                          │                                  │
//! │                    ┌─────▼─────┐                           │
//! │                    │ DataStore │                           │
//! │                    └───────────┘                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use scalable_data::{ScalableDataService, ServiceConfig};
//!
//! let service = ScalableDataService::in_memory(ServiceConfig::default());
//!
//! let stats = service.get_campaign_stats("user-1").await?;
//!
//! if !service.update_campaign_analytics("user-1", update).await? {
//!     // rate limited, tell the user to slow down
//! }
//!
//! service.dispose().await;
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod models;
pub mod rate_limit;
pub mod store;

pub use batch::{flush_fn, BatchManager, BatchStats, FlushFn};
pub use cache::{CacheEntry, CacheStats, TtlCache};
pub use config::{BatchConfig, CacheConfig, RateLimitConfig, RateLimitRule, ServiceConfig};
pub use dedup::{DedupStats, RequestDeduplicator};
pub use error::{DataError, DataResult};
pub use models::{ActivityType, AnalyticsUpdate, Campaign, CampaignStats, CampaignStatus, UrlActivity};
pub use rate_limit::{RateLimitResult, RateLimiter};
pub use store::{DataStore, MemoryStore, QueryDescriptor};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Operation name and table for URL activity writes
pub const ACTIVITY_BATCH: &str = "url_activity";
/// Operation name for campaign analytics writes
pub const ANALYTICS_BATCH: &str = "analytics_update";

const CAMPAIGNS_TABLE: &str = "campaigns";

/// Values held by the service cache
#[derive(Debug, Clone)]
enum Cached {
    Stats(CampaignStats),
    Campaigns(Vec<Campaign>),
    Activity(Vec<UrlActivity>),
}

fn stats_key(user_id: &str) -> String {
    format!("campaign_stats_{}", user_id)
}

fn campaigns_key(user_id: &str) -> String {
    format!("user_campaigns_{}", user_id)
}

fn activity_prefix(campaign_id: &str) -> String {
    format!("recent_activity_{}_", campaign_id)
}

/// Cache entries made stale by a written row
enum Stale {
    Key(String),
    Prefix(String),
}

impl Stale {
    fn evict(&self, cache: &TtlCache<Cached>) {
        match self {
            Stale::Key(key) => {
                cache.remove(key);
            }
            Stale::Prefix(prefix) => {
                cache.invalidate_prefix(prefix);
            }
        }
    }
}

fn analytics_stale(row: &Value) -> Vec<Stale> {
    match row.get("user_id").and_then(Value::as_str) {
        Some(user_id) => vec![
            Stale::Key(stats_key(user_id)),
            Stale::Key(campaigns_key(user_id)),
        ],
        None => Vec::new(),
    }
}

fn activity_stale(row: &Value) -> Vec<Stale> {
    match row.get("campaign_id").and_then(Value::as_str) {
        Some(campaign_id) => vec![Stale::Prefix(activity_prefix(campaign_id))],
        None => Vec::new(),
    }
}

/// Decode fetched rows one by one; rows that do not decode are logged and skipped
fn decode_rows<T: DeserializeOwned>(table: &str, rows: Value) -> DataResult<Vec<T>> {
    let Value::Array(rows) = rows else {
        return Err(DataError::Serialization(format!(
            "expected an array of rows from '{}'",
            table
        )));
    };

    Ok(rows
        .into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(table, error = %err, "skipping malformed row");
                None
            }
        })
        .collect())
}

async fn load_campaigns(store: &dyn DataStore, user_id: &str) -> DataResult<Vec<Campaign>> {
    let query = QueryDescriptor::table(CAMPAIGNS_TABLE)
        .eq("user_id", user_id)
        .order_desc("created_at");

    let rows = store.fetch(&query).await?;
    decode_rows(CAMPAIGNS_TABLE, rows)
}

fn unexpected(key: &str) -> DataError {
    DataError::Internal(format!("unexpected cached payload under '{}'", key))
}

/// Facade composing cache, deduplicator, batch manager and rate limiter
pub struct ScalableDataService {
    /// Configuration
    config: ServiceConfig,

    /// Remote store
    store: Arc<dyn DataStore>,

    /// Shared with the batch writers, which evict what they overwrite
    cache: Arc<TtlCache<Cached>>,
    /// Loads tagged with the cache generation seen when the flight started
    dedup: RequestDeduplicator<(u64, Cached)>,
    batches: BatchManager<Value>,
    limiter: RateLimiter,

    activity_writer: FlushFn<Value>,
    analytics_writer: FlushFn<Value>,
}

impl ScalableDataService {
    /// Create a service over `store`
    pub fn new(config: ServiceConfig, store: Arc<dyn DataStore>) -> Self {
        let cache = Arc::new(TtlCache::new(config.cache.clone()));
        let activity_writer = table_writer(&store, &cache, ACTIVITY_BATCH, "id", activity_stale);
        let analytics_writer = table_writer(&store, &cache, CAMPAIGNS_TABLE, "id", analytics_stale);

        Self {
            cache,
            dedup: RequestDeduplicator::new(),
            batches: BatchManager::new(config.batch.clone()),
            limiter: RateLimiter::new(config.rate_limits.clone()),
            config,
            store,
            activity_writer,
            analytics_writer,
        }
    }

    /// Create a service over a fresh [`MemoryStore`]
    pub fn in_memory(config: ServiceConfig) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()))
    }

    /// The store this service fronts
    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    /// Cache lookup, then a deduplicated load on miss, then cache fill.
    ///
    /// The fill is skipped when an invalidation happened after the shared
    /// load started, so neither its starter nor a late joiner can cache rows
    /// read before a write landed.
    async fn read_through<F, Fut>(&self, key: &str, ttl: Duration, load: F) -> DataResult<Cached>
    where
        F: FnOnce(Arc<dyn DataStore>) -> Fut,
        Fut: Future<Output = DataResult<Cached>> + Send + 'static,
    {
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit);
        }

        let cache = Arc::clone(&self.cache);
        let store = Arc::clone(&self.store);
        let (generation, value) = self
            .dedup
            .deduplicate(key, move || {
                let generation = cache.generation();
                load(store).map(move |loaded| loaded.map(|value| (generation, value)))
            })
            .await?;
        self.cache.set_if_generation(key, value.clone(), ttl, generation);
        Ok(value)
    }

    /// Aggregate campaign numbers for a user
    pub async fn get_campaign_stats(&self, user_id: &str) -> DataResult<CampaignStats> {
        let key = stats_key(user_id);
        let owner = user_id.to_string();

        let cached = self
            .read_through(&key, self.config.stats_ttl(), move |store| async move {
                let campaigns = load_campaigns(store.as_ref(), &owner).await?;
                Ok(Cached::Stats(CampaignStats::from_campaigns(&owner, &campaigns)))
            })
            .await?;

        match cached {
            Cached::Stats(stats) => Ok(stats),
            _ => Err(unexpected(&key)),
        }
    }

    /// A user's campaigns, newest first
    pub async fn get_user_campaigns(&self, user_id: &str) -> DataResult<Vec<Campaign>> {
        let key = campaigns_key(user_id);
        let owner = user_id.to_string();

        let cached = self
            .read_through(&key, self.config.cache.default_ttl(), move |store| async move {
                Ok(Cached::Campaigns(load_campaigns(store.as_ref(), &owner).await?))
            })
            .await?;

        match cached {
            Cached::Campaigns(campaigns) => Ok(campaigns),
            _ => Err(unexpected(&key)),
        }
    }

    /// Latest URL activity for a campaign, newest first
    pub async fn get_recent_activity(&self, campaign_id: &str, limit: usize) -> DataResult<Vec<UrlActivity>> {
        let key = format!("{}{}", activity_prefix(campaign_id), limit);
        let query = QueryDescriptor::table(ACTIVITY_BATCH)
            .eq("campaign_id", campaign_id)
            .order_desc("timestamp")
            .limit(limit);

        let cached = self
            .read_through(&key, self.config.activity_ttl(), move |store| async move {
                let rows = store.fetch(&query).await?;
                Ok(Cached::Activity(decode_rows(ACTIVITY_BATCH, rows)?))
            })
            .await?;

        match cached {
            Cached::Activity(activity) => Ok(activity),
            _ => Err(unexpected(&key)),
        }
    }

    /// Queue a URL activity record for the batched write path.
    ///
    /// The campaign's cached feeds are dropped now and again once the batch
    /// is written. Returns `Ok(false)` without queuing when the user is over the
    /// `automation` budget.
    pub async fn record_url_activity(&self, user_id: &str, activity: UrlActivity) -> DataResult<bool> {
        if !self.limiter.check_limit(user_id, "automation") {
            return Ok(false);
        }

        let row = serde_json::to_value(&activity)?;
        self.cache.invalidate_prefix(&activity_prefix(&activity.campaign_id));
        self.batches
            .add_to_batch(ACTIVITY_BATCH, row, Arc::clone(&self.activity_writer))
            .await;
        Ok(true)
    }

    /// Queue a campaign analytics update for the batched write path.
    ///
    /// The user's cached stats and campaign list are dropped now and again
    /// once the batch is written. Returns `Ok(false)` without queuing when the user is over the
    /// `default` budget.
    pub async fn update_campaign_analytics(&self, user_id: &str, update: AnalyticsUpdate) -> DataResult<bool> {
        if !self.limiter.check_limit(user_id, config::DEFAULT_CLASS) {
            return Ok(false);
        }

        let row = serde_json::to_value(&update)?;
        self.cache.remove(&stats_key(user_id));
        self.cache.remove(&campaigns_key(user_id));
        self.batches
            .add_to_batch(ANALYTICS_BATCH, row, Arc::clone(&self.analytics_writer))
            .await;
        Ok(true)
    }

    /// Advisory admission check for any other state-changing action
    pub fn check_rate_limit(&self, user_id: &str, class: &str) -> bool {
        self.limiter.check_limit(user_id, class)
    }

    /// Drop the cached stats and campaign list of `user_id`
    pub fn invalidate_user(&self, user_id: &str) -> usize {
        [stats_key(user_id), campaigns_key(user_id)]
            .iter()
            .filter(|key| self.cache.remove(key))
            .count()
    }

    /// Forget everything held for a user
    pub fn logout(&self, user_id: &str) {
        let removed = self.invalidate_user(user_id);
        self.limiter.clear_user(user_id);
        debug!(user_id, removed, "cleared user state");
    }

    /// Drop expired cache entries and idle rate limit windows
    pub fn sweep(&self) -> SweepReport {
        SweepReport {
            expired_entries: self.cache.evict_expired(),
            idle_windows: self.limiter.sweep(),
        }
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` on the tokio runtime.
    ///
    /// The task stops once the service is dropped; abort the handle to stop it sooner.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let period = self.config.rate_limits.sweep_interval().max(Duration::from_millis(1));
        let service = Arc::downgrade(self);
        info!(interval_ms = period.as_millis() as u64, "starting maintenance sweeps");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(strong) = service.upgrade() else { break };
                let report = strong.sweep();
                debug!(
                    expired_entries = report.expired_entries,
                    idle_windows = report.idle_windows,
                    "maintenance sweep"
                );
            }
        })
    }

    /// Flush every pending write batch now
    pub async fn flush(&self) -> usize {
        self.batches.flush_all().await
    }

    /// Get combined statistics
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            cache: self.cache.stats(),
            dedup: self.dedup.stats(),
            batches: self.batches.stats(),
            rate_limit_windows: self.limiter.tracked_windows(),
        }
    }

    /// Flush pending writes, cancel timers and clear the cache
    pub async fn dispose(&self) {
        self.batches.dispose().await;
        self.cache.clear();
        info!(store = self.store.name(), "data service disposed");
    }
}

/// Flush callback that upserts into `table`, then evicts the cache entries the rows made stale
fn table_writer(
    store: &Arc<dyn DataStore>,
    cache: &Arc<TtlCache<Cached>>,
    table: &'static str,
    conflict_key: &'static str,
    stale_for: fn(&Value) -> Vec<Stale>,
) -> FlushFn<Value> {
    let store = Arc::clone(store);
    let cache = Arc::clone(cache);
    flush_fn(move |rows: Vec<Value>| {
        let store = Arc::clone(&store);
        let cache = Arc::clone(&cache);
        let stale: Vec<Stale> = rows.iter().flat_map(stale_for).collect();
        async move {
            store.write(table, rows, conflict_key).await?;
            for entry in &stale {
                entry.evict(&cache);
            }
            Ok::<(), DataError>(())
        }
    })
}

/// What a sweep removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired_entries: usize,
    pub idle_windows: usize,
}

/// Combined statistics for the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    pub cache: CacheStats,
    pub dedup: DedupStats,
    pub batches: BatchStats,
    pub rate_limit_windows: usize,
}
