//! ScalableDataService integration tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scalable_data::{
    ActivityType, AnalyticsUpdate, BatchConfig, DataError, DataResult, DataStore, MemoryStore,
    QueryDescriptor, RateLimitRule, ScalableDataService, ServiceConfig, UrlActivity,
};

/// MemoryStore behind a fixed fetch latency, with switchable failures.
/// Reads snapshot the rows first, then wait out the latency.
struct SlowStore {
    inner: MemoryStore,
    latency: Duration,
    failing: AtomicBool,
}

impl SlowStore {
    fn new(latency_ms: u64) -> Self {
        Self {
            inner: MemoryStore::new(),
            latency: Duration::from_millis(latency_ms),
            failing: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DataStore for SlowStore {
    fn name(&self) -> &str {
        "slow"
    }

    async fn fetch(&self, query: &QueryDescriptor) -> DataResult<Value> {
        let rows = self.inner.fetch(query).await;
        tokio::time::sleep(self.latency).await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(DataError::Upstream("connection reset".into()));
        }
        rows
    }

    async fn write(&self, table: &str, rows: Vec<Value>, conflict_key: &str) -> DataResult<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DataError::Store {
                table: table.to_string(),
                reason: "connection reset".into(),
            });
        }
        self.inner.write(table, rows, conflict_key).await
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scalable_data=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

fn campaign_row(id: &str, user_id: &str, status: &str, built: u64, live: u64) -> Value {
    json!({
        "id": id,
        "user_id": user_id,
        "name": format!("Campaign {}", id),
        "status": status,
        "links_built": built,
        "links_live": live,
        "created_at": "2026-02-01T09:00:00Z",
    })
}

fn seeded_store(latency_ms: u64) -> Arc<SlowStore> {
    let store = Arc::new(SlowStore::new(latency_ms));
    store.inner.insert_rows(
        "campaigns",
        vec![
            campaign_row("c1", "user-1", "active", 4, 2),
            campaign_row("c2", "user-1", "paused", 6, 3),
            campaign_row("c3", "user-2", "active", 1, 1),
        ],
    );
    store
}

fn service_over(store: &Arc<SlowStore>, config: ServiceConfig) -> ScalableDataService {
    let store: Arc<dyn DataStore> = store.clone();
    ScalableDataService::new(config, store)
}

fn activity_at(campaign_id: &str, url: &str, second: u32) -> UrlActivity {
    let mut activity = UrlActivity::new(campaign_id, ActivityType::Posting, url, "posted");
    activity.timestamp = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, second).unwrap();
    activity
}

#[tokio::test(start_paused = true)]
async fn test_campaign_stats_are_cached() {
    let store = seeded_store(0);
    let service = service_over(&store, ServiceConfig::default());

    let stats = service.get_campaign_stats("user-1").await.unwrap();
    assert_eq!(stats.total_campaigns, 2);
    assert_eq!(stats.active_campaigns, 1);
    assert_eq!(stats.links_built, 10);
    assert_eq!(stats.links_live, 5);
    assert!((stats.success_rate - 50.0).abs() < f64::EPSILON);

    let again = service.get_campaign_stats("user-1").await.unwrap();
    assert_eq!(again, stats);
    assert_eq!(store.inner.fetch_calls(), 1);

    let cache = service.stats().cache;
    assert_eq!(cache.hits, 1);
    assert_eq!(cache.misses, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stats_refetched_after_ttl() {
    let store = seeded_store(0);
    let service = service_over(&store, ServiceConfig::default());

    service.get_campaign_stats("user-1").await.unwrap();
    tokio::time::advance(Duration::from_secs(59)).await;
    service.get_campaign_stats("user-1").await.unwrap();
    assert_eq!(store.inner.fetch_calls(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    service.get_campaign_stats("user-1").await.unwrap();
    assert_eq!(store.inner.fetch_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reads_share_one_fetch() {
    let store = seeded_store(50);
    let service = service_over(&store, ServiceConfig::default());

    let (a, b, c) = tokio::join!(
        service.get_campaign_stats("user-1"),
        service.get_campaign_stats("user-1"),
        service.get_campaign_stats("user-1"),
    );

    assert_eq!(a.unwrap().links_built, 10);
    assert_eq!(b.unwrap().links_built, 10);
    assert_eq!(c.unwrap().links_built, 10);
    assert_eq!(store.inner.fetch_calls(), 1);
    assert_eq!(service.stats().dedup.joined, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_read_reaches_every_caller_and_is_not_cached() {
    init_tracing();
    let store = seeded_store(50);
    store.failing.store(true, Ordering::SeqCst);
    let service = service_over(&store, ServiceConfig::default());

    let (a, b) = tokio::join!(
        service.get_user_campaigns("user-1"),
        service.get_user_campaigns("user-1"),
    );
    assert_eq!(a.unwrap_err(), DataError::Upstream("connection reset".into()));
    assert_eq!(b.unwrap_err(), DataError::Upstream("connection reset".into()));
    assert_eq!(service.stats().cache.entry_count, 0);

    store.failing.store(false, Ordering::SeqCst);
    let campaigns = service.get_user_campaigns("user-1").await.unwrap();
    assert_eq!(campaigns.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_analytics_update_flows_through_batch() {
    init_tracing();
    let store = seeded_store(0);
    let service = service_over(&store, ServiceConfig::default());

    assert_eq!(service.get_campaign_stats("user-1").await.unwrap().links_built, 10);

    let update = AnalyticsUpdate::new("c1", "user-1").links_built(14).links_live(9);
    assert!(service.update_campaign_analytics("user-1", update).await.unwrap());

    // queued, not yet written
    assert_eq!(store.inner.write_calls(), 0);
    assert_eq!(service.stats().batches.pending_items, 1);

    assert_eq!(service.flush().await, 1);

    let stats = service.get_campaign_stats("user-1").await.unwrap();
    assert_eq!(stats.links_built, 20);
    assert_eq!(stats.links_live, 12);

    // the merge keeps columns the update did not carry
    let rows = store.inner.rows("campaigns");
    assert_eq!(rows[0]["name"], "Campaign c1");
    assert_eq!(rows[0]["status"], "active");
}

#[tokio::test(start_paused = true)]
async fn test_read_during_batch_window_refreshed_once_written() {
    let store = seeded_store(0);
    let service = service_over(&store, ServiceConfig::default());

    assert_eq!(service.get_campaign_stats("user-1").await.unwrap().links_built, 10);

    let update = AnalyticsUpdate::new("c1", "user-1").links_built(100);
    assert!(service.update_campaign_analytics("user-1", update).await.unwrap());

    // the write is still queued, so this read sees and caches the old rows
    assert_eq!(service.get_campaign_stats("user-1").await.unwrap().links_built, 10);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.inner.rows("campaigns")[0]["links_built"], 100);
    assert_eq!(service.get_campaign_stats("user-1").await.unwrap().links_built, 106);
}

#[tokio::test(start_paused = true)]
async fn test_read_in_flight_when_write_lands_is_not_cached() {
    let store = seeded_store(50);
    let service = service_over(&store, ServiceConfig::default());

    let update = AnalyticsUpdate::new("c1", "user-1").links_built(100);
    assert!(service.update_campaign_analytics("user-1", update).await.unwrap());

    // first read snapshots at 80ms, the batch lands at 100ms, a second read
    // joins the same load at 110ms, both return at 130ms
    tokio::time::sleep(Duration::from_millis(80)).await;
    let (first, joined) = tokio::join!(service.get_campaign_stats("user-1"), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        service.get_campaign_stats("user-1").await
    });
    assert_eq!(first.unwrap().links_built, 10);
    assert_eq!(joined.unwrap().links_built, 10);
    assert_eq!(service.stats().dedup.joined, 1);
    assert_eq!(store.inner.write_calls(), 1);
    assert_eq!(service.stats().cache.entry_count, 0);

    assert_eq!(service.get_campaign_stats("user-1").await.unwrap().links_built, 106);
    assert_eq!(store.inner.fetch_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_update_for_unknown_campaign_keeps_reads_working() {
    init_tracing();
    let store = seeded_store(0);
    let service = service_over(&store, ServiceConfig::default());

    let update = AnalyticsUpdate::new("c-new", "user-1").links_live(1);
    assert!(service.update_campaign_analytics("user-1", update).await.unwrap());
    assert_eq!(service.flush().await, 1);

    // the partial row is stored, but it is not a decodable campaign
    assert_eq!(store.inner.rows("campaigns").len(), 4);

    let stats = service.get_campaign_stats("user-1").await.unwrap();
    assert_eq!(stats.total_campaigns, 2);
    assert_eq!(stats.links_live, 5);
    assert_eq!(service.get_user_campaigns("user-1").await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_user_invalidation_is_exact() {
    let store = seeded_store(0);
    store
        .inner
        .insert_rows("campaigns", vec![campaign_row("c10", "user-10", "active", 8, 8)]);
    let service = service_over(&store, ServiceConfig::default());

    service.get_campaign_stats("user-1").await.unwrap();
    service.get_campaign_stats("user-10").await.unwrap();
    assert_eq!(store.inner.fetch_calls(), 2);

    assert_eq!(service.invalidate_user("user-1"), 1);

    let update = AnalyticsUpdate::new("c1", "user-1").links_built(5);
    assert!(service.update_campaign_analytics("user-1", update).await.unwrap());
    service.flush().await;

    // user-10 shares the "user-1" prefix but keeps its entry
    assert_eq!(service.get_campaign_stats("user-10").await.unwrap().links_built, 8);
    assert_eq!(store.inner.fetch_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_is_dropped() {
    init_tracing();
    let store = seeded_store(0);
    let service = service_over(&store, ServiceConfig::default());

    store.failing.store(true, Ordering::SeqCst);
    let update = AnalyticsUpdate::new("c1", "user-1").links_built(99);
    assert!(service.update_campaign_analytics("user-1", update).await.unwrap());
    assert_eq!(service.flush().await, 0);

    let batches = service.stats().batches;
    assert_eq!(batches.failed_batches, 1);
    assert_eq!(batches.dropped_items, 1);
    assert_eq!(batches.pending_items, 0);

    // the dropped update is not retried
    store.failing.store(false, Ordering::SeqCst);
    assert_eq!(service.flush().await, 0);
    assert_eq!(service.get_campaign_stats("user-1").await.unwrap().links_built, 10);
}

#[tokio::test(start_paused = true)]
async fn test_pending_writes_flush_after_delay() {
    let store = seeded_store(0);
    let service = service_over(&store, ServiceConfig::default());

    let update = AnalyticsUpdate::new("c2", "user-1").links_live(6);
    assert!(service.update_campaign_analytics("user-1", update).await.unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.inner.write_calls(), 1);
    assert_eq!(store.inner.rows("campaigns")[1]["links_live"], 6);
}

#[tokio::test(start_paused = true)]
async fn test_activity_batch_flushes_at_size() {
    let store = seeded_store(0);
    let mut config = ServiceConfig::default();
    config.batch = BatchConfig::default().with_batch_size(3);
    let service = service_over(&store, config);

    for i in 0..3 {
        let activity = activity_at("c1", &format!("https://blog{}.example.com/post", i), i);
        assert!(service.record_url_activity("user-1", activity).await.unwrap());
    }

    assert_eq!(store.inner.write_calls(), 1);
    let rows = store.inner.rows("url_activity");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["domain"], "blog0.example.com");
}

#[tokio::test(start_paused = true)]
async fn test_activity_rate_limited() {
    let store = seeded_store(0);
    let mut config = ServiceConfig::default();
    config.rate_limits = config.rate_limits.with_rule("automation", RateLimitRule::new(2, 60_000));
    let service = service_over(&store, config);

    let mut admitted = Vec::new();
    for i in 0..3 {
        let activity = activity_at("c1", "https://example.com/", i);
        admitted.push(service.record_url_activity("user-1", activity).await.unwrap());
    }
    assert_eq!(admitted, vec![true, true, false]);

    // another user has their own budget
    let activity = activity_at("c3", "https://example.com/", 0);
    assert!(service.record_url_activity("user-2", activity).await.unwrap());

    assert_eq!(service.flush().await, 3);
    assert_eq!(store.inner.rows("url_activity").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_recent_activity_newest_first() {
    let store = seeded_store(0);
    let service = service_over(&store, ServiceConfig::default());

    for (campaign, second) in [("c1", 1), ("c1", 3), ("c2", 4), ("c1", 2)] {
        let activity = activity_at(campaign, "https://example.com/", second);
        store
            .inner
            .insert_rows("url_activity", vec![serde_json::to_value(&activity).unwrap()]);
    }

    let recent = service.get_recent_activity("c1", 2).await.unwrap();
    let seconds: Vec<String> = recent.iter().map(|a| a.timestamp.format("%S").to_string()).collect();
    assert_eq!(seconds, vec!["03", "02"]);
    assert!(recent.iter().all(|a| a.campaign_id == "c1"));
}

#[tokio::test(start_paused = true)]
async fn test_recording_activity_invalidates_feed() {
    let store = seeded_store(0);
    let service = service_over(&store, ServiceConfig::default());

    assert!(service.get_recent_activity("c1", 10).await.unwrap().is_empty());
    assert!(service.get_recent_activity("c1", 10).await.unwrap().is_empty());
    assert_eq!(store.inner.fetch_calls(), 1);

    let activity = activity_at("c1", "https://news.example.org/a", 5);
    assert!(service.record_url_activity("user-1", activity).await.unwrap());
    service.flush().await;

    let recent = service.get_recent_activity("c1", 10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].domain, "news.example.org");
    assert_eq!(store.inner.fetch_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_user_and_logout() {
    let store = seeded_store(0);
    let service = service_over(&store, ServiceConfig::default());

    service.get_campaign_stats("user-1").await.unwrap();
    service.get_user_campaigns("user-1").await.unwrap();
    service.get_campaign_stats("user-2").await.unwrap();

    assert_eq!(service.invalidate_user("user-1"), 2);
    assert_eq!(service.stats().cache.entry_count, 1);

    assert!(service.check_rate_limit("user-2", "content"));
    assert_eq!(service.stats().rate_limit_windows, 1);

    service.logout("user-2");
    let stats = service.stats();
    assert_eq!(stats.cache.entry_count, 0);
    assert_eq!(stats.rate_limit_windows, 0);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_reports_removals() {
    let store = seeded_store(0);
    let service = service_over(&store, ServiceConfig::default());

    service.get_campaign_stats("user-1").await.unwrap();
    service.get_user_campaigns("user-1").await.unwrap();
    assert!(service.check_rate_limit("user-1", "content"));

    // stats live 60s, campaigns 300s, idle windows 300s
    tokio::time::advance(Duration::from_secs(120)).await;
    let report = service.sweep();
    assert_eq!(report.expired_entries, 1);
    assert_eq!(report.idle_windows, 0);

    tokio::time::advance(Duration::from_secs(240)).await;
    let report = service.sweep();
    assert_eq!(report.expired_entries, 1);
    assert_eq!(report.idle_windows, 1);
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_task_sweeps() {
    let store = seeded_store(0);
    let mut config = ServiceConfig::default();
    config.rate_limits.sweep_interval_ms = 10_000;
    let service = Arc::new(service_over(&store, config));

    let handle = service.spawn_maintenance();
    service.get_campaign_stats("user-1").await.unwrap();
    assert_eq!(service.stats().cache.entry_count, 1);

    tokio::time::sleep(Duration::from_secs(75)).await;
    assert_eq!(service.stats().cache.entry_count, 0);

    drop(service);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(handle.is_finished());
}

#[tokio::test(start_paused = true)]
async fn test_dispose_flushes_and_clears() {
    let store = seeded_store(0);
    let service = service_over(&store, ServiceConfig::default());

    service.get_campaign_stats("user-1").await.unwrap();
    let activity = activity_at("c1", "https://example.com/", 0);
    assert!(service.record_url_activity("user-1", activity).await.unwrap());
    let update = AnalyticsUpdate::new("c1", "user-1").links_built(5);
    assert!(service.update_campaign_analytics("user-1", update).await.unwrap());

    service.dispose().await;

    assert_eq!(store.inner.rows("url_activity").len(), 1);
    assert_eq!(store.inner.rows("campaigns")[0]["links_built"], 5);

    let stats = service.stats();
    assert_eq!(stats.cache.entry_count, 0);
    assert_eq!(stats.batches.pending_items, 0);
    assert_eq!(stats.batches.total_flushed, 2);
}

#[tokio::test]
async fn test_in_memory_service() {
    let service = ScalableDataService::in_memory(ServiceConfig::default());

    let stats = service.get_campaign_stats("nobody").await.unwrap();
    assert_eq!(stats.total_campaigns, 0);
    assert_eq!(stats.success_rate, 0.0);
    assert_eq!(service.store().name(), "memory");
}

#[test]
fn test_config_from_json() {
    let config = ServiceConfig::from_json(
        r#"{
            "cache": { "max_entries": 250 },
            "batch": { "batch_size": 10, "batch_delay_ms": 250 },
            "rate_limits": { "rules": { "default": { "requests": 5, "window_ms": 1000 } } },
            "stats_ttl_seconds": 15
        }"#,
    )
    .unwrap();

    assert_eq!(config.cache.max_entries, 250);
    assert_eq!(config.cache.default_ttl_seconds, 300);
    assert_eq!(config.batch.batch_delay(), Duration::from_millis(250));
    assert_eq!(config.stats_ttl(), Duration::from_secs(15));
    assert_eq!(config.activity_ttl(), Duration::from_secs(30));
    assert_eq!(config.rate_limits.rule_for("automation").requests, 5);
}

#[test]
fn test_config_load_from_file() {
    let path = std::env::temp_dir().join(format!("scalable-data-{}.json", uuid::Uuid::new_v4()));
    std::fs::write(&path, r#"{ "activity_ttl_seconds": 5 }"#).unwrap();

    let config = ServiceConfig::load(&path).unwrap();
    assert_eq!(config.activity_ttl(), Duration::from_secs(5));
    std::fs::remove_file(&path).unwrap();

    assert!(matches!(ServiceConfig::load(&path), Err(DataError::Io(_))));
    assert!(matches!(
        ServiceConfig::from_json(r#"{ "batch": { "batch_size": 0 } }"#),
        Err(DataError::Config(_))
    ));
}
