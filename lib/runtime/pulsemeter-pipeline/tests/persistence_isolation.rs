use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;
use tokio::time::Instant;

use pulsemeter_adapter_storage::{MemoryCache, MemoryStore, SqliteStore};
use pulsemeter_domain::{MetricKey, MetricsSnapshot, PersistenceConfig, TimeRange};
use pulsemeter_pipeline::PersistenceGateway;
use pulsemeter_ports::{DurableStore, FastCache, SystemClock};

struct BrokenStore;

#[async_trait]
impl DurableStore for BrokenStore {
    async fn write_batch(&self, _batch: &[MetricsSnapshot]) -> Result<()> {
        bail!("database is locked")
    }

    async fn history(
        &self,
        _key: &MetricKey,
        _range: TimeRange,
        _limit: usize,
    ) -> Result<Vec<MetricsSnapshot>> {
        bail!("database is locked")
    }

    async fn latest(&self, _key: &MetricKey) -> Result<Option<MetricsSnapshot>> {
        bail!("database is locked")
    }

    async fn prune_before(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        bail!("database is locked")
    }
}

/// Accepts writes and never completes them.
struct HangingStore;

#[async_trait]
impl DurableStore for HangingStore {
    async fn write_batch(&self, _batch: &[MetricsSnapshot]) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn history(
        &self,
        _key: &MetricKey,
        _range: TimeRange,
        _limit: usize,
    ) -> Result<Vec<MetricsSnapshot>> {
        Ok(Vec::new())
    }

    async fn latest(&self, _key: &MetricKey) -> Result<Option<MetricsSnapshot>> {
        Ok(None)
    }

    async fn prune_before(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }
}

/// Never answers, like a cache behind a dead network link.
struct HangingCache;

#[async_trait]
impl FastCache for HangingCache {
    async fn put(&self, _key: &str, _value: String, _ttl: Duration) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        bail!("cache unreachable")
    }
}

fn snapshot(service: &str, secs: i64) -> MetricsSnapshot {
    let at = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs);
    let mut snapshot = MetricsSnapshot::empty(MetricKey::service(service), at);
    snapshot.total_requests = 1;
    snapshot
}

fn gateway(durable: Arc<dyn DurableStore>, cache: Arc<dyn FastCache>) -> Arc<PersistenceGateway> {
    Arc::new(PersistenceGateway::new(
        durable,
        cache,
        Arc::new(SystemClock),
        PersistenceConfig::default(),
    ))
}

#[tokio::test(start_paused = true)]
async fn test_cache_still_written_when_durable_store_fails() {
    let cache = Arc::new(MemoryCache::new());
    let gateway = gateway(Arc::new(BrokenStore), cache.clone());
    let (_stop, stop_rx) = watch::channel(false);
    gateway.start(stop_rx);

    for (i, service) in ["a", "b", "c"].into_iter().enumerate() {
        gateway.persist(snapshot(service, i as i64));
    }
    gateway.force_flush();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(cache.len(), 3);
    let stats = gateway.stats();
    assert_eq!(stats.cache_writes, 3);
    assert_eq!(stats.batches_lost, 1);
    assert_eq!(stats.rows_lost, 3);
    assert!(gateway.cache_health().is_healthy());
    assert!(!gateway.durable_health().is_healthy());
}

#[tokio::test(start_paused = true)]
async fn test_durable_store_still_written_when_cache_hangs() {
    let store = Arc::new(MemoryStore::new());
    let gateway = gateway(store.clone(), Arc::new(HangingCache));
    let (_stop, stop_rx) = watch::channel(false);
    gateway.start(stop_rx);

    for i in 0..5 {
        gateway.persist(snapshot("a", i));
    }
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(store.rows().len(), 5);
    assert_eq!(gateway.stats().cache_writes, 0);

    let latest = gateway
        .get_latest(&MetricKey::service("a"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest, snapshot("a", 4));
}

#[tokio::test(start_paused = true)]
async fn test_hundred_snapshots_make_one_batch() {
    let store = Arc::new(MemoryStore::new());
    let gateway = gateway(store.clone(), Arc::new(MemoryCache::new()));
    let (_stop, stop_rx) = watch::channel(false);
    gateway.start(stop_rx);

    for i in 0..100 {
        gateway.persist(snapshot(&format!("svc-{i}"), i));
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(store.batch_sizes(), vec![100]);
}

#[tokio::test]
async fn test_sqlite_history_through_gateway() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("metrics.db")).unwrap());
    let gateway = gateway(store.clone(), Arc::new(MemoryCache::new()));
    let (_stop, stop_rx) = watch::channel(false);
    gateway.start(stop_rx);

    for i in 0..12 {
        gateway.persist(snapshot("a", i * 5));
    }
    gateway.shutdown(Duration::from_secs(10)).await;

    let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
    let history = gateway
        .get_history_limited(
            &MetricKey::service("a"),
            TimeRange::new(start, start + chrono::Duration::minutes(5)),
            4,
        )
        .await
        .unwrap();
    let offsets: Vec<i64> = history
        .iter()
        .map(|s| (s.window_end - start).num_seconds())
        .collect();
    assert_eq!(offsets, vec![40, 45, 50, 55]);
    assert_eq!(store.row_count().await.unwrap(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_gives_up_on_hanging_cache_after_grace() {
    let store = Arc::new(MemoryStore::new());
    let gateway = gateway(store.clone(), Arc::new(HangingCache));
    let (_stop, stop_rx) = watch::channel(false);
    gateway.start(stop_rx);

    for i in 0..5 {
        gateway.persist(snapshot(&format!("svc-{i}"), i));
    }
    let grace = Duration::from_secs(2);
    let started = Instant::now();
    gateway.shutdown(grace).await;
    let waited = started.elapsed();

    assert!(waited >= grace && waited < grace + Duration::from_secs(1), "{waited:?}");
    assert_eq!(store.rows().len(), 5);
    let stats = gateway.stats();
    assert_eq!(stats.rows_written, 5);
    assert_eq!(stats.rows_lost, 0);
    assert_eq!(stats.cache_writes, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_counts_rows_abandoned_after_grace() {
    let cache = Arc::new(MemoryCache::new());
    let gateway = gateway(Arc::new(HangingStore), cache.clone());
    let (_stop, stop_rx) = watch::channel(false);
    gateway.start(stop_rx);

    // One full batch gets stuck in the store, the rest stays queued.
    for i in 0..150 {
        gateway.persist(snapshot(&format!("svc-{i}"), i));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let grace = Duration::from_secs(1);
    let started = Instant::now();
    gateway.shutdown(grace).await;

    assert!(started.elapsed() < grace + Duration::from_secs(1));
    let stats = gateway.stats();
    assert_eq!(stats.rows_written, 0);
    assert_eq!(stats.rows_lost, 150);
    assert_eq!(stats.durable_pending, 0);
    assert_eq!(cache.len(), 150);
}
