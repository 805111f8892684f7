//! Dual-sink persistence of snapshots.
//!
//! `persist` only enqueues. One background task batches into the durable
//! store, another overwrites the fast-read cache; each has its own queue,
//! retry budget and health, so a stalled sink never holds up the other.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pulsemeter_domain::{HealthStatus, MetricKey, MetricsSnapshot, PersistenceConfig, TimeRange};
use pulsemeter_ports::{Clock, DurableStore, FastCache};

use crate::backoff::Backoff;
use crate::queue::DropOldestQueue;

const RETENTION_INTERVAL: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceStats {
    pub enqueued: u64,
    pub durable_queue_drops: u64,
    pub cache_queue_drops: u64,
    pub durable_pending: u64,
    pub batches_written: u64,
    pub rows_written: u64,
    pub failed_attempts: u64,
    pub batches_lost: u64,
    pub rows_lost: u64,
    pub cache_writes: u64,
    pub cache_failures: u64,
    pub rows_pruned: u64,
    pub last_write: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    batches_written: AtomicU64,
    rows_written: AtomicU64,
    failed_attempts: AtomicU64,
    batches_lost: AtomicU64,
    rows_lost: AtomicU64,
    cache_writes: AtomicU64,
    cache_failures: AtomicU64,
    rows_pruned: AtomicU64,
    /// Rows of the batch the durable flusher is writing right now.
    in_flight: AtomicU64,
}

pub struct PersistenceGateway {
    durable: Arc<dyn DurableStore>,
    cache: Arc<dyn FastCache>,
    clock: Arc<dyn Clock>,
    config: PersistenceConfig,
    durable_queue: DropOldestQueue<MetricsSnapshot>,
    cache_queue: DropOldestQueue<MetricsSnapshot>,
    flush_now: Notify,
    counters: Counters,
    last_write: Mutex<Option<DateTime<Utc>>>,
    durable_health: Mutex<HealthStatus>,
    cache_health: Mutex<HealthStatus>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    retention: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceGateway {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        cache: Arc<dyn FastCache>,
        clock: Arc<dyn Clock>,
        config: PersistenceConfig,
    ) -> Self {
        Self {
            durable_queue: DropOldestQueue::new(config.queue_capacity),
            cache_queue: DropOldestQueue::new(config.queue_capacity),
            durable,
            cache,
            clock,
            config,
            flush_now: Notify::new(),
            counters: Counters::default(),
            last_write: Mutex::new(None),
            durable_health: Mutex::new(HealthStatus::Healthy),
            cache_health: Mutex::new(HealthStatus::Healthy),
            tasks: Mutex::new(Vec::new()),
            retention: Mutex::new(None),
        }
    }

    /// Start the durable flusher, the cache writer and the retention loop.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(self).run_durable()));
        tasks.push(tokio::spawn(Arc::clone(self).run_cache()));
        *self.retention.lock() = Some(tokio::spawn(Arc::clone(self).run_retention(shutdown)));
        info!(
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout_ms,
            "persistence started"
        );
    }

    /// Hand a snapshot to both sinks without waiting on either.
    pub fn persist(&self, snapshot: MetricsSnapshot) {
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if self.cache_queue.push(snapshot.clone()).is_some() {
            debug!("cache queue full; dropped oldest snapshot");
        }
        if self.durable_queue.push(snapshot).is_some() {
            warn!("durable queue full; dropped oldest snapshot");
        }
    }

    /// Ask the durable flusher to write its partial batch now.
    pub fn force_flush(&self) {
        self.flush_now.notify_one();
    }

    /// Stop accepting work, flush what is queued, and wait up to `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.durable_queue.close();
        self.cache_queue.close();
        self.force_flush();
        if let Some(retention) = self.retention.lock().take() {
            retention.abort();
        }

        let mut tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let drained = tokio::time::timeout(grace, async {
            for task in tasks.iter_mut() {
                if let Err(err) = task.await {
                    error!("persistence task failed: {}", err);
                }
            }
        })
        .await;

        if drained.is_err() {
            for task in &tasks {
                task.abort();
            }
            let abandoned = self.durable_queue.drain().len() as u64
                + self.counters.in_flight.swap(0, Ordering::Relaxed);
            self.counters.rows_lost.fetch_add(abandoned, Ordering::Relaxed);
            warn!(abandoned, ?grace, "persistence drain exceeded grace period");
        } else {
            info!("persistence drained");
        }
    }

    async fn run_durable(self: Arc<Self>) {
        let batch_size = self.config.batch_size;
        while let Some(first) = self.durable_queue.pop().await {
            let mut batch = Vec::with_capacity(batch_size);
            batch.push(first);
            let deadline = tokio::time::Instant::now() + self.config.batch_timeout();

            while batch.len() < batch_size {
                // Queued items win over the deadline and a forced flush.
                tokio::select! {
                    biased;
                    next = self.durable_queue.pop() => match next {
                        Some(snapshot) => batch.push(snapshot),
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = self.flush_now.notified() => break,
                }
            }
            self.write_with_retry(batch).await;
        }
        debug!("durable flusher stopped");
    }

    fn retry_backoff(&self) -> Backoff {
        let base = self.config.retry_base();
        Backoff::new(base, base.saturating_mul(16))
    }

    async fn write_with_retry(&self, batch: Vec<MetricsSnapshot>) {
        let mut backoff = self.retry_backoff();
        let max_attempts = self.config.max_attempts;
        self.counters
            .in_flight
            .store(batch.len() as u64, Ordering::Relaxed);
        for attempt in 1..=max_attempts {
            match self.durable.write_batch(&batch).await {
                Ok(()) => {
                    self.counters.in_flight.store(0, Ordering::Relaxed);
                    self.counters.batches_written.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .rows_written
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    *self.last_write.lock() = Some(self.clock.now());
                    *self.durable_health.lock() = HealthStatus::Healthy;
                    debug!(rows = batch.len(), attempt, "durable batch written");
                    return;
                }
                Err(err) => {
                    self.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    if attempt < max_attempts {
                        let delay = backoff.next_delay();
                        warn!(attempt, ?delay, "durable write failed: {err:#}");
                        tokio::time::sleep(delay).await;
                    } else {
                        self.counters.batches_lost.fetch_add(1, Ordering::Relaxed);
                        self.counters
                            .rows_lost
                            .fetch_add(batch.len() as u64, Ordering::Relaxed);
                        self.counters.in_flight.store(0, Ordering::Relaxed);
                        *self.durable_health.lock() =
                            HealthStatus::Degraded(format!("dropped batch: {err:#}"));
                        error!(
                            rows = batch.len(),
                            attempts = max_attempts,
                            "durable write gave up, batch dropped: {err:#}"
                        );
                    }
                }
            }
        }
    }

    async fn run_cache(self: Arc<Self>) {
        while let Some(first) = self.cache_queue.pop().await {
            // Only the newest value per key matters to an overwrite cache.
            let mut newest: BTreeMap<MetricKey, MetricsSnapshot> = BTreeMap::new();
            for snapshot in std::iter::once(first).chain(self.cache_queue.drain()) {
                match newest.get(&snapshot.key) {
                    Some(held) if held.window_end > snapshot.window_end => {}
                    _ => {
                        newest.insert(snapshot.key.clone(), snapshot);
                    }
                }
            }
            for snapshot in newest.into_values() {
                self.put_with_retry(&snapshot).await;
            }
        }
        debug!("cache writer stopped");
    }

    async fn put_with_retry(&self, snapshot: &MetricsSnapshot) {
        let value = match serde_json::to_string(snapshot) {
            Ok(value) => value,
            Err(err) => {
                self.counters.cache_failures.fetch_add(1, Ordering::Relaxed);
                error!(key = %snapshot.key, "failed to encode snapshot: {}", err);
                return;
            }
        };
        let cache_key = snapshot.key.cache_key();
        let mut backoff = self.retry_backoff();
        let max_attempts = self.config.max_attempts;
        for attempt in 1..=max_attempts {
            match self
                .cache
                .put(&cache_key, value.clone(), self.config.cache_ttl())
                .await
            {
                Ok(()) => {
                    self.counters.cache_writes.fetch_add(1, Ordering::Relaxed);
                    *self.cache_health.lock() = HealthStatus::Healthy;
                    return;
                }
                Err(err) if attempt < max_attempts => {
                    let delay = backoff.next_delay();
                    debug!(attempt, ?delay, key = %cache_key, "cache write failed: {err:#}");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.counters.cache_failures.fetch_add(1, Ordering::Relaxed);
                    *self.cache_health.lock() =
                        HealthStatus::Degraded(format!("cache writes failing: {err:#}"));
                    warn!(key = %cache_key, "cache write gave up: {err:#}");
                }
            }
        }
    }

    async fn run_retention(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.config.retention_days == 0 {
            return;
        }
        let mut interval = tokio::time::interval(RETENTION_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.prune_expired().await {
                        warn!("retention prune failed: {:#}", e);
                    }
                }
            }
        }
    }

    /// Delete durable rows older than the retention period.
    pub async fn prune_expired(&self) -> Result<u64> {
        if self.config.retention_days == 0 {
            return Ok(0);
        }
        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(self.config.retention_days));
        let removed = self
            .durable
            .prune_before(cutoff)
            .await
            .context("failed to prune expired snapshots")?;
        if removed > 0 {
            self.counters.rows_pruned.fetch_add(removed, Ordering::Relaxed);
            info!(removed, %cutoff, "pruned expired snapshots");
        }
        Ok(removed)
    }

    /// Current value for a key: the cache first, the durable store on a miss.
    pub async fn get_latest(&self, key: &MetricKey) -> Result<Option<MetricsSnapshot>> {
        match self.cache.get(&key.cache_key()).await {
            Ok(Some(raw)) => match serde_json::from_str::<MetricsSnapshot>(&raw) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(err) => warn!(%key, "discarding undecodable cache entry: {}", err),
            },
            Ok(None) => {}
            Err(err) => warn!(%key, "cache read failed, using durable store: {err:#}"),
        }
        self.durable
            .latest(key)
            .await
            .with_context(|| format!("failed to read latest snapshot for {key}"))
    }

    /// Snapshots in `range`, oldest first, capped at the configured limit.
    pub async fn get_history(
        &self,
        key: &MetricKey,
        range: TimeRange,
    ) -> Result<Vec<MetricsSnapshot>> {
        self.get_history_limited(key, range, self.config.history_limit)
            .await
    }

    pub async fn get_history_limited(
        &self,
        key: &MetricKey,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<MetricsSnapshot>> {
        let limit = limit.min(self.config.history_limit);
        self.durable
            .history(key, range, limit)
            .await
            .with_context(|| format!("failed to read history for {key}"))
    }

    pub fn durable_health(&self) -> HealthStatus {
        self.durable_health.lock().clone()
    }

    pub fn cache_health(&self) -> HealthStatus {
        self.cache_health.lock().clone()
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            durable_queue_drops: self.durable_queue.dropped(),
            cache_queue_drops: self.cache_queue.dropped(),
            durable_pending: self.durable_queue.len() as u64,
            batches_written: self.counters.batches_written.load(Ordering::Relaxed),
            rows_written: self.counters.rows_written.load(Ordering::Relaxed),
            failed_attempts: self.counters.failed_attempts.load(Ordering::Relaxed),
            batches_lost: self.counters.batches_lost.load(Ordering::Relaxed),
            rows_lost: self.counters.rows_lost.load(Ordering::Relaxed),
            cache_writes: self.counters.cache_writes.load(Ordering::Relaxed),
            cache_failures: self.counters.cache_failures.load(Ordering::Relaxed),
            rows_pruned: self.counters.rows_pruned.load(Ordering::Relaxed),
            last_write: *self.last_write.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pulsemeter_ports::ManualClock;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<Vec<MetricsSnapshot>>>,
        fail: std::sync::atomic::AtomicBool,
        attempts: AtomicU64,
    }

    #[async_trait]
    impl DurableStore for RecordingStore {
        async fn write_batch(&self, batch: &[MetricsSnapshot]) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                bail!("disk full");
            }
            self.batches.lock().push(batch.to_vec());
            Ok(())
        }

        async fn history(
            &self,
            key: &MetricKey,
            range: TimeRange,
            limit: usize,
        ) -> Result<Vec<MetricsSnapshot>> {
            Ok(self
                .batches
                .lock()
                .iter()
                .flatten()
                .filter(|s| &s.key == key && range.contains(s.window_end))
                .take(limit)
                .cloned()
                .collect())
        }

        async fn latest(&self, key: &MetricKey) -> Result<Option<MetricsSnapshot>> {
            Ok(self
                .batches
                .lock()
                .iter()
                .flatten()
                .filter(|s| &s.key == key)
                .max_by_key(|s| s.window_end)
                .cloned())
        }

        async fn prune_before(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct RecordingCache {
        entries: Mutex<HashMap<String, String>>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl FastCache for RecordingCache {
        async fn put(&self, key: &str, value: String, _ttl: Duration) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("cache unreachable");
            }
            self.entries.lock().insert(key.to_string(), value);
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("cache unreachable");
            }
            Ok(self.entries.lock().get(key).cloned())
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn snapshot(service: &str, secs: i64) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::empty(MetricKey::service(service), at(secs));
        snapshot.total_requests = secs as u64;
        snapshot
    }

    fn gateway(
        store: Arc<RecordingStore>,
        cache: Arc<RecordingCache>,
        config: PersistenceConfig,
    ) -> Arc<PersistenceGateway> {
        Arc::new(PersistenceGateway::new(
            store,
            cache,
            Arc::new(ManualClock::new(at(0))),
            config,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_is_one_write() {
        let store = Arc::new(RecordingStore::default());
        let cache = Arc::new(RecordingCache::default());
        let gateway = gateway(store.clone(), cache, PersistenceConfig::default());
        let (_tx, rx) = watch::channel(false);
        gateway.start(rx);

        for i in 0..100 {
            gateway.persist(snapshot(&format!("svc-{i}"), i));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let batches = store.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_on_timeout() {
        let store = Arc::new(RecordingStore::default());
        let cache = Arc::new(RecordingCache::default());
        let gateway = gateway(store.clone(), cache, PersistenceConfig::default());
        let (_tx, rx) = watch::channel(false);
        gateway.start(rx);

        gateway.persist(snapshot("a", 1));
        gateway.persist(snapshot("a", 2));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.batches.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.batches.lock().len(), 1);
        assert_eq!(store.batches.lock()[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_drop_batch_and_count_loss() {
        let store = Arc::new(RecordingStore::default());
        store.fail.store(true, Ordering::SeqCst);
        let cache = Arc::new(RecordingCache::default());
        let gateway = gateway(store.clone(), cache, PersistenceConfig::default());
        let (_tx, rx) = watch::channel(false);
        gateway.start(rx);

        gateway.persist(snapshot("a", 1));
        gateway.force_flush();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let stats = gateway.stats();
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(stats.failed_attempts, 3);
        assert_eq!(stats.batches_lost, 1);
        assert_eq!(stats.rows_lost, 1);
        assert!(matches!(gateway.durable_health(), HealthStatus::Degraded(_)));
        assert_eq!(stats.cache_writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_keeps_newest_per_key() {
        let store = Arc::new(RecordingStore::default());
        let cache = Arc::new(RecordingCache::default());
        let gateway = gateway(store, cache.clone(), PersistenceConfig::default());
        let (_tx, rx) = watch::channel(false);
        gateway.start(rx);

        gateway.persist(snapshot("a", 10));
        gateway.persist(snapshot("a", 15));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let latest = gateway
            .get_latest(&MetricKey::service("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.window_end, at(15));
        assert!(cache.entries.lock().contains_key("metrics:a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_falls_back_to_durable_store() {
        let store = Arc::new(RecordingStore::default());
        let cache = Arc::new(RecordingCache::default());
        cache.fail.store(true, Ordering::SeqCst);
        let gateway = gateway(store.clone(), cache, PersistenceConfig::default());
        let (_tx, rx) = watch::channel(false);
        gateway.start(rx);

        gateway.persist(snapshot("a", 5));
        gateway.shutdown(Duration::from_secs(10)).await;

        assert_eq!(store.batches.lock().len(), 1);
        let latest = gateway
            .get_latest(&MetricKey::service("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.window_end, at(5));
        assert!(gateway.stats().cache_failures >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_partial_batch() {
        let store = Arc::new(RecordingStore::default());
        let cache = Arc::new(RecordingCache::default());
        let gateway = gateway(store.clone(), cache, PersistenceConfig::default());
        let (_tx, rx) = watch::channel(false);
        gateway.start(rx);

        for i in 0..7 {
            gateway.persist(snapshot("a", i));
        }
        gateway.shutdown(Duration::from_secs(10)).await;

        let rows: usize = store.batches.lock().iter().map(Vec::len).sum();
        assert_eq!(rows, 7);
        assert_eq!(gateway.stats().rows_lost, 0);
    }
}
