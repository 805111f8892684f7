//! Per-key sliding-window aggregation.
//!
//! Every event is folded three times: into the overall rollup, its
//! service-level key and its service+endpoint key. Keys live in a sharded map, each behind its own
//! mutex, so folds for different keys never contend and a fold and the
//! snapshot tick never race on the same window.

mod window;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pulsemeter_domain::{AggregationConfig, MetricKey, MetricsSnapshot, RequestEvent};
use pulsemeter_ports::Clock;

pub use window::{FoldOutcome, SlidingWindow, SubBucket, WindowShape, percentile};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub folded: u64,
    pub late_dropped: u64,
    pub future_clamped: u64,
    pub samples_evicted: u64,
    pub keys_evicted: u64,
    pub active_keys: u64,
}

#[derive(Debug, Default)]
struct Counters {
    folded: AtomicU64,
    late_dropped: AtomicU64,
    future_clamped: AtomicU64,
    samples_evicted: AtomicU64,
    keys_evicted: AtomicU64,
}

struct KeyWindow {
    window: SlidingWindow,
    /// Set once the key has been removed from the map; folders must re-resolve.
    retired: bool,
}

/// Output of one aggregation tick.
///
/// `retired` lists, sorted, the keys whose snapshot in this tick was their
/// last: the window emptied and the key was evicted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tick {
    pub snapshots: Vec<MetricsSnapshot>,
    pub retired: Vec<MetricKey>,
}

impl Tick {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn is_retired(&self, key: &MetricKey) -> bool {
        self.retired.binary_search(key).is_ok()
    }
}

pub struct WindowAggregator {
    shape: WindowShape,
    windows: DashMap<MetricKey, Arc<Mutex<KeyWindow>>>,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl WindowAggregator {
    pub fn new(config: &AggregationConfig, clock: Arc<dyn Clock>) -> Self {
        let shape = WindowShape {
            bucket_ms: (config.bucket_secs * 1000) as i64,
            capacity: config.bucket_count(),
            sample_cap: config.sample_cap,
        };
        Self::with_shape(shape, clock)
    }

    pub fn with_shape(shape: WindowShape, clock: Arc<dyn Clock>) -> Self {
        Self {
            shape,
            windows: DashMap::new(),
            clock,
            counters: Counters::default(),
        }
    }

    pub fn shape(&self) -> &WindowShape {
        &self.shape
    }

    /// Fold one event into its service and endpoint windows.
    pub fn fold(&self, event: &RequestEvent) -> FoldOutcome {
        let current = self.shape.index_of(self.clock.now());
        let index = self.shape.index_of(event.occurred_at);
        if index < self.shape.oldest_resident(current) {
            self.counters.late_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(event_id = %event.event_id, "dropping late event");
            return FoldOutcome::Late;
        }

        let service_key = MetricKey::service(event.service_name.clone());
        let endpoint_key = MetricKey::endpoint(event.service_name.clone(), event.endpoint.clone());
        let outcome = self.fold_into(service_key, event, current);
        self.fold_into(endpoint_key, event, current);
        self.fold_into(MetricKey::overall(), event, current);

        match outcome {
            FoldOutcome::Accepted => {
                self.counters.folded.fetch_add(1, Ordering::Relaxed);
            }
            FoldOutcome::Clamped => {
                self.counters.folded.fetch_add(1, Ordering::Relaxed);
                self.counters.future_clamped.fetch_add(1, Ordering::Relaxed);
            }
            FoldOutcome::Late => {
                self.counters.late_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    fn fold_into(&self, key: MetricKey, event: &RequestEvent, current: i64) -> FoldOutcome {
        loop {
            let slot = self
                .windows
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(KeyWindow {
                        window: SlidingWindow::new(self.shape),
                        retired: false,
                    }))
                })
                .clone();

            let mut guard = slot.lock();
            if guard.retired {
                continue;
            }
            let (outcome, evicted) = guard.window.fold(event, current);
            if evicted {
                self.counters.samples_evicted.fetch_add(1, Ordering::Relaxed);
            }
            return outcome;
        }
    }

    /// Summarize every resident key at the current tick.
    ///
    /// Calling this again without new folds in the same bucket returns equal
    /// snapshots. A key whose window has emptied yields one zero-count
    /// snapshot and is then evicted.
    pub fn snapshot_all(&self) -> Vec<MetricsSnapshot> {
        self.tick().snapshots
    }

    /// Like [`snapshot_all`](Self::snapshot_all), also naming evicted keys.
    pub fn tick(&self) -> Tick {
        let current = self.shape.index_of(self.clock.now());
        let slots: Vec<(MetricKey, Arc<Mutex<KeyWindow>>)> = self
            .windows
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut snapshots = Vec::with_capacity(slots.len());
        let mut retired = Vec::new();
        for (key, slot) in slots {
            let mut guard = slot.lock();
            if guard.retired {
                continue;
            }
            // Rotation never moves backwards, so window_end per key is non-decreasing.
            guard.window.rotate(current);
            snapshots.push(guard.window.summarize(&key));

            if guard.window.is_empty() {
                guard.retired = true;
                self.windows.remove(&key);
                self.counters.keys_evicted.fetch_add(1, Ordering::Relaxed);
                debug!(%key, "evicted idle key");
                retired.push(key);
            }
        }
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        retired.sort();
        Tick { snapshots, retired }
    }

    pub fn active_keys(&self) -> usize {
        self.windows.len()
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            folded: self.counters.folded.load(Ordering::Relaxed),
            late_dropped: self.counters.late_dropped.load(Ordering::Relaxed),
            future_clamped: self.counters.future_clamped.load(Ordering::Relaxed),
            samples_evicted: self.counters.samples_evicted.load(Ordering::Relaxed),
            keys_evicted: self.counters.keys_evicted.load(Ordering::Relaxed),
            active_keys: self.windows.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use pulsemeter_ports::ManualClock;
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn aggregator(clock: &ManualClock) -> WindowAggregator {
        WindowAggregator::new(&AggregationConfig::default(), Arc::new(clock.clone()))
    }

    fn event(
        service: &str,
        endpoint: &str,
        at: DateTime<Utc>,
        latency_ms: f64,
        status_code: u16,
    ) -> RequestEvent {
        RequestEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            occurred_at: at,
            service_name: service.into(),
            endpoint: endpoint.into(),
            method: "GET".into(),
            status_code,
            latency_ms,
            request_bytes: None,
            response_bytes: None,
            error_message: None,
            error_type: None,
            trace_id: None,
            client_ip: None,
            user_agent: None,
        }
    }

    #[test]
    fn test_folds_into_service_and_endpoint_keys() {
        let clock = ManualClock::new(start());
        let agg = aggregator(&clock);
        agg.fold(&event("a", "/x", start(), 10.0, 200));
        agg.fold(&event("a", "/y", start(), 30.0, 500));

        let snapshots = agg.snapshot_all();
        let keys: Vec<String> = snapshots.iter().map(|s| s.key.to_string()).collect();
        assert_eq!(keys, vec!["overall", "a", "a:/x", "a:/y"]);

        let service = &snapshots[1];
        assert_eq!(service.total_requests, 2);
        assert_eq!(service.total_errors, 1);
        assert_eq!(service.error_rate, 0.5);
        assert_eq!(service.avg_latency_ms, 20.0);
        assert_eq!(snapshots[3].error_rate, 1.0);
    }

    #[test]
    fn test_overall_rolls_up_every_service() {
        let clock = ManualClock::new(start());
        let agg = aggregator(&clock);
        agg.fold(&event("a", "/x", start(), 10.0, 200));
        agg.fold(&event("b", "/y", start(), 50.0, 503));
        agg.fold(&event("b", "/y", start(), 30.0, 200));

        let snapshots = agg.snapshot_all();
        let overall = snapshots.iter().find(|s| s.key.is_overall()).unwrap();
        assert_eq!(overall.total_requests, 3);
        assert_eq!(overall.total_errors, 1);
        assert!((overall.avg_latency_ms - 30.0).abs() < 1e-9);
        assert!((overall.qps * 60.0 - 3.0).abs() < 1e-9);
        assert_eq!(agg.stats().folded, 3);
    }

    #[test]
    fn test_snapshot_is_idempotent_without_new_folds() {
        let clock = ManualClock::new(start());
        let agg = aggregator(&clock);
        for i in 0..20 {
            agg.fold(&event("a", "/x", start(), i as f64, 200));
        }
        let first = agg.snapshot_all();
        clock.advance(Duration::from_millis(1_500));
        let second = agg.snapshot_all();
        assert_eq!(first, second);
    }

    #[test]
    fn test_late_events_are_dropped_and_counted() {
        let clock = ManualClock::new(start());
        let agg = aggregator(&clock);
        let stale = start() - chrono::Duration::seconds(120);
        assert_eq!(agg.fold(&event("a", "/x", stale, 1.0, 200)), FoldOutcome::Late);
        assert_eq!(agg.active_keys(), 0);
        assert_eq!(agg.stats().late_dropped, 1);
        assert!(agg.snapshot_all().is_empty());
    }

    #[test]
    fn test_idle_key_emits_final_zero_snapshot_then_evicts() {
        let clock = ManualClock::new(start());
        let agg = aggregator(&clock);
        agg.fold(&event("a", "/x", start(), 5.0, 200));
        let first = agg.tick();
        assert_eq!(first.snapshots.len(), 3);
        assert!(first.retired.is_empty());

        clock.advance(Duration::from_secs(65));
        let last = agg.tick();
        assert_eq!(last.snapshots.len(), 3);
        assert!(last.snapshots.iter().all(|s| s.total_requests == 0 && s.qps == 0.0));
        assert_eq!(
            last.retired,
            vec![
                MetricKey::overall(),
                MetricKey::service("a"),
                MetricKey::endpoint("a", "/x"),
            ]
        );
        assert!(last.is_retired(&MetricKey::service("a")));
        assert_eq!(agg.active_keys(), 0);
        assert_eq!(agg.stats().keys_evicted, 3);

        assert!(agg.tick().is_empty());
    }

    #[test]
    fn test_window_end_never_decreases_per_key() {
        let clock = ManualClock::new(start());
        let agg = aggregator(&clock);
        agg.fold(&event("a", "/x", start(), 5.0, 200));
        clock.advance(Duration::from_secs(10));
        let later = agg.snapshot_all();

        clock.set(start());
        let earlier = agg.snapshot_all();
        for snapshot in &earlier {
            let previous = later.iter().find(|s| s.key == snapshot.key).unwrap();
            assert!(snapshot.window_end >= previous.window_end);
        }
    }

    #[test]
    fn test_concurrent_folds_across_keys() {
        let clock = ManualClock::new(start());
        let agg = Arc::new(aggregator(&clock));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let service = format!("svc-{}", worker % 4);
                        agg.fold(&event(&service, "/x", start(), i as f64, 200));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshots = agg.snapshot_all();
        let total: u64 = snapshots
            .iter()
            .filter(|s| !s.key.is_endpoint() && !s.key.is_overall())
            .map(|s| s.total_requests)
            .sum();
        assert_eq!(total, 2_000);
        let overall = snapshots.iter().find(|s| s.key.is_overall()).unwrap();
        assert_eq!(overall.total_requests, 2_000);
        assert_eq!(agg.stats().folded, 2_000);
    }
}
