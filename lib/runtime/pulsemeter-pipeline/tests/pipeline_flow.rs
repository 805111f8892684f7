use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::json;

use pulsemeter_adapter_storage::{MemoryCache, MemoryStore};
use pulsemeter_adapter_transport::{ChannelTransport, MemoryDeadLetters};
use pulsemeter_domain::{
    AlertEvent, AlertRule, AlertState, HealthStatus, Metric, MetricKey, Operator,
    PulsemeterConfig, TimeRange,
};
use pulsemeter_pipeline::{Pipeline, StartupError};
use pulsemeter_ports::{AlertPublisher, Clock, ManualClock, PortSet};

#[derive(Default)]
struct CollectingPublisher {
    events: Mutex<Vec<AlertEvent>>,
}

#[async_trait]
impl AlertPublisher for CollectingPublisher {
    async fn publish(&self, event: &AlertEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

struct Harness {
    clock: ManualClock,
    transport: Arc<ChannelTransport>,
    store: Arc<MemoryStore>,
    dead_letters: Arc<MemoryDeadLetters>,
    publisher: Arc<CollectingPublisher>,
    pipeline: Pipeline,
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 1).unwrap()
}

fn harness(config: PulsemeterConfig) -> Harness {
    let clock = ManualClock::new(start_time());
    let transport = Arc::new(ChannelTransport::new());
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::with_clock(Arc::new(clock.clone())));
    let dead_letters = Arc::new(MemoryDeadLetters::new());
    let publisher = Arc::new(CollectingPublisher::default());
    let ports = PortSet::new(transport.clone(), store.clone(), cache)
        .with_dead_letters(dead_letters.clone())
        .with_publisher(publisher.clone())
        .with_clock(Arc::new(clock.clone()));
    Harness {
        clock,
        transport,
        store,
        dead_letters,
        publisher,
        pipeline: Pipeline::new(config, ports),
    }
}

fn publish_event(
    transport: &ChannelTransport,
    id: usize,
    at: DateTime<Utc>,
    latency_ms: f64,
    status_code: u16,
) {
    transport
        .publish_json(&json!({
            "event_id": format!("evt-{id}"),
            "occurred_at": at,
            "service_name": "A",
            "endpoint": "/orders",
            "method": "GET",
            "status_code": status_code,
            "latency_ms": latency_ms,
            "trace_id": "abc",
        }))
        .unwrap();
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_outlier_window_end_to_end() {
    let h = harness(PulsemeterConfig::default());
    h.pipeline.start().await.unwrap();

    for i in 0..99 {
        publish_event(&h.transport, i, start_time(), 100.0, 200);
    }
    publish_event(&h.transport, 99, start_time(), 5000.0, 200);
    wait_until("all events acked", || h.transport.acked().len() == 100).await;

    assert_eq!(h.pipeline.tick_now(), 3);
    let key = MetricKey::service("A");
    let mut latest = None;
    for _ in 0..500 {
        latest = h.pipeline.get_latest(&key).await.unwrap();
        if latest.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let snapshot = latest.expect("snapshot reached the cache");
    assert_eq!(snapshot.total_requests, 100);
    assert_eq!(snapshot.p99_latency_ms, 5000.0);
    assert_eq!(snapshot.p95_latency_ms, 100.0);
    assert!((snapshot.avg_latency_ms - 149.0).abs() < 1e-9);
    assert_eq!(snapshot.error_rate, 0.0);
    assert!((snapshot.qps * 60.0 - 100.0).abs() < 1e-9);

    h.pipeline.shutdown().await;
    let rows = h.store.rows();
    assert!(rows.iter().any(|row| row.key == key && row.total_requests == 100));
    assert!(rows.iter().any(|row| row.key == MetricKey::endpoint("A", "/orders")));
    let overall = h
        .pipeline
        .get_latest(&MetricKey::overall())
        .await
        .unwrap()
        .expect("overall rollup persisted");
    assert_eq!(overall.total_requests, 100);
    assert_eq!(overall.p99_latency_ms, 5000.0);

    let history = h
        .pipeline
        .get_history(
            &key,
            TimeRange::new(start_time() - chrono::Duration::hours(1), start_time() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();
    assert!(!history.is_empty());
    assert!(history.windows(2).all(|pair| pair[0].window_end <= pair[1].window_end));

    let stats = h.pipeline.stats();
    assert_eq!(stats.ingress.accepted, 100);
    assert_eq!(stats.aggregator.folded, 100);
    assert_eq!(stats.persistence.rows_lost, 0);
}

#[tokio::test]
async fn test_malformed_payload_is_dead_lettered() {
    let h = harness(PulsemeterConfig::default());
    h.pipeline.start().await.unwrap();

    let bad = h.transport.publish("{\"event_id\": \"x\"");
    let missing = h.transport.publish_json(&json!({"event_id": "y", "service_name": "A"})).unwrap();
    publish_event(&h.transport, 1, start_time(), 10.0, 200);

    wait_until("three acks", || h.transport.acked().len() == 3).await;
    assert_eq!(h.dead_letters.len(), 2);
    let acked = h.transport.acked();
    assert!(acked.contains(&bad));
    assert!(acked.contains(&missing));
    assert_eq!(h.pipeline.stats().ingress.dead_lettered, 2);
    assert_eq!(h.pipeline.aggregator().stats().folded, 1);

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_alert_triggers_resolves_and_retriggers() {
    let mut config = PulsemeterConfig::default();
    config.alerts.rules = vec![AlertRule::new(
        "slow",
        Metric::AvgLatencyMs,
        Operator::Gt,
        500.0,
    )];
    let h = harness(config);
    h.pipeline.start().await.unwrap();

    publish_event(&h.transport, 1, h.clock.now(), 600.0, 200);
    wait_until("first ack", || h.transport.acked().len() == 1).await;
    h.pipeline.tick_now();
    wait_until("alert triggered", || h.pipeline.get_active_alerts().len() == 3).await;
    let first_ids: Vec<String> = h
        .pipeline
        .get_active_alerts()
        .into_iter()
        .map(|alert| alert.alert_id)
        .collect();

    // Let the window drain; the idle keys retire and close their alerts.
    h.clock.advance(Duration::from_secs(65));
    h.pipeline.tick_now();
    wait_until("alerts resolved", || h.pipeline.get_active_alerts().is_empty()).await;

    publish_event(&h.transport, 2, h.clock.now(), 700.0, 200);
    wait_until("second ack", || h.transport.acked().len() == 2).await;
    h.pipeline.tick_now();
    wait_until("alert re-triggered", || h.pipeline.get_active_alerts().len() == 3).await;
    for alert in h.pipeline.get_active_alerts() {
        assert!(!first_ids.contains(&alert.alert_id));
        assert_eq!(alert.state, AlertState::Triggered);
    }

    h.pipeline.shutdown().await;
    let published = h.publisher.events.lock().clone();
    let triggered = published
        .iter()
        .filter(|event| event.state == AlertState::Triggered)
        .count();
    let resolved = published
        .iter()
        .filter(|event| event.state == AlertState::Resolved)
        .count();
    assert_eq!(triggered, 6);
    assert_eq!(resolved, 3);
    assert_eq!(h.pipeline.stats().alerts.active, 3);
}

#[tokio::test]
async fn test_final_tick_supersedes_same_window_row() {
    let h = harness(PulsemeterConfig::default());
    h.pipeline.start().await.unwrap();

    publish_event(&h.transport, 1, start_time(), 10.0, 200);
    wait_until("first ack", || h.transport.acked().len() == 1).await;
    h.pipeline.tick_now();

    h.clock.advance(Duration::from_millis(900));
    publish_event(&h.transport, 2, h.clock.now(), 900.0, 200);
    wait_until("second ack", || h.transport.acked().len() == 2).await;
    h.pipeline.shutdown().await;

    let window_end = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 5).unwrap();
    for key in [
        MetricKey::overall(),
        MetricKey::service("A"),
        MetricKey::endpoint("A", "/orders"),
    ] {
        let rows: Vec<_> = h
            .store
            .rows()
            .into_iter()
            .filter(|row| row.key == key && row.window_end == window_end)
            .collect();
        assert_eq!(rows.len(), 1, "{key}");
        assert_eq!(rows[0].total_requests, 2, "{key}");
    }
    let latest = h
        .pipeline
        .get_latest(&MetricKey::service("A"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.total_requests, 2);
}

#[tokio::test]
async fn test_unreachable_transport_is_fatal_at_startup() {
    let mut config = PulsemeterConfig::default();
    config.ingress.startup_connect_attempts = 2;
    config.ingress.reconnect_base_ms = 1;
    config.ingress.reconnect_cap_ms = 2;
    let h = harness(config);
    h.transport.fail_next_connects(5);

    let result = h.pipeline.start().await;
    assert!(matches!(result, Err(StartupError::TransportUnreachable(_))));
    assert!(!h.pipeline.is_running());
    assert!(matches!(
        h.pipeline.health().get("ingress"),
        Some(HealthStatus::Unhealthy(_))
    ));
    assert!(matches!(
        h.pipeline.health().overall(),
        HealthStatus::Unhealthy(_)
    ));
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let h = harness(PulsemeterConfig::default());
    h.pipeline.start().await.unwrap();
    assert!(matches!(
        h.pipeline.start().await,
        Err(StartupError::AlreadyStarted)
    ));
    assert!(h.pipeline.health().overall().is_healthy());
    h.pipeline.shutdown().await;
    assert!(!h.pipeline.is_running());
}

#[tokio::test]
async fn test_redelivered_events_are_suppressed_when_dedup_enabled() {
    let mut config = PulsemeterConfig::default();
    config.ingress.dedup_capacity = 128;
    let h = harness(config);
    h.pipeline.start().await.unwrap();

    publish_event(&h.transport, 1, start_time(), 10.0, 500);
    publish_event(&h.transport, 1, start_time(), 10.0, 500);
    wait_until("both acked", || h.transport.acked().len() == 2).await;

    assert_eq!(h.pipeline.stats().ingress.duplicates_suppressed, 1);
    let snapshots = h.pipeline.aggregator().snapshot_all();
    let service = snapshots
        .iter()
        .find(|s| s.key == MetricKey::service("A"))
        .unwrap();
    assert_eq!(service.total_requests, 1);
    assert_eq!(service.error_rate, 1.0);

    h.pipeline.shutdown().await;
}
