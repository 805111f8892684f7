//! Pipeline lifecycle: wiring, ordered startup and shutdown, health.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pulsemeter_domain::{
    AlertInstance, HealthSnapshot, HealthStatus, MetricKey, MetricsSnapshot, PulsemeterConfig,
    TimeRange,
};
use pulsemeter_ports::PortSet;

use crate::aggregator::{AggregatorStats, Tick, WindowAggregator};
use crate::alert::{AlertEngine, AlertSummary};
use crate::ingress::{EventIngress, IngressStats, run_fold_worker};
use crate::persistence::{PersistenceGateway, PersistenceStats};
use crate::queue::DropOldestQueue;

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("transport unreachable at startup: {0}")]
    TransportUnreachable(String),
    #[error("pipeline already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub started_at: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub snapshots_emitted: u64,
    pub snapshot_batches_dropped: u64,
    pub ingress: IngressStats,
    pub aggregator: AggregatorStats,
    pub persistence: PersistenceStats,
    pub alerts: AlertSummary,
}

#[derive(Default)]
struct Tasks {
    ingress: Option<JoinHandle<()>>,
    fold_worker: Option<JoinHandle<()>>,
    tick: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
    alert_dispatcher: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
}

struct Signals {
    ingress: watch::Sender<bool>,
    loops: watch::Sender<bool>,
    alerts: watch::Sender<bool>,
}

pub struct Pipeline {
    config: PulsemeterConfig,
    ports: PortSet,
    ingress: Arc<EventIngress>,
    aggregator: Arc<WindowAggregator>,
    persistence: Arc<PersistenceGateway>,
    alerts: Arc<AlertEngine>,
    snapshots: Arc<DropOldestQueue<Tick>>,
    signals: Signals,
    tasks: Mutex<Tasks>,
    running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
    ticks: Arc<AtomicU64>,
    emitted: Arc<AtomicU64>,
}

impl Pipeline {
    pub fn new(config: PulsemeterConfig, ports: PortSet) -> Self {
        let clock = Arc::clone(&ports.clock);
        let ingress = Arc::new(EventIngress::new(
            Arc::clone(&ports.transport),
            Arc::clone(&ports.dead_letters),
            Arc::clone(&clock),
            config.ingress.clone(),
        ));
        let aggregator = Arc::new(WindowAggregator::new(&config.aggregation, Arc::clone(&clock)));
        let persistence = Arc::new(PersistenceGateway::new(
            Arc::clone(&ports.durable),
            Arc::clone(&ports.cache),
            Arc::clone(&clock),
            config.persistence.clone(),
        ));
        let alerts = Arc::new(AlertEngine::new(
            config.effective_rules(),
            &config.alerts,
            clock,
        ));
        let snapshots = Arc::new(DropOldestQueue::new(
            config.aggregation.snapshot_queue_capacity,
        ));
        Self {
            ingress,
            aggregator,
            persistence,
            alerts,
            snapshots,
            signals: Signals {
                ingress: watch::channel(false).0,
                loops: watch::channel(false).0,
                alerts: watch::channel(false).0,
            },
            tasks: Mutex::new(Tasks::default()),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            ticks: Arc::new(AtomicU64::new(0)),
            emitted: Arc::new(AtomicU64::new(0)),
            config,
            ports,
        }
    }

    pub fn aggregator(&self) -> &Arc<WindowAggregator> {
        &self.aggregator
    }

    pub fn persistence(&self) -> &Arc<PersistenceGateway> {
        &self.persistence
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    pub fn ingress(&self) -> &Arc<EventIngress> {
        &self.ingress
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bring components up downstream-first so nothing is folded before
    /// snapshots can flow.
    pub async fn start(&self) -> Result<(), StartupError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(StartupError::AlreadyStarted);
        }

        if let Err(err) = self.ingress.connect_with_retry().await {
            self.running.store(false, Ordering::Release);
            error!("pipeline startup aborted: {err:#}");
            return Err(StartupError::TransportUnreachable(format!("{err:#}")));
        }

        let mut tasks = self.tasks.lock();
        tasks.tick = Some(self.spawn_tick_loop());
        tasks.dispatch = Some(self.spawn_dispatch_loop());
        self.persistence.start(self.signals.loops.subscribe());
        tasks.alert_dispatcher = self
            .alerts
            .spawn_dispatcher(self.ports.publishers.clone(), self.signals.alerts.subscribe());
        tasks.health = Some(self.spawn_health_loop());

        let (tx, rx) = mpsc::channel(self.config.ingress.channel_capacity);
        tasks.fold_worker = Some(tokio::spawn(run_fold_worker(
            Arc::clone(&self.ingress),
            Arc::clone(&self.aggregator),
            rx,
        )));
        tasks.ingress = Some(tokio::spawn(
            Arc::clone(&self.ingress).run(tx, self.signals.ingress.subscribe()),
        ));

        *self.started_at.lock() = Some(self.ports.clock.now());
        info!(
            window_secs = self.config.aggregation.window_secs,
            tick_secs = self.config.aggregation.tick_secs,
            rules = self.alerts.rules().len(),
            "pipeline started"
        );
        Ok(())
    }

    fn spawn_tick_loop(&self) -> JoinHandle<()> {
        let aggregator = Arc::clone(&self.aggregator);
        let alerts = Arc::clone(&self.alerts);
        let snapshots = Arc::clone(&self.snapshots);
        let ticks = Arc::clone(&self.ticks);
        let emitted = Arc::clone(&self.emitted);
        let mut stop = self.signals.loops.subscribe();
        let period = self.config.aggregation.tick();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = interval.tick() => {
                        emit(&aggregator, &alerts, &snapshots, &ticks, &emitted);
                    }
                }
            }
            debug!("tick loop stopped");
        })
    }

    fn spawn_dispatch_loop(&self) -> JoinHandle<()> {
        let snapshots = Arc::clone(&self.snapshots);
        let persistence = Arc::clone(&self.persistence);
        let alerts = Arc::clone(&self.alerts);
        tokio::spawn(async move {
            while let Some(tick) = snapshots.pop().await {
                for snapshot in &tick.snapshots {
                    persistence.persist(snapshot.clone());
                }
                alerts.evaluate_tick(&tick);
            }
            debug!("snapshot dispatch stopped");
        })
    }

    fn spawn_health_loop(&self) -> JoinHandle<()> {
        let mut stop = self.signals.loops.subscribe();
        let ingress = Arc::clone(&self.ingress);
        let persistence = Arc::clone(&self.persistence);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = interval.tick() => {
                        let health = component_health(&ingress, &persistence, true);
                        match health.overall() {
                            HealthStatus::Healthy => debug!("health check ok"),
                            HealthStatus::Degraded(reason) => warn!("pipeline degraded: {}", reason),
                            HealthStatus::Unhealthy(reason) => error!("pipeline unhealthy: {}", reason),
                        }
                    }
                }
            }
        })
    }

    /// Snapshot every key now and hand the batch downstream.
    pub fn tick_now(&self) -> usize {
        emit(
            &self.aggregator,
            &self.alerts,
            &self.snapshots,
            &self.ticks,
            &self.emitted,
        )
    }

    /// Stop in dependency order: ingress, folds, final snapshot, sinks.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let grace = self.config.shutdown.grace();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        info!(?grace, "pipeline shutting down");

        self.signals.ingress.send_replace(true);
        await_task("ingress", tasks.ingress.take(), grace).await;
        await_task("fold worker", tasks.fold_worker.take(), grace).await;

        self.signals.loops.send_replace(true);
        await_task("tick loop", tasks.tick.take(), grace).await;
        await_task("health loop", tasks.health.take(), grace).await;

        let final_keys = self.tick_now();
        debug!(keys = final_keys, "final snapshot emitted");
        self.snapshots.close();
        await_task("snapshot dispatch", tasks.dispatch.take(), grace).await;

        self.persistence.force_flush();
        self.persistence
            .shutdown(self.config.persistence.flush_grace())
            .await;

        self.signals.alerts.send_replace(true);
        await_task("alert dispatcher", tasks.alert_dispatcher.take(), grace).await;

        if let Err(err) = self.ports.transport.disconnect().await {
            warn!("transport disconnect failed: {err:#}");
        }
        self.ingress
            .set_health(HealthStatus::Degraded("stopped".into()));
        info!("pipeline stopped");
    }

    pub fn health(&self) -> HealthSnapshot {
        component_health(&self.ingress, &self.persistence, self.is_running())
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            started_at: *self.started_at.lock(),
            ticks: self.ticks.load(Ordering::Relaxed),
            snapshots_emitted: self.emitted.load(Ordering::Relaxed),
            snapshot_batches_dropped: self.snapshots.dropped(),
            ingress: self.ingress.stats(),
            aggregator: self.aggregator.stats(),
            persistence: self.persistence.stats(),
            alerts: self.alerts.summary(),
        }
    }

    pub async fn get_latest(&self, key: &MetricKey) -> Result<Option<MetricsSnapshot>> {
        self.persistence.get_latest(key).await
    }

    pub async fn get_history(
        &self,
        key: &MetricKey,
        range: TimeRange,
    ) -> Result<Vec<MetricsSnapshot>> {
        self.persistence.get_history(key, range).await
    }

    pub fn get_active_alerts(&self) -> Vec<AlertInstance> {
        self.alerts.active_alerts()
    }
}

fn emit(
    aggregator: &WindowAggregator,
    alerts: &AlertEngine,
    snapshots: &DropOldestQueue<Tick>,
    ticks: &AtomicU64,
    emitted: &AtomicU64,
) -> usize {
    ticks.fetch_add(1, Ordering::Relaxed);
    let tick = aggregator.tick();
    let count = tick.snapshots.len();
    if count > 0 {
        emitted.fetch_add(count as u64, Ordering::Relaxed);
        if let Some(shed) = snapshots.push(tick) {
            warn!("snapshot queue full; dropped oldest batch");
            // Keys evicted in the lost batch still need their alerts closed.
            for snapshot in shed.snapshots.iter().filter(|s| shed.is_retired(&s.key)) {
                alerts.retire(snapshot);
            }
        }
    }
    count
}

fn component_health(
    ingress: &EventIngress,
    persistence: &PersistenceGateway,
    running: bool,
) -> HealthSnapshot {
    let mut health = HealthSnapshot::default();
    health.insert("ingress", ingress.health());
    health.insert(
        "aggregator",
        if running {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded("not running".into())
        },
    );
    health.insert("persistence.durable", persistence.durable_health());
    health.insert("persistence.cache", persistence.cache_health());
    health
}

async fn await_task(name: &str, task: Option<JoinHandle<()>>, grace: Duration) {
    let Some(mut task) = task else {
        return;
    };
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => debug!(task = name, "stopped"),
        Ok(Err(err)) => error!(task = name, "task failed: {}", err),
        Err(_) => {
            task.abort();
            warn!(task = name, ?grace, "task did not stop within grace period; aborted");
        }
    }
}
