//! Threshold alerting over live snapshots.
//!
//! Each (rule, key) pair runs a small state machine: clear → triggered →
//! resolved, where a resolved instance is final and the next breach opens a
//! new one. Decisions come from [`transition`], a pure function of the rule,
//! the previous state and the snapshot.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pulsemeter_domain::{
    AlertEvent, AlertInstance, AlertRule, AlertState, AlertsConfig, Metric, MetricKey,
    MetricsSnapshot, Severity,
};
use pulsemeter_ports::{AlertPublisher, Clock};

use crate::aggregator::Tick;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleEvalError {
    #[error("metric `{metric}` is not a finite number ({value})")]
    NonFiniteMetric { metric: Metric, value: f64 },
    #[error("threshold {0} is not a finite number")]
    NonFiniteThreshold(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Clear and still clear.
    Stay,
    Trigger,
    /// Already triggered and still breaching.
    Hold,
    Resolve,
}

/// Next step for one rule on one key. `previous` is the state of the live
/// instance, or `None` when the pair is clear.
pub fn transition(
    rule: &AlertRule,
    previous: Option<AlertState>,
    snapshot: &MetricsSnapshot,
) -> Result<Transition, RuleEvalError> {
    if !rule.threshold.is_finite() {
        return Err(RuleEvalError::NonFiniteThreshold(rule.threshold));
    }
    let value = snapshot.value(rule.metric);
    if !value.is_finite() {
        return Err(RuleEvalError::NonFiniteMetric {
            metric: rule.metric,
            value,
        });
    }
    let breached = rule.operator.holds(value, rule.threshold);
    Ok(match (previous, breached) {
        (Some(AlertState::Triggered), true) => Transition::Hold,
        (Some(AlertState::Triggered), false) => Transition::Resolve,
        (_, true) => Transition::Trigger,
        (_, false) => Transition::Stay,
    })
}

fn describe(rule: &AlertRule, key: &MetricKey, value: f64) -> String {
    format!(
        "{} on {}: {} is {:.3} ({} {}) [{}]",
        rule.display_name(),
        key,
        rule.metric,
        value,
        rule.operator,
        rule.threshold,
        rule.severity
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSummary {
    pub active: usize,
    pub active_by_severity: BTreeMap<Severity, usize>,
    pub rules_total: usize,
    pub rules_enabled: usize,
    pub triggered_total: u64,
    pub resolved_total: u64,
    pub rule_checks: u64,
    pub evaluation_errors: u64,
    pub events_dropped: u64,
    pub events_published: u64,
    pub publish_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    triggered: AtomicU64,
    resolved: AtomicU64,
    checks: AtomicU64,
    eval_errors: AtomicU64,
    events_dropped: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
}

#[derive(Debug, Default)]
struct PairState {
    live: Option<AlertInstance>,
    last_window_end: Option<DateTime<Utc>>,
    last_resolved: Option<DateTime<Utc>>,
}

/// Rule state for one key, by rule id.
type KeyAlerts = HashMap<String, PairState>;

/// Evaluates rules per key.
///
/// Rule state is sharded by key, so evaluating one key never waits on
/// another. Rules sit behind a read-mostly lock and the history has its own.
pub struct AlertEngine {
    rules: RwLock<BTreeMap<String, AlertRule>>,
    keys: DashMap<MetricKey, KeyAlerts>,
    history: Mutex<VecDeque<AlertInstance>>,
    clock: Arc<dyn Clock>,
    debounce: chrono::Duration,
    history_size: usize,
    outbound: mpsc::Sender<AlertEvent>,
    inbound: Mutex<Option<mpsc::Receiver<AlertEvent>>>,
    counters: Counters,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>, config: &AlertsConfig, clock: Arc<dyn Clock>) -> Self {
        let (outbound, inbound) = mpsc::channel(config.channel_capacity.max(1));
        let rules = rules
            .into_iter()
            .map(|rule| (rule.rule_id.clone(), rule))
            .collect();
        Self {
            rules: RwLock::new(rules),
            keys: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            clock,
            debounce: chrono::Duration::seconds(config.retrigger_debounce_secs as i64),
            history_size: config.history_size,
            outbound,
            inbound: Mutex::new(Some(inbound)),
            counters: Counters::default(),
        }
    }

    /// Take the outbound event stream; `None` once a dispatcher owns it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<AlertEvent>> {
        self.inbound.lock().take()
    }

    /// Forward outbound events to every publisher until shutdown.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        publishers: Vec<Arc<dyn AlertPublisher>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let mut events = self.take_events()?;
        let engine = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => engine.publish(&publishers, &event).await,
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        while let Ok(event) = events.try_recv() {
                            engine.publish(&publishers, &event).await;
                        }
                        break;
                    }
                }
            }
            debug!("alert dispatcher stopped");
        }))
    }

    async fn publish(&self, publishers: &[Arc<dyn AlertPublisher>], event: &AlertEvent) {
        for publisher in publishers {
            match publisher.publish(event).await {
                Ok(()) => {
                    self.counters.published.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(alert_id = %event.alert_id, "alert publish failed: {err:#}");
                }
            }
        }
    }

    /// Evaluate one aggregation tick. Retired keys are closed out instead of
    /// evaluated, so an emptied window never opens a fresh alert.
    pub fn evaluate_tick(&self, tick: &Tick) -> Vec<AlertEvent> {
        tick.snapshots
            .iter()
            .flat_map(|snapshot| {
                if tick.is_retired(&snapshot.key) {
                    self.retire(snapshot)
                } else {
                    self.evaluate(snapshot)
                }
            })
            .collect()
    }

    /// Run every matching rule against one snapshot and emit state changes.
    ///
    /// A snapshot older than the last one seen for a rule and key is ignored.
    /// One with the same `window_end` supersedes the earlier evaluation.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Vec<AlertEvent> {
        let now = self.clock.now();
        let mut events = Vec::new();
        let mut recorded = Vec::new();
        {
            let rules = self.rules.read();
            let mut matching = rules
                .values()
                .filter(|rule| rule.enabled && rule.key_selector.matches(&snapshot.key))
                .peekable();
            if matching.peek().is_none() {
                return events;
            }
            let mut pairs = self.keys.entry(snapshot.key.clone()).or_default();

            for rule in matching {
                let pair = pairs.entry(rule.rule_id.clone()).or_default();
                if pair
                    .last_window_end
                    .is_some_and(|seen| snapshot.window_end < seen)
                {
                    debug!(rule_id = %rule.rule_id, key = %snapshot.key, "ignoring stale snapshot");
                    continue;
                }
                pair.last_window_end = Some(snapshot.window_end);
                self.counters.checks.fetch_add(1, Ordering::Relaxed);

                let previous = pair.live.as_ref().map(|live| live.state);
                let step = match transition(rule, previous, snapshot) {
                    Ok(step) => step,
                    Err(err) => {
                        self.counters.eval_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(rule_id = %rule.rule_id, key = %snapshot.key, "skipping rule: {}", err);
                        continue;
                    }
                };

                let value = snapshot.value(rule.metric);
                match step {
                    Transition::Stay => {}
                    Transition::Hold => {
                        if let Some(live) = pair.live.as_mut() {
                            live.current_value = value;
                        }
                    }
                    Transition::Trigger => {
                        let debounced = pair
                            .last_resolved
                            .is_some_and(|resolved| snapshot.window_end < resolved + self.debounce);
                        if debounced {
                            debug!(rule_id = %rule.rule_id, key = %snapshot.key, "re-trigger debounced");
                            continue;
                        }
                        let instance = AlertInstance {
                            alert_id: Uuid::new_v4().to_string(),
                            rule_id: rule.rule_id.clone(),
                            key: snapshot.key.clone(),
                            state: AlertState::Triggered,
                            severity: rule.severity,
                            message: describe(rule, &snapshot.key, value),
                            current_value: value,
                            threshold: rule.threshold,
                            started_at: snapshot.window_end,
                            resolved_at: None,
                            acknowledged_at: None,
                        };
                        self.counters.triggered.fetch_add(1, Ordering::Relaxed);
                        warn!(alert_id = %instance.alert_id, "alert triggered: {}", instance.message);
                        events.push(AlertEvent::from_instance(&instance, now));
                        recorded.push(instance.clone());
                        pair.live = Some(instance);
                    }
                    Transition::Resolve => {
                        if let Some(mut instance) = pair.live.take() {
                            instance.state = AlertState::Resolved;
                            instance.current_value = value;
                            instance.resolved_at = Some(snapshot.window_end);
                            instance.message =
                                format!("Resolved: {}", describe(rule, &snapshot.key, value));
                            self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                            info!(alert_id = %instance.alert_id, "alert resolved: {}", instance.message);
                            events.push(AlertEvent::from_instance(&instance, now));
                            recorded.push(instance);
                            pair.last_resolved = Some(snapshot.window_end);
                        }
                    }
                }
            }
        }

        self.record(recorded);
        self.send(&events);
        events
    }

    /// Close out a key that left the aggregator: resolve its live alerts
    /// against its final snapshot and forget its state.
    pub fn retire(&self, last: &MetricsSnapshot) -> Vec<AlertEvent> {
        let Some((key, pairs)) = self.keys.remove(&last.key) else {
            return Vec::new();
        };
        let now = self.clock.now();
        let rules = self.rules.read();
        let mut events = Vec::new();
        let mut recorded = Vec::new();
        for (rule_id, pair) in pairs {
            let Some(mut instance) = pair.live else {
                continue;
            };
            let value = rules
                .get(&rule_id)
                .map(|rule| last.value(rule.metric))
                .unwrap_or(instance.current_value);
            instance.state = AlertState::Resolved;
            instance.current_value = value;
            instance.resolved_at = Some(last.window_end);
            instance.message = format!("Resolved: {key} went idle");
            self.counters.resolved.fetch_add(1, Ordering::Relaxed);
            info!(alert_id = %instance.alert_id, "alert resolved: {}", instance.message);
            events.push(AlertEvent::from_instance(&instance, now));
            recorded.push(instance);
        }
        drop(rules);
        debug!(%key, resolved = events.len(), "retired alert state");

        self.record(recorded);
        self.send(&events);
        events
    }

    fn record(&self, instances: Vec<AlertInstance>) {
        if instances.is_empty() {
            return;
        }
        let mut history = self.history.lock();
        for instance in instances {
            history.push_front(instance);
        }
        history.truncate(self.history_size);
    }

    fn send(&self, events: &[AlertEvent]) {
        for event in events {
            if let Err(err) = self.outbound.try_send(event.clone()) {
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(alert_id = %event.alert_id, "outbound alert channel rejected event: {}", err);
            }
        }
    }

    /// Number of keys holding rule state.
    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn active_alerts(&self) -> Vec<AlertInstance> {
        let mut active: Vec<AlertInstance> = self
            .keys
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .values()
                    .filter_map(|pair| pair.live.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        active.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.started_at.cmp(&b.started_at))
                .then_with(|| a.rule_id.cmp(&b.rule_id))
                .then_with(|| a.key.cmp(&b.key))
        });
        active
    }

    /// Recent alert transitions, newest first.
    pub fn history(&self, limit: usize) -> Vec<AlertInstance> {
        self.history.lock().iter().take(limit).cloned().collect()
    }

    /// Mark a live alert as seen. Returns `false` if no live alert has that id.
    pub fn acknowledge(&self, alert_id: &str) -> bool {
        let now = self.clock.now();
        for mut entry in self.keys.iter_mut() {
            let found = entry
                .value_mut()
                .values_mut()
                .filter_map(|pair| pair.live.as_mut())
                .find(|live| live.alert_id == alert_id);
            if let Some(live) = found {
                live.acknowledged_at.get_or_insert(now);
                info!(alert_id, "alert acknowledged");
                return true;
            }
        }
        false
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().values().cloned().collect()
    }

    pub fn upsert_rule(&self, rule: AlertRule) {
        info!(rule_id = %rule.rule_id, enabled = rule.enabled, "alert rule updated");
        self.rules.write().insert(rule.rule_id.clone(), rule);
    }

    /// Remove a rule and forget every state it held.
    pub fn remove_rule(&self, rule_id: &str) -> Option<AlertRule> {
        let removed = self.rules.write().remove(rule_id)?;
        for mut entry in self.keys.iter_mut() {
            entry.value_mut().remove(rule_id);
        }
        self.keys.retain(|_, pairs| !pairs.is_empty());
        info!(rule_id, "alert rule removed");
        Some(removed)
    }

    pub fn summary(&self) -> AlertSummary {
        let mut active_by_severity: BTreeMap<Severity, usize> =
            Severity::ALL.iter().map(|severity| (*severity, 0)).collect();
        let mut active = 0;
        for entry in self.keys.iter() {
            for live in entry.value().values().filter_map(|pair| pair.live.as_ref()) {
                active += 1;
                *active_by_severity.entry(live.severity).or_default() += 1;
            }
        }
        let (rules_total, rules_enabled) = {
            let rules = self.rules.read();
            (rules.len(), rules.values().filter(|rule| rule.enabled).count())
        };
        AlertSummary {
            active,
            active_by_severity,
            rules_total,
            rules_enabled,
            triggered_total: self.counters.triggered.load(Ordering::Relaxed),
            resolved_total: self.counters.resolved.load(Ordering::Relaxed),
            rule_checks: self.counters.checks.load(Ordering::Relaxed),
            evaluation_errors: self.counters.eval_errors.load(Ordering::Relaxed),
            events_dropped: self.counters.events_dropped.load(Ordering::Relaxed),
            events_published: self.counters.published.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
        }
    }
}
