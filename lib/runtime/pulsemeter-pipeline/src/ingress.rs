//! Inbound event path: transport → decode/validate → bounded channel → fold.
//!
//! Malformed payloads go to the dead-letter sink and are acknowledged so the
//! transport never redelivers them. Valid events are acknowledged only after
//! the fold worker has handed them to the aggregator.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, bail};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use pulsemeter_domain::{DeadLetter, HealthStatus, IngressConfig, MalformedEvent, RequestEvent};
use pulsemeter_ports::{Clock, DeadLetterSink, DeliveryTag, EventTransport};

use crate::aggregator::{FoldOutcome, WindowAggregator};
use crate::backoff::Backoff;

/// Decode and validate one raw payload.
pub fn decode(payload: &[u8]) -> Result<RequestEvent, MalformedEvent> {
    let text =
        std::str::from_utf8(payload).map_err(|err| MalformedEvent::Encoding(err.to_string()))?;
    let event: RequestEvent =
        serde_json::from_str(text).map_err(|err| MalformedEvent::Schema(err.to_string()))?;
    event.validate()?;
    Ok(event)
}

/// What a single `receive` produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event {
        event: RequestEvent,
        tag: DeliveryTag,
    },
    /// Already dead-lettered and acknowledged.
    Malformed { error: MalformedEvent },
}

/// An event accepted by ingress, awaiting fold and acknowledgement.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub event: RequestEvent,
    pub tag: DeliveryTag,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressStats {
    pub consumed: u64,
    pub accepted: u64,
    pub dead_lettered: u64,
    pub dead_letter_failures: u64,
    pub duplicates_suppressed: u64,
    pub ack_failures: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct Counters {
    consumed: AtomicU64,
    accepted: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letter_failures: AtomicU64,
    duplicates_suppressed: AtomicU64,
    ack_failures: AtomicU64,
    reconnects: AtomicU64,
}

/// Bounded set of recently seen event ids.
#[derive(Debug)]
struct RecentIds {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Returns `false` if the id was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

pub struct EventIngress {
    transport: Arc<dyn EventTransport>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    config: IngressConfig,
    recent: Option<Mutex<RecentIds>>,
    counters: Counters,
    health: Mutex<HealthStatus>,
}

impl EventIngress {
    pub fn new(
        transport: Arc<dyn EventTransport>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
        config: IngressConfig,
    ) -> Self {
        let recent = (config.dedup_capacity > 0)
            .then(|| Mutex::new(RecentIds::new(config.dedup_capacity)));
        Self {
            transport,
            dead_letters,
            clock,
            config,
            recent,
            counters: Counters::default(),
            health: Mutex::new(HealthStatus::Degraded("not connected".into())),
        }
    }

    pub fn transport(&self) -> &Arc<dyn EventTransport> {
        &self.transport
    }

    pub fn health(&self) -> HealthStatus {
        self.health.lock().clone()
    }

    pub fn set_health(&self, status: HealthStatus) {
        *self.health.lock() = status;
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.config.reconnect_base(), self.config.reconnect_cap())
    }

    /// Initial connection with a bounded number of attempts.
    pub async fn connect_with_retry(&self) -> Result<()> {
        let mut backoff = self.backoff();
        let attempts = self.config.startup_connect_attempts;
        for attempt in 1..=attempts {
            match self.transport.connect().await {
                Ok(()) => {
                    self.set_health(HealthStatus::Healthy);
                    info!(attempt, "transport connected");
                    return Ok(());
                }
                Err(err) if attempt < attempts => {
                    let delay = backoff.next_delay();
                    warn!(attempt, ?delay, "transport connect failed: {err:#}");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.set_health(HealthStatus::Unhealthy(format!(
                        "transport unreachable: {err:#}"
                    )));
                    bail!("transport unreachable after {attempts} attempts: {err:#}");
                }
            }
        }
        bail!("transport connect attempts must be non-zero")
    }

    /// Reconnect until it succeeds or shutdown is requested.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut backoff = self.backoff();
        loop {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = shutdown.changed() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.transport.connect().await {
                Ok(()) => {
                    self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.set_health(HealthStatus::Healthy);
                    info!(attempts = backoff.attempt(), "transport reconnected");
                    return true;
                }
                Err(err) => {
                    warn!(attempt = backoff.attempt(), ?delay, "reconnect failed: {err:#}");
                }
            }
        }
    }

    /// Pull one message from the transport and classify it.
    ///
    /// `Ok(None)` means the transport stream has ended. Transport errors are
    /// returned as `Err`; decode failures never are.
    pub async fn receive(&self) -> Result<Option<Inbound>> {
        let Some(delivery) = self.transport.recv().await? else {
            return Ok(None);
        };
        self.counters.consumed.fetch_add(1, Ordering::Relaxed);

        match decode(&delivery.payload) {
            Ok(event) => Ok(Some(Inbound::Event {
                event,
                tag: delivery.tag,
            })),
            Err(error) => {
                self.dead_letter(&delivery.payload, &error).await;
                self.ack(delivery.tag).await;
                Ok(Some(Inbound::Malformed { error }))
            }
        }
    }

    async fn dead_letter(&self, payload: &[u8], error: &MalformedEvent) {
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        warn!(reason = %error, "dead-lettering malformed event");
        let letter = DeadLetter::new(payload, error, self.clock.now());
        if let Err(err) = self.dead_letters.send(letter).await {
            self.counters
                .dead_letter_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!("dead-letter sink rejected payload: {err:#}");
        }
    }

    pub async fn ack(&self, tag: DeliveryTag) {
        if let Err(err) = self.transport.ack(tag).await {
            self.counters.ack_failures.fetch_add(1, Ordering::Relaxed);
            warn!(tag, "ack failed: {err:#}");
        }
    }

    fn is_duplicate(&self, event: &RequestEvent) -> bool {
        match &self.recent {
            Some(recent) => !recent.lock().insert(&event.event_id),
            None => false,
        }
    }

    /// Consume until shutdown or end of stream, forwarding accepted events.
    ///
    /// Dropping `tx` on return lets the fold worker drain and finish.
    pub async fn run(self: Arc<Self>, tx: mpsc::Sender<Accepted>, mut shutdown: watch::Receiver<bool>) {
        info!("ingress consuming");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.receive() => received,
            };
            match received {
                Ok(Some(Inbound::Event { event, tag })) => {
                    if self.is_duplicate(&event) {
                        self.counters
                            .duplicates_suppressed
                            .fetch_add(1, Ordering::Relaxed);
                        debug!(event_id = %event.event_id, "suppressed duplicate");
                        self.ack(tag).await;
                        continue;
                    }
                    self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    if tx.send(Accepted { event, tag }).await.is_err() {
                        warn!("fold worker gone; stopping ingress");
                        break;
                    }
                }
                Ok(Some(Inbound::Malformed { .. })) => {}
                Ok(None) => {
                    info!("transport stream ended");
                    break;
                }
                Err(err) => {
                    warn!("transport receive failed: {err:#}");
                    self.set_health(HealthStatus::Degraded(format!("reconnecting: {err:#}")));
                    if !self.reconnect(&mut shutdown).await {
                        break;
                    }
                }
            }
        }
        info!("ingress stopped");
    }

    pub fn stats(&self) -> IngressStats {
        IngressStats {
            consumed: self.counters.consumed.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            dead_letter_failures: self.counters.dead_letter_failures.load(Ordering::Relaxed),
            duplicates_suppressed: self.counters.duplicates_suppressed.load(Ordering::Relaxed),
            ack_failures: self.counters.ack_failures.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Drain accepted events into the aggregator, acknowledging after each fold.
pub async fn run_fold_worker(
    ingress: Arc<EventIngress>,
    aggregator: Arc<WindowAggregator>,
    mut rx: mpsc::Receiver<Accepted>,
) {
    while let Some(Accepted { event, tag }) = rx.recv().await {
        if aggregator.fold(&event) == FoldOutcome::Late {
            debug!(event_id = %event.event_id, "late event acknowledged without folding");
        }
        ingress.ack(tag).await;
    }
    debug!("fold worker drained");
}
