//! Ports: the seams between the pipeline and the outside world.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use pulsemeter_domain::{AlertEvent, DeadLetter, MetricKey, MetricsSnapshot, TimeRange};

pub type DeliveryTag = u64;

/// A raw message handed over by the transport, acknowledged by tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn new(tag: DeliveryTag, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }
}

/// Inbound message transport with at-least-once delivery.
///
/// `recv` returning `Ok(None)` means the stream ended for good; an `Err`
/// means the connection dropped and the caller should reconnect.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn recv(&self) -> Result<Option<Delivery>>;
    async fn ack(&self, tag: DeliveryTag) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: DeadLetter) -> Result<()>;
}

/// Append-only, time-ordered historical store.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn write_batch(&self, batch: &[MetricsSnapshot]) -> Result<()>;
    async fn history(
        &self,
        key: &MetricKey,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<MetricsSnapshot>>;
    async fn latest(&self, key: &MetricKey) -> Result<Option<MetricsSnapshot>>;
    /// Delete rows with `window_end` before `cutoff`; returns the count removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Overwrite-with-expiry key/value cache for current values.
#[async_trait]
pub trait FastCache: Send + Sync {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait AlertPublisher: Send + Sync {
    async fn publish(&self, event: &AlertEvent) -> Result<()>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Every external handle the pipeline needs, injected at construction.
#[derive(Clone)]
pub struct PortSet {
    pub transport: Arc<dyn EventTransport>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub durable: Arc<dyn DurableStore>,
    pub cache: Arc<dyn FastCache>,
    pub publishers: Vec<Arc<dyn AlertPublisher>>,
    pub clock: Arc<dyn Clock>,
}

impl PortSet {
    pub fn new(
        transport: Arc<dyn EventTransport>,
        durable: Arc<dyn DurableStore>,
        cache: Arc<dyn FastCache>,
    ) -> Self {
        Self {
            transport,
            dead_letters: Arc::new(NullDeadLetterSink),
            durable,
            cache,
            publishers: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn AlertPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[derive(Clone, Copy, Default)]
struct NullDeadLetterSink;

#[async_trait]
impl DeadLetterSink for NullDeadLetterSink {
    async fn send(&self, _letter: DeadLetter) -> Result<()> {
        Ok(())
    }
}
