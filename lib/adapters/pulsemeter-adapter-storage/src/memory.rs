use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use pulsemeter_domain::{MetricKey, MetricsSnapshot, TimeRange};
use pulsemeter_ports::{Clock, DurableStore, FastCache, SystemClock};

/// Durable store kept in process memory. Records each batch size it receives.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<MetricsSnapshot>>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<MetricsSnapshot> {
        self.rows.lock().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    /// A row with the same key and `window_end` as a stored one replaces it.
    async fn write_batch(&self, batch: &[MetricsSnapshot]) -> Result<()> {
        let mut rows = self.rows.lock();
        for snapshot in batch {
            match rows
                .iter_mut()
                .find(|row| row.key == snapshot.key && row.window_end == snapshot.window_end)
            {
                Some(row) => *row = snapshot.clone(),
                None => rows.push(snapshot.clone()),
            }
        }
        drop(rows);
        self.batch_sizes.lock().push(batch.len());
        Ok(())
    }

    async fn history(
        &self,
        key: &MetricKey,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<MetricsSnapshot>> {
        let mut matching: Vec<MetricsSnapshot> = self
            .rows
            .lock()
            .iter()
            .filter(|row| &row.key == key && range.contains(row.window_end))
            .cloned()
            .collect();
        matching.sort_by_key(|row| row.window_end);
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.split_off(skip))
    }

    async fn latest(&self, key: &MetricKey) -> Result<Option<MetricsSnapshot>> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|row| &row.key == key)
            .max_by_key(|row| row.window_end)
            .cloned())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|row| row.window_end >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Puts between sweeps of expired entries.
const PURGE_EVERY: u64 = 256;

/// Overwrite-with-expiry cache. Expired entries read as absent and are swept
/// out every few hundred writes.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    puts: AtomicU64,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            puts: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl FastCache for MemoryCache {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = self.clock.now();
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut entries = self.entries.lock();
        if (self.puts.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_EVERY == 0 {
            entries.retain(|_, entry| entry.expires_at > now);
        }
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
