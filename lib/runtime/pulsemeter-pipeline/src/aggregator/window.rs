//! Sub-bucketed sliding window for a single metric key.
//!
//! Buckets are addressed by their index since the epoch
//! (`floor(ms / bucket_ms)`). The window always holds a contiguous run of
//! at most `capacity` buckets, newest first, ending at the current index.
//! Latency samples per bucket are capped with reservoir sampling, so
//! percentiles become approximate once a bucket sees more than `sample_cap`
//! requests; counts, errors and the average stay exact.

use std::collections::VecDeque;

use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use pulsemeter_domain::{MetricKey, MetricsSnapshot, RequestEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowShape {
    pub bucket_ms: i64,
    pub capacity: usize,
    pub sample_cap: usize,
}

impl WindowShape {
    pub fn window_ms(&self) -> i64 {
        self.bucket_ms * self.capacity as i64
    }

    pub fn index_of(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp_millis().div_euclid(self.bucket_ms)
    }

    /// Oldest index still resident when `current` is the active bucket.
    pub fn oldest_resident(&self, current: i64) -> i64 {
        current - self.capacity as i64 + 1
    }

    pub fn bucket_end(&self, index: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt((index + 1) * self.bucket_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    Accepted,
    /// Event was newer than the active bucket and counted in it instead.
    Clamped,
    /// Event belongs to a bucket that already rotated out; dropped.
    Late,
}

#[derive(Debug, Clone)]
pub struct SubBucket {
    index: i64,
    sample_count: u64,
    error_count: u64,
    latency_sum: f64,
    latency_samples: Vec<f64>,
    rng: Option<SmallRng>,
}

impl SubBucket {
    fn new(index: i64) -> Self {
        Self {
            index,
            sample_count: 0,
            error_count: 0,
            latency_sum: 0.0,
            latency_samples: Vec::new(),
            rng: None,
        }
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    pub fn start(&self, shape: &WindowShape) -> DateTime<Utc> {
        shape.bucket_end(self.index - 1)
    }

    pub fn end(&self, shape: &WindowShape) -> DateTime<Utc> {
        shape.bucket_end(self.index)
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn latency_samples(&self) -> &[f64] {
        &self.latency_samples
    }

    /// Returns `true` when a retained sample had to be replaced.
    fn add(&mut self, latency_ms: f64, is_error: bool, sample_cap: usize) -> bool {
        self.sample_count += 1;
        if is_error {
            self.error_count += 1;
        }
        self.latency_sum += latency_ms;

        if self.latency_samples.len() < sample_cap {
            self.latency_samples.push(latency_ms);
            return false;
        }
        let index = self.index;
        let rng = self
            .rng
            .get_or_insert_with(|| SmallRng::seed_from_u64(index as u64));
        let slot = rng.gen_range(0..self.sample_count);
        if (slot as usize) < sample_cap {
            self.latency_samples[slot as usize] = latency_ms;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    shape: WindowShape,
    buckets: VecDeque<SubBucket>,
}

impl SlidingWindow {
    pub fn new(shape: WindowShape) -> Self {
        Self {
            shape,
            buckets: VecDeque::with_capacity(shape.capacity),
        }
    }

    pub fn shape(&self) -> &WindowShape {
        &self.shape
    }

    pub fn buckets(&self) -> impl Iterator<Item = &SubBucket> {
        self.buckets.iter()
    }

    pub fn newest_index(&self) -> Option<i64> {
        self.buckets.front().map(SubBucket::index)
    }

    /// Advance the window so that `current` is the active (front) bucket.
    ///
    /// Never moves backwards: a `current` older than the front is ignored.
    pub fn rotate(&mut self, current: i64) {
        let oldest = self.shape.oldest_resident(current);
        match self.newest_index() {
            Some(newest) if newest >= current => return,
            Some(newest) => {
                let start = (newest + 1).max(oldest);
                for index in start..=current {
                    self.buckets.push_front(SubBucket::new(index));
                }
            }
            None => {
                for index in oldest..=current {
                    self.buckets.push_front(SubBucket::new(index));
                }
            }
        }
        while self
            .buckets
            .back()
            .is_some_and(|bucket| bucket.index < oldest)
        {
            self.buckets.pop_back();
        }
        while self.buckets.len() > self.shape.capacity {
            self.buckets.pop_back();
        }
    }

    /// Fold one event, given the index of the active bucket.
    ///
    /// Returns the outcome plus whether a retained latency sample was evicted.
    pub fn fold(&mut self, event: &RequestEvent, current: i64) -> (FoldOutcome, bool) {
        self.rotate(current);
        let front = self.newest_index().unwrap_or(current);
        let mut index = self.shape.index_of(event.occurred_at);
        let mut outcome = FoldOutcome::Accepted;
        if index > front {
            index = front;
            outcome = FoldOutcome::Clamped;
        }
        let offset = (front - index) as usize;
        let Some(bucket) = self.buckets.get_mut(offset) else {
            return (FoldOutcome::Late, false);
        };
        let evicted = bucket.add(event.latency_ms, event.is_error(), self.shape.sample_cap);
        (outcome, evicted)
    }

    pub fn total_requests(&self) -> u64 {
        self.buckets.iter().map(|bucket| bucket.sample_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_requests() == 0
    }

    /// Merge every resident bucket into one summary ending at the front bucket.
    pub fn summarize(&self, key: &MetricKey) -> MetricsSnapshot {
        let window_end = self
            .newest_index()
            .map(|index| self.shape.bucket_end(index))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut snapshot = MetricsSnapshot::empty(key.clone(), window_end);

        let total_requests = self.total_requests();
        if total_requests == 0 {
            return snapshot;
        }
        let total_errors: u64 = self.buckets.iter().map(|bucket| bucket.error_count).sum();
        let latency_sum: f64 = self.buckets.iter().map(|bucket| bucket.latency_sum).sum();
        let mut samples: Vec<f64> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.latency_samples.iter().copied())
            .collect();
        samples.sort_by(f64::total_cmp);

        let window_secs = self.shape.window_ms() as f64 / 1000.0;
        snapshot.qps = total_requests as f64 / window_secs;
        snapshot.avg_latency_ms = latency_sum / total_requests as f64;
        snapshot.p95_latency_ms = percentile(&samples, 0.95);
        snapshot.p99_latency_ms = percentile(&samples, 0.99);
        snapshot.error_rate = total_errors as f64 / total_requests as f64;
        snapshot.total_requests = total_requests;
        snapshot.total_errors = total_errors;
        snapshot
    }
}

/// Nearest-rank percentile over ascending `sorted` samples.
///
/// Selects the element at zero-based position `ceil(p * n)`, clamped to the
/// last element, so a single outlier in the top 1% of 100 samples is what p99
/// reports.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = (p * n as f64 - 1e-9).ceil().max(0.0) as usize;
    sorted[rank.min(n - 1)]
}
