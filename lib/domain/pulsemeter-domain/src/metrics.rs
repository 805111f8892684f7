use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of an aggregation stream: every service together, a whole
/// service, or one of its endpoints.
///
/// The system-wide rollup uses the reserved service name
/// [`MetricKey::OVERALL_SERVICE`], which inbound events may not carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricKey {
    pub service_name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl MetricKey {
    pub const OVERALL_SERVICE: &'static str = "*";

    pub fn overall() -> Self {
        Self {
            service_name: Self::OVERALL_SERVICE.to_string(),
            endpoint: None,
        }
    }

    pub fn service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            endpoint: None,
        }
    }

    pub fn endpoint(service_name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            endpoint: Some(endpoint.into()),
        }
    }

    pub fn is_overall(&self) -> bool {
        self.endpoint.is_none() && self.service_name == Self::OVERALL_SERVICE
    }

    pub fn is_endpoint(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Key used in the fast-read cache: `metrics:{service}[:{endpoint}]`, or
    /// `metrics:overall:current` for the rollup.
    pub fn cache_key(&self) -> String {
        if self.is_overall() {
            return "metrics:overall:current".to_string();
        }
        match &self.endpoint {
            Some(endpoint) => format!("metrics:{}:{}", self.service_name, endpoint),
            None => format!("metrics:{}", self.service_name),
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_overall() {
            return f.write_str("overall");
        }
        match &self.endpoint {
            Some(endpoint) => write!(f, "{}:{}", self.service_name, endpoint),
            None => f.write_str(&self.service_name),
        }
    }
}

/// Immutable statistical summary of one key's sliding window at a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub key: MetricKey,
    pub window_end: DateTime<Utc>,
    pub qps: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Ratio in `[0, 1]`, not a percentage.
    pub error_rate: f64,
    pub total_requests: u64,
    pub total_errors: u64,
}

impl MetricsSnapshot {
    pub fn empty(key: MetricKey, window_end: DateTime<Utc>) -> Self {
        Self {
            key,
            window_end,
            qps: 0.0,
            avg_latency_ms: 0.0,
            p95_latency_ms: 0.0,
            p99_latency_ms: 0.0,
            error_rate: 0.0,
            total_requests: 0,
            total_errors: 0,
        }
    }

    pub fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Qps => self.qps,
            Metric::AvgLatencyMs => self.avg_latency_ms,
            Metric::P95LatencyMs => self.p95_latency_ms,
            Metric::P99LatencyMs => self.p99_latency_ms,
            Metric::ErrorRate => self.error_rate,
            Metric::TotalRequests => self.total_requests as f64,
            Metric::TotalErrors => self.total_errors as f64,
        }
    }
}

/// The fixed set of numeric metrics a rule can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Qps,
    AvgLatencyMs,
    P95LatencyMs,
    P99LatencyMs,
    ErrorRate,
    TotalRequests,
    TotalErrors,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::Qps => "qps",
            Metric::AvgLatencyMs => "avg_latency_ms",
            Metric::P95LatencyMs => "p95_latency_ms",
            Metric::P99LatencyMs => "p99_latency_ms",
            Metric::ErrorRate => "error_rate",
            Metric::TotalRequests => "total_requests",
            Metric::TotalErrors => "total_errors",
        };
        f.write_str(name)
    }
}

/// Inclusive time range for history reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}
