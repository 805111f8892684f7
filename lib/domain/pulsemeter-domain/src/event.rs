use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::MetricKey;

/// A single observed request, as emitted by the interception middleware.
///
/// Field aliases accept the older producer schema (`timestamp`,
/// `api_endpoint`, `http_method`, `response_time_ms`, ...). Unknown fields
/// are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub event_id: String,
    #[serde(alias = "timestamp")]
    pub occurred_at: DateTime<Utc>,
    pub service_name: String,
    #[serde(alias = "api_endpoint")]
    pub endpoint: String,
    #[serde(alias = "http_method")]
    pub method: String,
    pub status_code: u16,
    #[serde(alias = "response_time_ms")]
    pub latency_ms: f64,
    #[serde(default, alias = "request_size_bytes")]
    pub request_bytes: Option<u64>,
    #[serde(default, alias = "response_size_bytes")]
    pub response_bytes: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl RequestEvent {
    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<(), MalformedEvent> {
        if self.event_id.trim().is_empty() {
            return Err(MalformedEvent::invalid("event_id", "must not be empty"));
        }
        if self.service_name.trim().is_empty() {
            return Err(MalformedEvent::invalid("service_name", "must not be empty"));
        }
        if self.service_name == MetricKey::OVERALL_SERVICE {
            return Err(MalformedEvent::invalid(
                "service_name",
                "is reserved for the overall rollup",
            ));
        }
        if self.endpoint.trim().is_empty() {
            return Err(MalformedEvent::invalid("endpoint", "must not be empty"));
        }
        if !(100..=599).contains(&self.status_code) {
            return Err(MalformedEvent::invalid(
                "status_code",
                format!("{} is not a valid HTTP status", self.status_code),
            ));
        }
        if !self.latency_ms.is_finite() || self.latency_ms < 0.0 {
            return Err(MalformedEvent::invalid(
                "latency_ms",
                format!("{} is not a finite non-negative duration", self.latency_ms),
            ));
        }
        Ok(())
    }
}

/// Why an inbound payload could not become a [`RequestEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEvent {
    #[error("payload is not valid utf-8: {0}")]
    Encoding(String),
    #[error("payload does not match the event schema: {0}")]
    Schema(String),
    #[error("field `{field}` is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl MalformedEvent {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// A payload preserved for inspection instead of being processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub received_at: DateTime<Utc>,
    pub reason: String,
    pub payload: String,
}

impl DeadLetter {
    pub fn new(payload: &[u8], error: &MalformedEvent, received_at: DateTime<Utc>) -> Self {
        Self {
            received_at,
            reason: error.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        }
    }
}
