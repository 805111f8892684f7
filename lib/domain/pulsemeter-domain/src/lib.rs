//! Domain models and invariants.

pub mod alert;
pub mod config;
pub mod event;
pub mod health;
pub mod metrics;

pub use alert::{
    AlertEvent, AlertInstance, AlertRule, AlertState, KeyLevel, KeySelector, Operator, Severity,
};
pub use config::{
    AggregationConfig, AlertsConfig, IngressConfig, LogFormat, LoggingConfig, PersistenceConfig,
    PulsemeterConfig, ShutdownConfig, TransportConfig,
};
pub use event::{DeadLetter, MalformedEvent, RequestEvent};
pub use health::{HealthSnapshot, HealthStatus};
pub use metrics::{Metric, MetricKey, MetricsSnapshot, TimeRange};
