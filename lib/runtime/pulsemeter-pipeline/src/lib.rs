//! Streaming metrics pipeline: ingress, windowed aggregation, dual-sink
//! persistence, alerting, and the supervisor that wires them together.

pub mod aggregator;
pub mod alert;
pub mod backoff;
pub mod ingress;
pub mod persistence;
pub mod queue;
pub mod supervisor;

pub use aggregator::{AggregatorStats, FoldOutcome, Tick, WindowAggregator, WindowShape};
pub use alert::{AlertEngine, AlertSummary, RuleEvalError, Transition, transition};
pub use backoff::Backoff;
pub use ingress::{Accepted, EventIngress, Inbound, IngressStats, decode};
pub use persistence::{PersistenceGateway, PersistenceStats};
pub use queue::DropOldestQueue;
pub use supervisor::{Pipeline, PipelineStats, StartupError};
