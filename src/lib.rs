//! Request metrics pipeline: sliding-window aggregation, dual-sink
//! persistence and threshold alerting over a stream of request events.

pub use pulsemeter_domain as domain;
pub use pulsemeter_pipeline as pipeline;
pub use pulsemeter_ports as ports;

#[cfg(feature = "notification")]
pub use pulsemeter_adapter_notification as notification;
#[cfg(feature = "storage")]
pub use pulsemeter_adapter_storage as storage;
#[cfg(feature = "transport")]
pub use pulsemeter_adapter_transport as transport;

#[cfg(all(feature = "storage", feature = "transport", feature = "notification"))]
pub mod wiring;

pub use pulsemeter_domain::PulsemeterConfig;
pub use pulsemeter_pipeline::{Pipeline, PipelineStats, StartupError};
