//! Builds the production port set from configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use pulsemeter_adapter_notification::{LogPublisher, WebhookPublisher};
use pulsemeter_adapter_storage::{MemoryCache, SqliteStore};
use pulsemeter_adapter_transport::{JsonLinesTransport, JsonlDeadLetterFile};
use pulsemeter_domain::PulsemeterConfig;
use pulsemeter_ports::PortSet;

/// Dead letters land next to the SQLite database.
pub fn dead_letter_path(config: &PulsemeterConfig) -> PathBuf {
    config
        .persistence
        .sqlite_path
        .with_file_name("dead-letters.jsonl")
}

pub fn build_ports(config: &PulsemeterConfig) -> Result<PortSet> {
    let durable = Arc::new(SqliteStore::open(&config.persistence.sqlite_path)?);
    let cache = Arc::new(MemoryCache::new());
    let transport = Arc::new(JsonLinesTransport::from_config(&config.transport));

    let mut ports = PortSet::new(transport, durable, cache)
        .with_dead_letters(Arc::new(JsonlDeadLetterFile::new(dead_letter_path(config))))
        .with_publisher(Arc::new(LogPublisher));
    if let Some(url) = &config.alerts.webhook_url {
        ports = ports.with_publisher(Arc::new(WebhookPublisher::new(url.clone())?));
    }
    Ok(ports)
}
