use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::alert::AlertRule;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulsemeterConfig {
    pub transport: TransportConfig,
    pub ingress: IngressConfig,
    pub aggregation: AggregationConfig,
    pub persistence: PersistenceConfig,
    pub alerts: AlertsConfig,
    pub logging: LoggingConfig,
    pub shutdown: ShutdownConfig,
}

impl PulsemeterConfig {
    /// Load from a YAML file. A missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            serde_yaml::from_str::<Self>(&raw)
                .with_context(|| format!("failed to parse config at {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("PULSEMETER_SQLITE_PATH") {
            self.persistence.sqlite_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("PULSEMETER_WEBHOOK_URL") {
            self.alerts.webhook_url = Some(url);
        }
        if let Ok(level) = std::env::var("PULSEMETER_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let agg = &self.aggregation;
        if agg.bucket_secs == 0 || agg.window_secs == 0 || agg.tick_secs == 0 {
            bail!("aggregation window, bucket and tick must be non-zero");
        }
        if agg.window_secs % agg.bucket_secs != 0 {
            bail!(
                "aggregation window ({}s) must be a multiple of the bucket size ({}s)",
                agg.window_secs,
                agg.bucket_secs
            );
        }
        if agg.tick_secs < agg.bucket_secs {
            bail!(
                "aggregation tick ({}s) must not be shorter than the bucket size ({}s)",
                agg.tick_secs,
                agg.bucket_secs
            );
        }
        if agg.sample_cap == 0 || agg.snapshot_queue_capacity == 0 {
            bail!("aggregation sample cap and snapshot queue capacity must be non-zero");
        }
        let p = &self.persistence;
        if p.batch_size == 0 || p.queue_capacity == 0 || p.max_attempts == 0 {
            bail!("persistence batch size, queue capacity and max attempts must be non-zero");
        }
        if self.ingress.channel_capacity == 0 || self.ingress.startup_connect_attempts == 0 {
            bail!("ingress channel capacity and startup attempts must be non-zero");
        }
        if self.alerts.channel_capacity == 0 {
            bail!("alert channel capacity must be non-zero");
        }
        Ok(())
    }

    /// Configured rules, or the built-in defaults when none are listed.
    pub fn effective_rules(&self) -> Vec<AlertRule> {
        if self.alerts.rules.is_empty() {
            AlertRule::defaults()
        } else {
            self.alerts.rules.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    #[default]
    Stdin,
    Jsonl {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    pub channel_capacity: usize,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub startup_connect_attempts: u32,
    /// Size of the recent `event_id` set; 0 disables suppression.
    pub dedup_capacity: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            startup_connect_attempts: 5,
            dedup_capacity: 0,
        }
    }
}

impl IngressConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub window_secs: u64,
    pub bucket_secs: u64,
    pub tick_secs: u64,
    /// Maximum latency samples retained per sub-bucket.
    pub sample_cap: usize,
    pub snapshot_queue_capacity: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            bucket_secs: 5,
            tick_secs: 5,
            sample_cap: 2_048,
            snapshot_queue_capacity: 64,
        }
    }
}

impl AggregationConfig {
    pub fn bucket_count(&self) -> usize {
        (self.window_secs / self.bucket_secs) as usize
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub cache_ttl_secs: u64,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub queue_capacity: usize,
    pub sqlite_path: PathBuf,
    pub retention_days: u32,
    pub history_limit: usize,
    pub flush_grace_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout_ms: 5_000,
            cache_ttl_secs: 300,
            max_attempts: 3,
            retry_base_ms: 200,
            queue_capacity: 10_000,
            sqlite_path: PathBuf::from("pulsemeter.db"),
            retention_days: 30,
            history_limit: 1_000,
            flush_grace_secs: 10,
        }
    }
}

impl PersistenceConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn flush_grace(&self) -> Duration {
        Duration::from_secs(self.flush_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub rules: Vec<AlertRule>,
    /// Minimum time after a resolution before the same rule/key may trigger again.
    pub retrigger_debounce_secs: u64,
    pub history_size: usize,
    pub channel_capacity: usize,
    pub webhook_url: Option<String>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            retrigger_debounce_secs: 0,
            history_size: 1_000,
            channel_capacity: 1_024,
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_secs: 10 }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}
