use std::env;
use std::path::{Path, PathBuf};

use tracing::info;
use tracing_subscriber::EnvFilter;

use pulsemeter::domain::{LogFormat, LoggingConfig};
use pulsemeter::wiring::build_ports;
use pulsemeter::{Pipeline, PulsemeterConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = config_path();
    let config = PulsemeterConfig::load_from_path(&config_path)?;
    init_tracing(&config.logging);
    info!(config = %config_path.display(), "pulsemeter starting");

    let ports = build_ports(&config)?;
    let pipeline = Pipeline::new(config, ports);
    pipeline.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    pipeline.shutdown().await;

    let stats = pipeline.stats();
    info!(
        consumed = stats.ingress.consumed,
        dead_lettered = stats.ingress.dead_lettered,
        rows_written = stats.persistence.rows_written,
        rows_lost = stats.persistence.rows_lost,
        alerts_triggered = stats.alerts.triggered_total,
        "pulsemeter stopped"
    );
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

fn config_path() -> PathBuf {
    if let Ok(path) = env::var("PULSEMETER_CONFIG_PATH") {
        return PathBuf::from(path);
    }

    if let Ok(home) = env::var("HOME") {
        return Path::new(&home).join(".pulsemeter").join("config.yaml");
    }

    PathBuf::from("pulsemeter-config.yaml")
}
