//! Alert publishers for the outbound alert channel.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use pulsemeter_domain::{AlertEvent, AlertState, Severity};
use pulsemeter_ports::AlertPublisher;

/// Single-line human summary of an alert event.
pub fn format_alert(event: &AlertEvent) -> String {
    let verb = match event.state {
        AlertState::Triggered => "TRIGGERED",
        AlertState::Resolved => "RESOLVED",
    };
    format!("[{}] {} {}", event.severity, verb, event.message)
}

/// Writes every alert event to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

#[async_trait]
impl AlertPublisher for LogPublisher {
    async fn publish(&self, event: &AlertEvent) -> Result<()> {
        match (event.state, event.severity) {
            (AlertState::Triggered, Severity::High | Severity::Critical) => {
                warn!(alert_id = %event.alert_id, rule_id = %event.rule_id, key = %event.key, "{}", format_alert(event));
            }
            _ => {
                info!(alert_id = %event.alert_id, rule_id = %event.rule_id, key = %event.key, "{}", format_alert(event));
            }
        }
        Ok(())
    }
}

/// Fans alert events out to in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<AlertEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl AlertPublisher for BroadcastPublisher {
    async fn publish(&self, event: &AlertEvent) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    title: String,
    #[serde(flatten)]
    event: &'a AlertEvent,
}

/// POSTs each alert event as JSON to a configured URL.
#[derive(Debug, Clone)]
pub struct WebhookPublisher {
    client: reqwest::Client,
    url: String,
}

impl WebhookPublisher {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AlertPublisher for WebhookPublisher {
    async fn publish(&self, event: &AlertEvent) -> Result<()> {
        let body = WebhookBody {
            title: format_alert(event),
            event,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to reach webhook {}", self.url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("webhook {} answered {}", self.url, status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulsemeter_domain::MetricKey;

    fn event(state: AlertState) -> AlertEvent {
        AlertEvent {
            alert_id: "al-1".into(),
            rule_id: "slow".into(),
            key: MetricKey::endpoint("checkout", "/pay"),
            state,
            severity: Severity::Critical,
            message: "p99 is 5200".into(),
            current_value: 5200.0,
            threshold: 5000.0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_format_alert() {
        assert_eq!(
            format_alert(&event(AlertState::Triggered)),
            "[critical] TRIGGERED p99 is 5200"
        );
        assert!(format_alert(&event(AlertState::Resolved)).contains("RESOLVED"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let publisher = BroadcastPublisher::new(8);
        publisher.publish(&event(AlertState::Triggered)).await.unwrap();
        let mut rx = publisher.subscribe();
        publisher.publish(&event(AlertState::Resolved)).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.state, AlertState::Resolved);
    }

    #[tokio::test]
    async fn test_log_publisher_never_fails() {
        assert!(LogPublisher.publish(&event(AlertState::Triggered)).await.is_ok());
    }

    #[test]
    fn test_webhook_body_flattens_event() {
        let alert = event(AlertState::Triggered);
        let body = WebhookBody {
            title: format_alert(&alert),
            event: &alert,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["rule_id"], "slow");
        assert_eq!(value["state"], "triggered");
        assert_eq!(value["key"]["endpoint"], "/pay");
        assert!(value["title"].as_str().unwrap().starts_with("[critical]"));
    }
}
