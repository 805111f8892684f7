use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::{Metric, MetricKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
}

impl Operator {
    const EQ_TOLERANCE: f64 = 0.001;

    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => value > threshold,
            Operator::Lt => value < threshold,
            Operator::Ge => value >= threshold,
            Operator::Le => value <= threshold,
            Operator::Eq => (value - threshold).abs() < Self::EQ_TOLERANCE,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Eq => "==",
        };
        f.write_str(symbol)
    }
}

/// Which aggregation level a selector applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyLevel {
    #[default]
    Any,
    /// Only the system-wide rollup.
    Overall,
    Service,
    Endpoint,
}

/// Chooses which metric keys a rule is evaluated against.
///
/// No service and no endpoint matches every key, the overall rollup
/// included. A service restricts to that service (its service-level key and
/// all of its endpoints). An endpoint restricts to endpoint-level keys with
/// that path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySelector {
    pub service: Option<String>,
    pub endpoint: Option<String>,
    pub level: KeyLevel,
}

impl KeySelector {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, key: &MetricKey) -> bool {
        let level_ok = match self.level {
            KeyLevel::Any => true,
            KeyLevel::Overall => key.is_overall(),
            KeyLevel::Service => !key.is_endpoint() && !key.is_overall(),
            KeyLevel::Endpoint => key.is_endpoint(),
        };
        if !level_ok {
            return false;
        }
        if let Some(service) = &self.service {
            if service != &key.service_name {
                return false;
            }
        }
        match (&self.endpoint, &key.endpoint) {
            (None, _) => true,
            (Some(wanted), Some(actual)) => wanted == actual,
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub rule_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key_selector: KeySelector,
    pub metric: Metric,
    pub operator: Operator,
    pub threshold: f64,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_severity() -> Severity {
    Severity::Medium
}

fn default_enabled() -> bool {
    true
}

impl AlertRule {
    pub fn new(
        rule_id: impl Into<String>,
        metric: Metric,
        operator: Operator,
        threshold: f64,
    ) -> Self {
        let rule_id = rule_id.into();
        Self {
            name: rule_id.clone(),
            rule_id,
            key_selector: KeySelector::any(),
            metric,
            operator,
            threshold,
            severity: default_severity(),
            enabled: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_selector(mut self, selector: KeySelector) -> Self {
        self.key_selector = selector;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.rule_id
        } else {
            &self.name
        }
    }

    /// Rules applied when the configuration does not list any.
    pub fn defaults() -> Vec<AlertRule> {
        vec![
            AlertRule::new("high_error_rate", Metric::ErrorRate, Operator::Gt, 0.05)
                .with_name("High error rate")
                .with_severity(Severity::High),
            AlertRule::new("critical_error_rate", Metric::ErrorRate, Operator::Gt, 0.10)
                .with_name("Critical error rate")
                .with_severity(Severity::Critical),
            AlertRule::new("high_response_time", Metric::P95LatencyMs, Operator::Gt, 1000.0)
                .with_name("High p95 latency")
                .with_severity(Severity::Medium),
            AlertRule::new(
                "critical_response_time",
                Metric::P99LatencyMs,
                Operator::Gt,
                5000.0,
            )
            .with_name("Critical p99 latency")
            .with_severity(Severity::Critical),
            AlertRule::new("low_qps", Metric::Qps, Operator::Lt, 1.0)
                .with_name("Low request rate")
                .with_severity(Severity::Low),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Triggered,
    Resolved,
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertState::Triggered => f.write_str("triggered"),
            AlertState::Resolved => f.write_str("resolved"),
        }
    }
}

/// One breach episode of a rule on a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertInstance {
    pub alert_id: String,
    pub rule_id: String,
    pub key: MetricKey,
    pub state: AlertState,
    pub severity: Severity,
    pub message: String,
    pub current_value: f64,
    pub threshold: f64,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// State change published to the notification layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert_id: String,
    pub rule_id: String,
    pub key: MetricKey,
    pub state: AlertState,
    pub severity: Severity,
    pub message: String,
    pub current_value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    pub fn from_instance(instance: &AlertInstance, timestamp: DateTime<Utc>) -> Self {
        Self {
            alert_id: instance.alert_id.clone(),
            rule_id: instance.rule_id.clone(),
            key: instance.key.clone(),
            state: instance.state,
            severity: instance.severity,
            message: instance.message.clone(),
            current_value: instance.current_value,
            threshold: instance.threshold,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_semantics() {
        assert!(Operator::Gt.holds(600.0, 500.0));
        assert!(!Operator::Gt.holds(500.0, 500.0));
        assert!(Operator::Ge.holds(500.0, 500.0));
        assert!(Operator::Lt.holds(0.5, 1.0));
        assert!(Operator::Le.holds(1.0, 1.0));
        assert!(Operator::Eq.holds(1.0004, 1.0));
        assert!(!Operator::Eq.holds(1.01, 1.0));
    }

    #[test]
    fn test_selector_matching() {
        let service = MetricKey::service("a");
        let endpoint = MetricKey::endpoint("a", "/x");
        let other = MetricKey::endpoint("b", "/x");

        assert!(KeySelector::any().matches(&service));
        assert!(KeySelector::any().matches(&other));

        let by_service = KeySelector::service("a");
        assert!(by_service.matches(&service));
        assert!(by_service.matches(&endpoint));
        assert!(!by_service.matches(&other));

        let by_endpoint = KeySelector {
            endpoint: Some("/x".into()),
            ..KeySelector::default()
        };
        assert!(!by_endpoint.matches(&service));
        assert!(by_endpoint.matches(&endpoint));
        assert!(by_endpoint.matches(&other));

        let service_level = KeySelector {
            level: KeyLevel::Service,
            ..KeySelector::default()
        };
        assert!(service_level.matches(&service));
        assert!(!service_level.matches(&endpoint));
        assert!(!service_level.matches(&MetricKey::overall()));
    }

    #[test]
    fn test_overall_matches_only_unscoped_selectors() {
        let overall = MetricKey::overall();
        assert!(KeySelector::any().matches(&overall));
        assert!(!KeySelector::service("a").matches(&overall));
        assert!(!KeySelector {
            endpoint: Some("/x".into()),
            ..KeySelector::default()
        }
        .matches(&overall));

        let overall_only = KeySelector {
            level: KeyLevel::Overall,
            ..KeySelector::default()
        };
        assert!(overall_only.matches(&overall));
        assert!(!overall_only.matches(&MetricKey::service("a")));
    }

    #[test]
    fn test_rule_yaml_shape() {
        let rule: AlertRule = serde_yaml::from_str(
            "rule_id: slow\nmetric: avg_latency_ms\noperator: '>'\nthreshold: 500\nkey_selector:\n  service: a\n",
        )
        .unwrap();
        assert_eq!(rule.operator, Operator::Gt);
        assert_eq!(rule.metric, Metric::AvgLatencyMs);
        assert!(rule.enabled);
        assert_eq!(rule.severity, Severity::Medium);
        assert_eq!(rule.display_name(), "slow");
    }
}
