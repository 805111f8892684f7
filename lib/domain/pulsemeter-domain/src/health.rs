use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    fn rank(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded(_) => 1,
            HealthStatus::Unhealthy(_) => 2,
        }
    }
}

/// Point-in-time health of every pipeline component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub components: BTreeMap<String, HealthStatus>,
}

impl HealthSnapshot {
    pub fn insert(&mut self, component: impl Into<String>, status: HealthStatus) {
        self.components.insert(component.into(), status);
    }

    pub fn get(&self, component: &str) -> Option<&HealthStatus> {
        self.components.get(component)
    }

    /// Worst status across components; healthy when empty.
    pub fn overall(&self) -> HealthStatus {
        self.components
            .values()
            .max_by_key(|status| status.rank())
            .cloned()
            .unwrap_or(HealthStatus::Healthy)
    }
}
