//! Health reporting for in-memory components.
//!
//! Each registry component (deduplicators, caches, span recorder) reports a
//! [`ComponentHealth`]; the registry folds them into a [`HealthReport`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Health status for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Operating within its bounds.
    Healthy,
    /// Still serving, but a bound has been reached (bypass, eviction, drops).
    Degraded,
}

/// Health of one named component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    /// Counters worth surfacing (entries, pending, dropped, ...).
    pub details: BTreeMap<String, u64>,
}

impl ComponentHealth {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            details: BTreeMap::new(),
        }
    }

    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            details: BTreeMap::new(),
        }
    }

    /// Attach a counter.
    pub fn with_detail(mut self, key: impl Into<String>, value: u64) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Aggregated health across components. The worst component wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn from_components(components: Vec<ComponentHealth>) -> Self {
        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self { status, components }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.component == name)
    }
}
