//! Health check aggregation.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Health status for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Healthy,
            1 => Self::Degraded,
            _ => Self::Unhealthy,
        }
    }
}

/// Component health state.
#[derive(Debug)]
pub struct ComponentHealth {
    name: &'static str,
    status: AtomicU8,
    message: parking_lot::RwLock<Option<String>>,
}

impl ComponentHealth {
    /// Components start unhealthy until their first successful call.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            status: AtomicU8::new(2),
            message: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_healthy(&self) {
        self.status
            .store(HealthStatus::Healthy.to_u8(), Ordering::Relaxed);
        *self.message.write() = None;
    }

    /// Reachable but failing some operations (e.g. a batch awaiting retry).
    pub fn set_degraded(&self, msg: impl Into<String>) {
        self.status
            .store(HealthStatus::Degraded.to_u8(), Ordering::Relaxed);
        *self.message.write() = Some(msg.into());
    }

    pub fn set_unhealthy(&self, msg: impl Into<String>) {
        self.status
            .store(HealthStatus::Unhealthy.to_u8(), Ordering::Relaxed);
        *self.message.write() = Some(msg.into());
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    pub fn is_healthy(&self) -> bool {
        self.status().is_healthy()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn message(&self) -> Option<String> {
        self.message.read().clone()
    }

    fn report(&self) -> ComponentHealthReport {
        ComponentHealthReport {
            name: self.name.to_string(),
            status: self.status(),
            message: self.message(),
        }
    }
}

/// Aggregated health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealthReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealthReport {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

/// Health of the pipeline's two collaborators.
#[derive(Debug)]
pub struct HealthRegistry {
    pub storage: ComponentHealth,
    pub source: ComponentHealth,
}

impl HealthRegistry {
    pub const fn new() -> Self {
        Self {
            storage: ComponentHealth::new("storage"),
            source: ComponentHealth::new("source"),
        }
    }

    /// Generate a health report.
    pub fn report(&self) -> HealthReport {
        let components = vec![self.storage.report(), self.source.report()];

        let all_healthy = components.iter().all(|c| c.status.is_healthy());
        let any_serving = components.iter().any(|c| c.status.is_serving());

        let status = if all_healthy {
            HealthStatus::Healthy
        } else if any_serving {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport { status, components }
    }

    /// Storage is accepting commits.
    pub fn is_ready(&self) -> bool {
        self.storage.is_healthy()
    }

    /// Check if the service is alive.
    pub fn is_alive(&self) -> bool {
        true
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}
