//! Health check module
//! Provides health status for the application and its dependencies

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error};

use crate::services::idempotency::IdempotencyStore;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }
}

/// A dependency that can be pinged.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<(), String>;
}

/// Pings the idempotency store; without it no write endpoint can run.
pub struct IdempotencyProbe {
    store: Arc<dyn IdempotencyStore>,
}

impl IdempotencyProbe {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthProbe for IdempotencyProbe {
    fn name(&self) -> &str {
        "idempotency"
    }

    async fn check(&self) -> Result<(), String> {
        self.store.ping().await.map_err(|e| e.to_string())
    }
}

#[cfg(feature = "database")]
pub struct DatabaseProbe {
    pool: sqlx::PgPool,
}

#[cfg(feature = "database")]
impl DatabaseProbe {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl HealthProbe for DatabaseProbe {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> Result<(), String> {
        crate::database::health_check(&self.pool)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Health checker for the application
#[derive(Clone)]
pub struct HealthChecker {
    probes: Vec<Arc<dyn HealthProbe>>,
    probe_timeout: Duration,
}

impl HealthChecker {
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>) -> Self {
        Self {
            probes,
            probe_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Runs every probe under the timeout. Any failing probe makes the
    /// service unhealthy.
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();
        let mut overall_healthy = true;

        for probe in &self.probes {
            let start = Instant::now();
            let component = match timeout(self.probe_timeout, probe.check()).await {
                Ok(Ok(())) => {
                    let elapsed = start.elapsed().as_millis();
                    debug!(component = probe.name(), response_time_ms = elapsed, "health check ok");
                    ComponentHealth::up(Some(elapsed))
                }
                Ok(Err(e)) => {
                    overall_healthy = false;
                    error!(component = probe.name(), error = %e, "health check failed");
                    ComponentHealth::down(Some(e))
                }
                Err(_) => {
                    overall_healthy = false;
                    error!(component = probe.name(), "health check timed out");
                    ComponentHealth::down(Some("Timeout".to_string()))
                }
            };
            health_status
                .checks
                .insert(probe.name().to_string(), component);
        }

        health_status.status = if overall_healthy {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };

        health_status
    }
}
