use axum::{extract::State, http::StatusCode, Json};
use tracing::{debug, error};

use super::AppState;
use crate::health::HealthStatus;

/// GET /health
pub async fn health(
    State(state): State<AppState>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    let health_status = state.health.check_health().await;

    if health_status.is_healthy() {
        debug!("health check passed");
        Ok(Json(health_status))
    } else {
        error!("health check failed - service unhealthy");
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(health_status)))
    }
}

/// GET /health/ready
pub async fn readiness(
    state: State<AppState>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    health(state).await
}

/// GET /health/live
pub async fn liveness() -> &'static str {
    "OK"
}
