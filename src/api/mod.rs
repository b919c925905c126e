//! HTTP surface: orders, payments, webhooks, admin queues and health probes.

pub mod admin;
pub mod health;
pub mod orders;
pub mod payments;
pub mod webhooks;

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};

use crate::engine::Engine;
use crate::error::AppError;
use crate::health::HealthChecker;
use crate::middleware::error::get_request_id_from_headers;
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::services::idempotency::{run_idempotent, StoredResponse};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub health: HealthChecker,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/health/ready", get(health::readiness))
        .route("/health/live", get(health::liveness))
        .route("/orders", post(orders::create_order))
        .route("/orders/{id}", get(orders::get_order))
        .route("/payments", post(payments::create_payment))
        .route("/webhooks/payment", post(webhooks::payment_webhook))
        .route("/admin/refunds/manual", get(admin::manual_refunds))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

impl IntoResponse for StoredResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK);
        (status, Json(self.body)).into_response()
    }
}

/// Runs `op` through the idempotency store when the client sent an
/// `Idempotency-Key`, directly otherwise. Keys are namespaced by `scope`.
pub(crate) async fn with_client_key<F, Fut>(
    state: &AppState,
    headers: &HeaderMap,
    scope: &str,
    op: F,
) -> Result<StoredResponse, AppError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse, AppError>>,
{
    let client_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty());

    match client_key {
        Some(client_key) => {
            if client_key.len() > 128 {
                return Err(AppError::malformed("Idempotency-Key longer than 128 characters")
                    .with_context(IDEMPOTENCY_KEY_HEADER));
            }
            let key = format!("{}:{}", scope, client_key);
            run_idempotent(
                state.engine.idempotency.as_ref(),
                &key,
                &state.engine.idempotency_policy,
                op,
            )
            .await
        }
        None => op().await,
    }
}

/// Tags errors with the caller's request id.
pub(crate) fn tag(headers: &HeaderMap) -> impl Fn(AppError) -> AppError + '_ {
    move |err| match get_request_id_from_headers(headers) {
        Some(id) => err.with_request_id(id),
        None => err,
    }
}

pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::malformed(rejection.body_text()))
}
