use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use tracing::debug;

use super::{tag, AppState};
use crate::error::AppError;

/// POST /webhooks/payment
///
/// The raw body is handed over untouched; the signature covers its exact
/// bytes. Processing runs on its own task so a provider that hangs up
/// mid-request cannot strand the event's idempotency key in flight.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let signature = headers
        .get(state.engine.gateway.signature_header())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    debug!(bytes = body.len(), has_signature = signature.is_some(), "payment webhook received");

    let webhooks = state.engine.webhooks.clone();
    let response = tokio::spawn(async move { webhooks.process(&body, signature.as_deref()).await })
        .await
        .map_err(|e| tag(&headers)(AppError::internal(format!("webhook task failed: {}", e))))?
        .map_err(tag(&headers))?;

    Ok(response.into_response())
}
