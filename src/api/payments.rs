use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use tracing::info;

use super::{json_body, tag, with_client_key, AppState};
use crate::error::AppError;
use crate::payments::types::PaymentMethod;
use crate::services::idempotency::StoredResponse;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub method: Option<String>,
}

/// POST /payments
///
/// Session creation runs on its own task, so a client that disconnects does
/// not abandon a provider call that already went out.
pub async fn create_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<PaymentRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let request = json_body(payload).map_err(tag(&headers))?;
    let order_id = request.order_id.trim().to_string();
    if order_id.is_empty() {
        return Err(tag(&headers)(AppError::missing_field("orderId")));
    }
    let method = match request.method.as_deref() {
        Some(raw) => PaymentMethod::from_str(raw).map_err(|e| tag(&headers)(e.into()))?,
        None => PaymentMethod::default(),
    };

    let scope = format!("payment:{}", order_id);
    let gateway = state.engine.gateway.clone();
    let response = with_client_key(&state, &headers, &scope, || async move {
        let task_order_id = order_id.clone();
        let session = tokio::spawn(async move { gateway.create_session(&task_order_id, method).await })
            .await
            .map_err(|e| {
                AppError::internal(format!("payment task failed: {}", e))
                    .with_context(format!("orderId={}", order_id))
            })??;

        info!(
            order_id = %order_id,
            method = %session.method,
            provider = %session.provider,
            "payment session issued"
        );

        Ok(StoredResponse::new(
            200,
            json!({
                "orderId": session.order_id,
                "method": session.method,
                "paymentUrl": session.payment_url,
                "provider": session.provider,
                "status": session.status.as_str(),
                "amount": session.amount,
                "fee": session.fee,
                "totalAmount": session.total_amount(),
                "expiresAt": session.expires_at,
                "issuedAt": session.created_at,
            }),
        ))
    })
    .await
    .map_err(tag(&headers))?;

    Ok(response.into_response())
}
