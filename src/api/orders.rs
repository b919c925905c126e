use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{json_body, tag, with_client_key, AppState};
use crate::database::order_repository::{Order, OrderStatus};
use crate::error::AppError;
use crate::services::idempotency::StoredResponse;
use crate::services::order_ledger::NewOrder;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedResponse {
    pub order_id: String,
    pub status: OrderStatus,
    pub game_id: String,
    pub denom_code: String,
    pub player_id: String,
    pub server_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

impl From<Order> for OrderCreatedResponse {
    fn from(order: Order) -> Self {
        Self {
            order_id: order.id,
            status: order.status,
            game_id: order.game_id,
            denom_code: order.denom_code,
            player_id: order.player_id,
            server_id: order.server_id,
            amount: order.amount,
            currency: order.currency,
            created_at: order.created_at,
        }
    }
}

/// Full order state, as returned by `GET /orders/{id}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub order_id: String,
    pub status: OrderStatus,
    pub version: i64,
    pub game_id: String,
    pub denom_code: String,
    pub player_id: String,
    pub server_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub payment_ref: Option<String>,
    pub fulfillment_attempts: i32,
    pub refund_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Order> for OrderView {
    fn from(order: Order) -> Self {
        Self {
            order_id: order.id,
            status: order.status,
            version: order.version,
            game_id: order.game_id,
            denom_code: order.denom_code,
            player_id: order.player_id,
            server_id: order.server_id,
            amount: order.amount,
            currency: order.currency,
            payment_ref: order.payment_ref,
            fulfillment_attempts: order.fulfillment_attempts,
            refund_attempts: order.refund_attempts,
            next_retry_at: order.next_retry_at,
            last_error: order.last_error,
            paid_at: order.paid_at,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

/// POST /orders
pub async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<NewOrder>, JsonRejection>,
) -> Result<Response, AppError> {
    let input = json_body(payload).map_err(tag(&headers))?;

    let ledger = state.engine.ledger.clone();
    let response = with_client_key(&state, &headers, "order", || async move {
        let order = ledger.create_order(input).await?;
        let body = serde_json::to_value(OrderCreatedResponse::from(order))
            .map_err(|e| AppError::internal(e.to_string()))?;
        Ok(StoredResponse::new(201, body))
    })
    .await
    .map_err(tag(&headers))?;

    Ok(response.into_response())
}

/// GET /orders/{id}
pub async fn get_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
) -> Result<Json<OrderView>, AppError> {
    let order = state
        .engine
        .ledger
        .get(&order_id)
        .await
        .map_err(|e| tag(&headers)(e.into()))?;
    Ok(Json(order.into()))
}
