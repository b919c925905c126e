use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

use super::orders::OrderView;
use super::{tag, AppState};
use crate::error::AppError;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct ManualRefundQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualRefundQueue {
    pub count: usize,
    pub orders: Vec<OrderView>,
}

/// GET /admin/refunds/manual
///
/// Orders whose refund gave up and now need an operator.
pub async fn manual_refunds(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ManualRefundQuery>,
) -> Result<Json<ManualRefundQueue>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let orders = state
        .engine
        .ledger
        .manual_review_queue(limit)
        .await
        .map_err(|e| tag(&headers)(e.into()))?;

    Ok(Json(ManualRefundQueue {
        count: orders.len(),
        orders: orders.into_iter().map(OrderView::from).collect(),
    }))
}
