//! Order ledger: creation, lookups and compare-and-swap state transitions.
//!
//! Every status change in the system goes through [`OrderLedger::transition_with`],
//! which checks the edge against the lifecycle DAG and then performs a single
//! conditional write on `(status, version)`. A lost race surfaces as
//! [`LedgerError::Conflict`] carrying the row's current status and version.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::database::order_repository::{
    Order, OrderPatch, OrderRepository, OrderScan, OrderStatus,
};
use crate::database::payment_session_repository::PaymentSessionRepository;
use crate::error::{AppError, AppErrorKind, DomainError, ValidationError};
use crate::logging::mask_player_id;
use crate::services::catalog::Catalog;

const MAX_ID_LEN: usize = 64;
const EXPIRY_BATCH_SIZE: i64 = 500;
const CURRENCY: &str = "IDR";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown product {game_id}/{denom_code}")]
    UnknownProduct { game_id: String, denom_code: String },

    #[error("order {order_id} not found")]
    NotFound { order_id: String },

    #[error("order {order_id} changed: expected version {expected_version}, now {current_status} v{current_version}")]
    Conflict {
        order_id: String,
        expected_version: i64,
        current_status: OrderStatus,
        current_version: i64,
    },

    #[error("transition {from} -> {to} is not allowed for order {order_id}")]
    InvalidTransition {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl LedgerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict { .. })
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::MissingField(field) => AppError::missing_field(field),
            LedgerError::InvalidField { field, reason } => {
                AppError::new(AppErrorKind::Validation(ValidationError::InvalidValue {
                    field: field.to_string(),
                    reason,
                }))
            }
            LedgerError::UnknownProduct {
                game_id,
                denom_code,
            } => AppError::new(AppErrorKind::Validation(ValidationError::UnknownProduct {
                game_id,
                denom_code,
            })),
            LedgerError::NotFound { order_id } => AppError::order_not_found(order_id),
            LedgerError::Conflict {
                order_id,
                expected_version,
                current_status,
                current_version,
            } => AppError::new(AppErrorKind::Domain(DomainError::Conflict {
                order_id,
                expected_version,
                current_version,
                current_status,
            })),
            err @ LedgerError::InvalidTransition { .. } => AppError::internal(err.to_string()),
            LedgerError::Database(err) => err.into(),
        }
    }
}

/// Input of `POST /orders`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    #[serde(default)]
    pub game_id: String,
    #[serde(default)]
    pub denom_code: String,
    #[serde(default)]
    pub player_id: String,
    #[serde(default)]
    pub server_id: Option<String>,
}

fn required(value: &str, field: &'static str) -> Result<String, LedgerError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::MissingField(field));
    }
    if trimmed.len() > MAX_ID_LEN {
        return Err(LedgerError::InvalidField {
            field,
            reason: format!("must be at most {} characters", MAX_ID_LEN),
        });
    }
    Ok(trimmed.to_string())
}

pub struct OrderLedger {
    orders: Arc<dyn OrderRepository>,
    sessions: Arc<dyn PaymentSessionRepository>,
    catalog: Arc<Catalog>,
}

impl OrderLedger {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        sessions: Arc<dyn PaymentSessionRepository>,
        catalog: Arc<Catalog>,
    ) -> Self {
        Self {
            orders,
            sessions,
            catalog,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn create_order(&self, input: NewOrder) -> Result<Order, LedgerError> {
        let game_id = required(&input.game_id, "gameId")?;
        let denom_code = required(&input.denom_code, "denomCode")?;
        let player_id = required(&input.player_id, "playerId")?;
        let server_id = match input.server_id.as_deref().map(str::trim) {
            Some("") | None => None,
            Some(server) => Some(required(server, "serverId")?),
        };

        let amount = self
            .catalog
            .price_for(&game_id, &denom_code)
            .ok_or_else(|| LedgerError::UnknownProduct {
                game_id: game_id.clone(),
                denom_code: denom_code.clone(),
            })?;

        let now = Utc::now();
        let order = Order {
            id: format!("ord_{}", Uuid::new_v4().simple()),
            game_id,
            denom_code,
            player_id,
            server_id,
            amount,
            currency: CURRENCY.to_string(),
            status: OrderStatus::PendingPayment,
            payment_ref: None,
            fulfillment_attempts: 0,
            refund_attempts: 0,
            next_retry_at: None,
            last_error: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
            version: 1,
        };

        self.orders.insert(&order).await?;

        info!(
            order_id = %order.id,
            game_id = %order.game_id,
            denom_code = %order.denom_code,
            player_id = %mask_player_id(&order.player_id),
            amount = order.amount,
            "order created"
        );

        Ok(order)
    }

    pub async fn get(&self, order_id: &str) -> Result<Order, LedgerError> {
        self.orders
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound {
                order_id: order_id.to_string(),
            })
    }

    pub async fn transition(
        &self,
        order_id: &str,
        expected_version: i64,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> Result<Order, LedgerError> {
        self.transition_with(order_id, expected_version, from, to, OrderPatch::default())
            .await
    }

    /// CAS `from -> to` together with field updates. Reaching `PAID` stamps
    /// `paid_at` unless the patch already carries one.
    pub async fn transition_with(
        &self,
        order_id: &str,
        expected_version: i64,
        from: &[OrderStatus],
        to: OrderStatus,
        mut patch: OrderPatch,
    ) -> Result<Order, LedgerError> {
        if let Some(bad) = from.iter().find(|s| !s.can_transition_to(to)) {
            return Err(LedgerError::InvalidTransition {
                order_id: order_id.to_string(),
                from: *bad,
                to,
            });
        }
        if from.is_empty() {
            return Err(LedgerError::InvalidTransition {
                order_id: order_id.to_string(),
                from: to,
                to,
            });
        }

        if to == OrderStatus::Paid && patch.paid_at.is_none() {
            patch.paid_at = Some(Utc::now());
        }

        match self
            .orders
            .compare_and_swap(order_id, expected_version, from, to, &patch)
            .await?
        {
            Some(order) => {
                info!(
                    order_id = %order.id,
                    to = %to,
                    version = order.version,
                    "order transitioned"
                );
                Ok(order)
            }
            None => Err(self.explain_miss(order_id, expected_version).await),
        }
    }

    /// CAS write that keeps the status unchanged.
    pub async fn update_fields(
        &self,
        order_id: &str,
        expected_version: i64,
        status: OrderStatus,
        patch: OrderPatch,
    ) -> Result<Order, LedgerError> {
        match self
            .orders
            .compare_and_swap(order_id, expected_version, &[status], status, &patch)
            .await?
        {
            Some(order) => Ok(order),
            None => Err(self.explain_miss(order_id, expected_version).await),
        }
    }

    async fn explain_miss(&self, order_id: &str, expected_version: i64) -> LedgerError {
        match self.orders.find_by_id(order_id).await {
            Ok(Some(current)) => {
                debug!(
                    order_id = %order_id,
                    expected_version,
                    current_version = current.version,
                    current_status = %current.status,
                    "order CAS lost"
                );
                LedgerError::Conflict {
                    order_id: order_id.to_string(),
                    expected_version,
                    current_status: current.status,
                    current_version: current.version,
                }
            }
            Ok(None) => LedgerError::NotFound {
                order_id: order_id.to_string(),
            },
            Err(err) => LedgerError::Database(err),
        }
    }

    /// Moves `PENDING_PAYMENT` orders older than `age` to `EXPIRED` and
    /// expires their open sessions. Orders that changed meanwhile are skipped.
    pub async fn expire_pending_older_than(&self, age: Duration) -> Result<u64, LedgerError> {
        let age = chrono::Duration::from_std(age).map_err(|e| LedgerError::InvalidField {
            field: "age",
            reason: e.to_string(),
        })?;
        let cutoff = Utc::now() - age;

        let stale = self
            .orders
            .find_by_status(
                &[OrderStatus::PendingPayment],
                OrderScan::CreatedBefore(cutoff),
                EXPIRY_BATCH_SIZE,
            )
            .await?;

        let mut expired = 0u64;
        for order in stale {
            match self
                .transition(
                    &order.id,
                    order.version,
                    &[OrderStatus::PendingPayment],
                    OrderStatus::Expired,
                )
                .await
            {
                Ok(_) => {
                    expired += 1;
                    if let Err(e) = self.sessions.expire_active_for_order(&order.id).await {
                        warn!(order_id = %order.id, error = %e, "failed to expire payment session");
                    }
                }
                Err(err) if err.is_conflict() => {
                    debug!(order_id = %order.id, "order changed before expiry, skipping");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(expired)
    }

    pub async fn find_due(
        &self,
        statuses: &[OrderStatus],
        scan: OrderScan,
        limit: i64,
    ) -> Result<Vec<Order>, LedgerError> {
        Ok(self.orders.find_by_status(statuses, scan, limit).await?)
    }

    /// Orders whose refund could not be completed automatically.
    pub async fn manual_review_queue(&self, limit: i64) -> Result<Vec<Order>, LedgerError> {
        self.find_due(&[OrderStatus::RefundFailedManual], OrderScan::Any, limit)
            .await
    }
}
