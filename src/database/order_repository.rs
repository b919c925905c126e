use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::database::error::DatabaseError;

/// Lifecycle of a top-up order.
///
/// ```text
/// PENDING_PAYMENT ─┬─> PAID ──> FULFILLING ──> FULFILLED
///                  ├─> EXPIRED        │  ^
///                  └─> PAYMENT_FAILED │  └── FAILED_RETRY
///                                     v          │
///                                 REFUNDING <────┘
///                                  ├─> FAILED_REFUNDED
///                                  └─> REFUND_FAILED_MANUAL
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    PendingPayment,
    Paid,
    Fulfilling,
    FailedRetry,
    Refunding,
    Fulfilled,
    Expired,
    PaymentFailed,
    FailedRefunded,
    RefundFailedManual,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "PENDING_PAYMENT",
            OrderStatus::Paid => "PAID",
            OrderStatus::Fulfilling => "FULFILLING",
            OrderStatus::FailedRetry => "FAILED_RETRY",
            OrderStatus::Refunding => "REFUNDING",
            OrderStatus::Fulfilled => "FULFILLED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::PaymentFailed => "PAYMENT_FAILED",
            OrderStatus::FailedRefunded => "FAILED_REFUNDED",
            OrderStatus::RefundFailedManual => "REFUND_FAILED_MANUAL",
        }
    }

    /// Edges of the lifecycle DAG. `FAILED_RETRY -> FULFILLING` is the only
    /// edge that revisits an earlier state.
    pub fn valid_transitions(&self) -> &'static [OrderStatus] {
        match self {
            OrderStatus::PendingPayment => &[
                OrderStatus::Paid,
                OrderStatus::Expired,
                OrderStatus::PaymentFailed,
            ],
            OrderStatus::Paid => &[OrderStatus::Fulfilling],
            OrderStatus::Fulfilling => &[
                OrderStatus::Fulfilled,
                OrderStatus::FailedRetry,
                OrderStatus::Refunding,
            ],
            OrderStatus::FailedRetry => &[OrderStatus::Fulfilling, OrderStatus::Refunding],
            OrderStatus::Refunding => &[
                OrderStatus::FailedRefunded,
                OrderStatus::RefundFailedManual,
            ],
            OrderStatus::Fulfilled
            | OrderStatus::Expired
            | OrderStatus::PaymentFailed
            | OrderStatus::FailedRefunded
            | OrderStatus::RefundFailedManual => &[],
        }
    }

    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING_PAYMENT" => Ok(OrderStatus::PendingPayment),
            "PAID" => Ok(OrderStatus::Paid),
            "FULFILLING" => Ok(OrderStatus::Fulfilling),
            "FAILED_RETRY" => Ok(OrderStatus::FailedRetry),
            "REFUNDING" => Ok(OrderStatus::Refunding),
            "FULFILLED" => Ok(OrderStatus::Fulfilled),
            "EXPIRED" => Ok(OrderStatus::Expired),
            "PAYMENT_FAILED" => Ok(OrderStatus::PaymentFailed),
            "FAILED_REFUNDED" => Ok(OrderStatus::FailedRefunded),
            "REFUND_FAILED_MANUAL" => Ok(OrderStatus::RefundFailedManual),
            other => Err(DatabaseError::decode(format!(
                "unknown order status '{}'",
                other
            ))),
        }
    }
}

/// Order entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub id: String,
    pub game_id: String,
    pub denom_code: String,
    pub player_id: String,
    pub server_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub payment_ref: Option<String>,
    pub fulfillment_attempts: i32,
    pub refund_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

/// Field updates applied together with a compare-and-swap.
///
/// `None` leaves a column untouched; the nested options on `next_retry_at`
/// and `last_error` allow clearing them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderPatch {
    pub payment_ref: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub add_fulfillment_attempt: bool,
    pub add_refund_attempt: bool,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
}

impl OrderPatch {
    /// Apply the patch and the target status to an in-memory order.
    pub fn apply(&self, order: &mut Order, status: OrderStatus, now: DateTime<Utc>) {
        order.status = status;
        if let Some(payment_ref) = &self.payment_ref {
            order.payment_ref = Some(payment_ref.clone());
        }
        if let Some(paid_at) = self.paid_at {
            order.paid_at = Some(paid_at);
        }
        if self.add_fulfillment_attempt {
            order.fulfillment_attempts += 1;
        }
        if self.add_refund_attempt {
            order.refund_attempts += 1;
        }
        if let Some(next_retry_at) = self.next_retry_at {
            order.next_retry_at = next_retry_at;
        }
        if let Some(last_error) = &self.last_error {
            order.last_error = last_error.clone();
        }
        order.updated_at = order.updated_at.max(now);
        order.version += 1;
    }
}

/// Time-based filters used by the background sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderScan {
    CreatedBefore(DateTime<Utc>),
    PaidBefore(DateTime<Utc>),
    RetryDueBy(DateTime<Utc>),
    Any,
}

impl OrderScan {
    pub fn matches(&self, order: &Order) -> bool {
        match self {
            OrderScan::CreatedBefore(cutoff) => order.created_at < *cutoff,
            OrderScan::PaidBefore(cutoff) => order.paid_at.map_or(false, |t| t < *cutoff),
            OrderScan::RetryDueBy(now) => order.next_retry_at.map_or(false, |t| t <= *now),
            OrderScan::Any => true,
        }
    }
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn insert(&self, order: &Order) -> Result<(), DatabaseError>;

    async fn find_by_id(&self, order_id: &str) -> Result<Option<Order>, DatabaseError>;

    /// Atomically move `order_id` to `to` when its version equals
    /// `expected_version` and its status is one of `from`. Returns `None`
    /// when the guard does not hold (including a missing order).
    async fn compare_and_swap(
        &self,
        order_id: &str,
        expected_version: i64,
        from: &[OrderStatus],
        to: OrderStatus,
        patch: &OrderPatch,
    ) -> Result<Option<Order>, DatabaseError>;

    async fn find_by_status(
        &self,
        statuses: &[OrderStatus],
        scan: OrderScan,
        limit: i64,
    ) -> Result<Vec<Order>, DatabaseError>;
}

#[cfg(feature = "database")]
pub use postgres::PgOrderRepository;

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use sqlx::{FromRow, PgPool};

    const ORDER_COLUMNS: &str = "id, game_id, denom_code, player_id, server_id, amount, currency, \
         status, payment_ref, fulfillment_attempts, refund_attempts, next_retry_at, last_error, \
         paid_at, created_at, updated_at, version";

    #[derive(Debug, FromRow)]
    struct OrderRow {
        id: String,
        game_id: String,
        denom_code: String,
        player_id: String,
        server_id: Option<String>,
        amount: i64,
        currency: String,
        status: String,
        payment_ref: Option<String>,
        fulfillment_attempts: i32,
        refund_attempts: i32,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: Option<String>,
        paid_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        version: i64,
    }

    impl TryFrom<OrderRow> for Order {
        type Error = DatabaseError;

        fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
            Ok(Order {
                status: row.status.parse()?,
                id: row.id,
                game_id: row.game_id,
                denom_code: row.denom_code,
                player_id: row.player_id,
                server_id: row.server_id,
                amount: row.amount,
                currency: row.currency,
                payment_ref: row.payment_ref,
                fulfillment_attempts: row.fulfillment_attempts,
                refund_attempts: row.refund_attempts,
                next_retry_at: row.next_retry_at,
                last_error: row.last_error,
                paid_at: row.paid_at,
                created_at: row.created_at,
                updated_at: row.updated_at,
                version: row.version,
            })
        }
    }

    fn status_names(statuses: &[OrderStatus]) -> Vec<String> {
        statuses.iter().map(|s| s.as_str().to_string()).collect()
    }

    /// Postgres-backed order ledger storage
    pub struct PgOrderRepository {
        pool: PgPool,
    }

    impl PgOrderRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl OrderRepository for PgOrderRepository {
        async fn insert(&self, order: &Order) -> Result<(), DatabaseError> {
            sqlx::query(
                "INSERT INTO orders
                 (id, game_id, denom_code, player_id, server_id, amount, currency, status,
                  fulfillment_attempts, refund_attempts, created_at, updated_at, version)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            )
            .bind(&order.id)
            .bind(&order.game_id)
            .bind(&order.denom_code)
            .bind(&order.player_id)
            .bind(&order.server_id)
            .bind(order.amount)
            .bind(&order.currency)
            .bind(order.status.as_str())
            .bind(order.fulfillment_attempts)
            .bind(order.refund_attempts)
            .bind(order.created_at)
            .bind(order.updated_at)
            .bind(order.version)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            Ok(())
        }

        async fn find_by_id(&self, order_id: &str) -> Result<Option<Order>, DatabaseError> {
            let row = sqlx::query_as::<_, OrderRow>(&format!(
                "SELECT {} FROM orders WHERE id = $1",
                ORDER_COLUMNS
            ))
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            row.map(Order::try_from).transpose()
        }

        async fn compare_and_swap(
            &self,
            order_id: &str,
            expected_version: i64,
            from: &[OrderStatus],
            to: OrderStatus,
            patch: &OrderPatch,
        ) -> Result<Option<Order>, DatabaseError> {
            let row = sqlx::query_as::<_, OrderRow>(&format!(
                "UPDATE orders SET
                    status = $4,
                    payment_ref = COALESCE($5, payment_ref),
                    paid_at = COALESCE($6::timestamptz, paid_at),
                    fulfillment_attempts = fulfillment_attempts + $7,
                    refund_attempts = refund_attempts + $8,
                    next_retry_at = CASE WHEN $9 THEN $10::timestamptz ELSE next_retry_at END,
                    last_error = CASE WHEN $11 THEN $12::text ELSE last_error END,
                    updated_at = GREATEST(NOW(), updated_at),
                    version = version + 1
                 WHERE id = $1 AND version = $2 AND status = ANY($3)
                 RETURNING {}",
                ORDER_COLUMNS
            ))
            .bind(order_id)
            .bind(expected_version)
            .bind(status_names(from))
            .bind(to.as_str())
            .bind(&patch.payment_ref)
            .bind(patch.paid_at)
            .bind(i32::from(patch.add_fulfillment_attempt))
            .bind(i32::from(patch.add_refund_attempt))
            .bind(patch.next_retry_at.is_some())
            .bind(patch.next_retry_at.flatten())
            .bind(patch.last_error.is_some())
            .bind(patch.last_error.clone().flatten())
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            row.map(Order::try_from).transpose()
        }

        async fn find_by_status(
            &self,
            statuses: &[OrderStatus],
            scan: OrderScan,
            limit: i64,
        ) -> Result<Vec<Order>, DatabaseError> {
            let (filter, cutoff) = match scan {
                OrderScan::CreatedBefore(t) => ("created_at < $2", Some(t)),
                OrderScan::PaidBefore(t) => ("paid_at IS NOT NULL AND paid_at < $2", Some(t)),
                OrderScan::RetryDueBy(t) => {
                    ("next_retry_at IS NOT NULL AND next_retry_at <= $2", Some(t))
                }
                OrderScan::Any => ("($2::timestamptz IS NULL)", None),
            };

            let rows = sqlx::query_as::<_, OrderRow>(&format!(
                "SELECT {} FROM orders
                 WHERE status = ANY($1) AND {}
                 ORDER BY updated_at ASC
                 LIMIT $3",
                ORDER_COLUMNS, filter
            ))
            .bind(status_names(statuses))
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            rows.into_iter().map(Order::try_from).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order() -> Order {
        let now = Utc::now();
        Order {
            id: "ord_1".to_string(),
            game_id: "mlbb".to_string(),
            denom_code: "86dm".to_string(),
            player_id: "12345".to_string(),
            server_id: None,
            amount: 20_000,
            currency: "IDR".to_string(),
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
        }
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            OrderStatus::PendingPayment,
            OrderStatus::FailedRetry,
            OrderStatus::RefundFailedManual,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("SHIPPED".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        assert!(OrderStatus::Fulfilled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(OrderStatus::PaymentFailed.is_terminal());
        assert!(OrderStatus::FailedRefunded.is_terminal());
        assert!(OrderStatus::RefundFailedManual.is_terminal());
        assert!(!OrderStatus::FailedRetry.is_terminal());
    }

    #[test]
    fn only_retry_edge_goes_backwards() {
        assert!(OrderStatus::FailedRetry.can_transition_to(OrderStatus::Fulfilling));
        assert!(!OrderStatus::Paid.can_transition_to(OrderStatus::PendingPayment));
        assert!(!OrderStatus::Fulfilling.can_transition_to(OrderStatus::Paid));
        assert!(!OrderStatus::PendingPayment.can_transition_to(OrderStatus::Fulfilling));
    }

    #[test]
    fn patch_bumps_version_and_keeps_updated_at_monotonic() {
        let mut order = sample_order();
        let earlier = order.updated_at - chrono::Duration::seconds(30);
        let patch = OrderPatch {
            add_fulfillment_attempt: true,
            last_error: Some(Some("timeout".to_string())),
            ..Default::default()
        };

        patch.apply(&mut order, OrderStatus::Fulfilling, earlier);

        assert_eq!(order.version, 2);
        assert_eq!(order.fulfillment_attempts, 1);
        assert_eq!(order.status, OrderStatus::Fulfilling);
        assert_eq!(order.last_error.as_deref(), Some("timeout"));
        assert!(order.updated_at > earlier);
    }

    #[test]
    fn scan_filters_on_the_right_timestamp() {
        let mut order = sample_order();
        let later = order.created_at + chrono::Duration::minutes(5);

        assert!(OrderScan::CreatedBefore(later).matches(&order));
        assert!(!OrderScan::PaidBefore(later).matches(&order));
        assert!(!OrderScan::RetryDueBy(later).matches(&order));

        order.next_retry_at = Some(order.created_at);
        assert!(OrderScan::RetryDueBy(later).matches(&order));
    }
}
