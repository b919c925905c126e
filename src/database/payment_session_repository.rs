use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::payments::types::PaymentMethod;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Confirmed,
    Expired,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Confirmed => "CONFIRMED",
            SessionStatus::Expired => "EXPIRED",
            SessionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(SessionStatus::Pending),
            "CONFIRMED" => Ok(SessionStatus::Confirmed),
            "EXPIRED" => Ok(SessionStatus::Expired),
            "FAILED" => Ok(SessionStatus::Failed),
            other => Err(DatabaseError::decode(format!(
                "unknown session status '{}'",
                other
            ))),
        }
    }
}

/// A checkout session opened with the payment provider for one order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentSession {
    pub id: Uuid,
    pub order_id: String,
    pub provider: String,
    pub provider_session_id: String,
    pub method: PaymentMethod,
    pub amount: i64,
    pub fee: i64,
    pub payment_url: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PaymentSession {
    pub fn total_amount(&self) -> i64 {
        self.amount + self.fee
    }

    pub fn is_usable(&self, method: PaymentMethod, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Pending && self.method == method && self.expires_at > now
    }
}

#[async_trait]
pub trait PaymentSessionRepository: Send + Sync {
    async fn insert(&self, session: &PaymentSession) -> Result<(), DatabaseError>;

    /// The PENDING session of an order, if any.
    async fn find_active_for_order(
        &self,
        order_id: &str,
    ) -> Result<Option<PaymentSession>, DatabaseError>;

    /// Moves a PENDING session to `status`; `false` if it was not pending.
    async fn settle(&self, session_id: Uuid, status: SessionStatus) -> Result<bool, DatabaseError>;

    /// Expires every PENDING session of the order, returning how many.
    async fn expire_active_for_order(&self, order_id: &str) -> Result<u64, DatabaseError>;

    async fn list_for_order(&self, order_id: &str) -> Result<Vec<PaymentSession>, DatabaseError>;
}

#[cfg(feature = "database")]
pub use postgres::PgPaymentSessionRepository;

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use sqlx::{FromRow, PgPool};

    const SESSION_COLUMNS: &str = "id, order_id, provider, provider_session_id, method, amount, \
         fee, payment_url, status, created_at, expires_at";

    #[derive(Debug, FromRow)]
    struct SessionRow {
        id: Uuid,
        order_id: String,
        provider: String,
        provider_session_id: String,
        method: String,
        amount: i64,
        fee: i64,
        payment_url: String,
        status: String,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    }

    impl TryFrom<SessionRow> for PaymentSession {
        type Error = DatabaseError;

        fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
            Ok(PaymentSession {
                method: row
                    .method
                    .parse()
                    .map_err(|e: crate::payments::error::PaymentError| {
                        DatabaseError::decode(e.to_string())
                    })?,
                status: row.status.parse()?,
                id: row.id,
                order_id: row.order_id,
                provider: row.provider,
                provider_session_id: row.provider_session_id,
                amount: row.amount,
                fee: row.fee,
                payment_url: row.payment_url,
                created_at: row.created_at,
                expires_at: row.expires_at,
            })
        }
    }

    pub struct PgPaymentSessionRepository {
        pool: PgPool,
    }

    impl PgPaymentSessionRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl PaymentSessionRepository for PgPaymentSessionRepository {
        async fn insert(&self, session: &PaymentSession) -> Result<(), DatabaseError> {
            sqlx::query(
                "INSERT INTO payment_sessions
                 (id, order_id, provider, provider_session_id, method, amount, fee,
                  payment_url, status, created_at, expires_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(session.id)
            .bind(&session.order_id)
            .bind(&session.provider)
            .bind(&session.provider_session_id)
            .bind(session.method.as_str())
            .bind(session.amount)
            .bind(session.fee)
            .bind(&session.payment_url)
            .bind(session.status.as_str())
            .bind(session.created_at)
            .bind(session.expires_at)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            Ok(())
        }

        async fn find_active_for_order(
            &self,
            order_id: &str,
        ) -> Result<Option<PaymentSession>, DatabaseError> {
            let row = sqlx::query_as::<_, SessionRow>(&format!(
                "SELECT {} FROM payment_sessions
                 WHERE order_id = $1 AND status = 'PENDING'
                 ORDER BY created_at DESC
                 LIMIT 1",
                SESSION_COLUMNS
            ))
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            row.map(PaymentSession::try_from).transpose()
        }

        async fn settle(
            &self,
            session_id: Uuid,
            status: SessionStatus,
        ) -> Result<bool, DatabaseError> {
            let result = sqlx::query(
                "UPDATE payment_sessions SET status = $2
                 WHERE id = $1 AND status = 'PENDING'",
            )
            .bind(session_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            Ok(result.rows_affected() == 1)
        }

        async fn expire_active_for_order(&self, order_id: &str) -> Result<u64, DatabaseError> {
            let result = sqlx::query(
                "UPDATE payment_sessions SET status = 'EXPIRED'
                 WHERE order_id = $1 AND status = 'PENDING'",
            )
            .bind(order_id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            Ok(result.rows_affected())
        }

        async fn list_for_order(
            &self,
            order_id: &str,
        ) -> Result<Vec<PaymentSession>, DatabaseError> {
            let rows = sqlx::query_as::<_, SessionRow>(&format!(
                "SELECT {} FROM payment_sessions WHERE order_id = $1 ORDER BY created_at ASC",
                SESSION_COLUMNS
            ))
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            rows.into_iter().map(PaymentSession::try_from).collect()
        }
    }
}
