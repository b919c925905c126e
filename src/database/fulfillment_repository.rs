use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::database::error::DatabaseError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "SUCCESS",
            AttemptOutcome::TransientFailure => "TRANSIENT_FAILURE",
            AttemptOutcome::PermanentFailure => "PERMANENT_FAILURE",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "SUCCESS" => Ok(AttemptOutcome::Success),
            "TRANSIENT_FAILURE" => Ok(AttemptOutcome::TransientFailure),
            "PERMANENT_FAILURE" => Ok(AttemptOutcome::PermanentFailure),
            other => Err(DatabaseError::decode(format!(
                "unknown attempt outcome '{}'",
                other
            ))),
        }
    }
}

/// One publisher call for an order. Immutable once `completed_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FulfillmentAttempt {
    pub order_id: String,
    pub attempt_number: i32,
    pub publisher: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<AttemptOutcome>,
    pub detail: Option<String>,
}

#[async_trait]
pub trait FulfillmentAttemptRepository: Send + Sync {
    /// Inserts the attempt row; a second insert of the same
    /// `(order_id, attempt_number)` fails with a unique violation.
    async fn start(&self, attempt: &FulfillmentAttempt) -> Result<(), DatabaseError>;

    /// Records the outcome once. Returns `false` if the attempt was already
    /// completed or does not exist.
    async fn complete(
        &self,
        order_id: &str,
        attempt_number: i32,
        outcome: AttemptOutcome,
        detail: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    async fn list_for_order(&self, order_id: &str)
        -> Result<Vec<FulfillmentAttempt>, DatabaseError>;
}

#[cfg(feature = "database")]
pub use postgres::PgFulfillmentAttemptRepository;

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use sqlx::{FromRow, PgPool};

    #[derive(Debug, FromRow)]
    struct AttemptRow {
        order_id: String,
        attempt_number: i32,
        publisher: String,
        started_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
        outcome: Option<String>,
        detail: Option<String>,
    }

    impl TryFrom<AttemptRow> for FulfillmentAttempt {
        type Error = DatabaseError;

        fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
            Ok(FulfillmentAttempt {
                outcome: row.outcome.as_deref().map(str::parse).transpose()?,
                order_id: row.order_id,
                attempt_number: row.attempt_number,
                publisher: row.publisher,
                started_at: row.started_at,
                completed_at: row.completed_at,
                detail: row.detail,
            })
        }
    }

    pub struct PgFulfillmentAttemptRepository {
        pool: PgPool,
    }

    impl PgFulfillmentAttemptRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl FulfillmentAttemptRepository for PgFulfillmentAttemptRepository {
        async fn start(&self, attempt: &FulfillmentAttempt) -> Result<(), DatabaseError> {
            sqlx::query(
                "INSERT INTO fulfillment_attempts (order_id, attempt_number, publisher, started_at)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(&attempt.order_id)
            .bind(attempt.attempt_number)
            .bind(&attempt.publisher)
            .bind(attempt.started_at)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            Ok(())
        }

        async fn complete(
            &self,
            order_id: &str,
            attempt_number: i32,
            outcome: AttemptOutcome,
            detail: Option<&str>,
        ) -> Result<bool, DatabaseError> {
            let result = sqlx::query(
                "UPDATE fulfillment_attempts
                 SET completed_at = NOW(), outcome = $3, detail = $4
                 WHERE order_id = $1 AND attempt_number = $2 AND completed_at IS NULL",
            )
            .bind(order_id)
            .bind(attempt_number)
            .bind(outcome.as_str())
            .bind(detail)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            Ok(result.rows_affected() == 1)
        }

        async fn list_for_order(
            &self,
            order_id: &str,
        ) -> Result<Vec<FulfillmentAttempt>, DatabaseError> {
            let rows = sqlx::query_as::<_, AttemptRow>(
                "SELECT order_id, attempt_number, publisher, started_at, completed_at, outcome, detail
                 FROM fulfillment_attempts
                 WHERE order_id = $1
                 ORDER BY attempt_number ASC",
            )
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            rows.into_iter().map(FulfillmentAttempt::try_from).collect()
        }
    }
}
