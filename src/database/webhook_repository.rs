use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::database::error::DatabaseError;

/// Audit record of an inbound payment notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub order_id: Option<String>,
    pub raw_payload: String,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
}

impl WebhookEvent {
    pub fn received(event_id: &str, order_id: Option<&str>, raw_payload: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            order_id: order_id.map(str::to_string),
            raw_payload: raw_payload.to_string(),
            received_at: Utc::now(),
            processed_at: None,
            outcome: None,
        }
    }
}

#[async_trait]
pub trait WebhookEventRepository: Send + Sync {
    /// Stores the first delivery of an event; later deliveries keep the
    /// original row. Returns `true` when a row was inserted.
    async fn record_received(&self, event: &WebhookEvent) -> Result<bool, DatabaseError>;

    async fn mark_processed(&self, event_id: &str, outcome: &str) -> Result<(), DatabaseError>;

    async fn find(&self, event_id: &str) -> Result<Option<WebhookEvent>, DatabaseError>;
}

#[cfg(feature = "database")]
pub use postgres::PgWebhookEventRepository;

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use sqlx::{FromRow, PgPool};

    #[derive(Debug, FromRow)]
    struct WebhookEventRow {
        event_id: String,
        order_id: Option<String>,
        raw_payload: String,
        received_at: DateTime<Utc>,
        processed_at: Option<DateTime<Utc>>,
        outcome: Option<String>,
    }

    impl From<WebhookEventRow> for WebhookEvent {
        fn from(row: WebhookEventRow) -> Self {
            Self {
                event_id: row.event_id,
                order_id: row.order_id,
                raw_payload: row.raw_payload,
                received_at: row.received_at,
                processed_at: row.processed_at,
                outcome: row.outcome,
            }
        }
    }

    pub struct PgWebhookEventRepository {
        pool: PgPool,
    }

    impl PgWebhookEventRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl WebhookEventRepository for PgWebhookEventRepository {
        async fn record_received(&self, event: &WebhookEvent) -> Result<bool, DatabaseError> {
            let result = sqlx::query(
                "INSERT INTO webhook_events (event_id, order_id, raw_payload, received_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (event_id) DO NOTHING",
            )
            .bind(&event.event_id)
            .bind(&event.order_id)
            .bind(&event.raw_payload)
            .bind(event.received_at)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            Ok(result.rows_affected() == 1)
        }

        async fn mark_processed(&self, event_id: &str, outcome: &str) -> Result<(), DatabaseError> {
            sqlx::query(
                "UPDATE webhook_events SET processed_at = NOW(), outcome = $2
                 WHERE event_id = $1 AND processed_at IS NULL",
            )
            .bind(event_id)
            .bind(outcome)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            Ok(())
        }

        async fn find(&self, event_id: &str) -> Result<Option<WebhookEvent>, DatabaseError> {
            let row = sqlx::query_as::<_, WebhookEventRow>(
                "SELECT event_id, order_id, raw_payload, received_at, processed_at, outcome
                 FROM webhook_events WHERE event_id = $1",
            )
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            Ok(row.map(WebhookEvent::from))
        }
    }
}
