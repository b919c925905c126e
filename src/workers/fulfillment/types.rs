use chrono::{DateTime, Utc};

use crate::database::error::DatabaseError;
use crate::database::order_repository::OrderStatus;
use crate::services::order_ledger::LedgerError;
use crate::workers::refund_coordinator::RefundError;

/// Unit of work on the fulfillment queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentJob {
    pub order_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FulfillmentError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Refund(#[from] RefundError),
}

/// What a single dispatch did to the order
#[derive(Debug, Clone, PartialEq)]
pub enum FulfillmentOutcome {
    Fulfilled,
    RetryScheduled {
        attempt: i32,
        next_retry_at: DateTime<Utc>,
    },
    /// Handed to the refund coordinator; carries the status it left behind
    RefundRequested(OrderStatus),
    /// Another worker owns the order, or it is not due
    Skipped,
}
