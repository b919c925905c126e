use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::publisher::{DeliveryRequest, PublisherError, PublisherRegistry};
use super::retry::RetryPolicy;
use super::types::{FulfillmentError, FulfillmentOutcome};
use crate::database::fulfillment_repository::{
    AttemptOutcome, FulfillmentAttempt, FulfillmentAttemptRepository,
};
use crate::database::order_repository::{Order, OrderPatch, OrderStatus};
use crate::logging::mask_player_id;
use crate::services::order_ledger::OrderLedger;
use crate::workers::refund_coordinator::{RefundCoordinator, RefundReason};

/// Drives one order through a publisher call.
pub struct FulfillmentDispatcher {
    ledger: Arc<OrderLedger>,
    attempts: Arc<dyn FulfillmentAttemptRepository>,
    publishers: Arc<PublisherRegistry>,
    refunds: Arc<RefundCoordinator>,
    retry: RetryPolicy,
    publisher_timeout: Duration,
}

impl FulfillmentDispatcher {
    pub fn new(
        ledger: Arc<OrderLedger>,
        attempts: Arc<dyn FulfillmentAttemptRepository>,
        publishers: Arc<PublisherRegistry>,
        refunds: Arc<RefundCoordinator>,
        retry: RetryPolicy,
        publisher_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            attempts,
            publishers,
            refunds,
            retry,
            publisher_timeout,
        }
    }

    /// Claims a `PAID` or due `FAILED_RETRY` order, calls its publisher and
    /// records the result. A lost claim means another worker owns the order.
    pub async fn attempt_fulfillment(
        &self,
        order_id: &str,
    ) -> Result<FulfillmentOutcome, FulfillmentError> {
        let order = self.ledger.get(order_id).await?;
        if !self.is_due(&order) {
            debug!(order_id = %order_id, status = %order.status, "order not due for fulfillment");
            return Ok(FulfillmentOutcome::Skipped);
        }

        let claimed = match self
            .ledger
            .transition_with(
                &order.id,
                order.version,
                &[OrderStatus::Paid, OrderStatus::FailedRetry],
                OrderStatus::Fulfilling,
                OrderPatch {
                    add_fulfillment_attempt: true,
                    next_retry_at: Some(None),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(err) if err.is_conflict() => {
                debug!(order_id = %order_id, "fulfillment claimed elsewhere, dropping job");
                return Ok(FulfillmentOutcome::Skipped);
            }
            Err(err) => return Err(err.into()),
        };

        let attempt_number = claimed.fulfillment_attempts;
        let publisher = self
            .ledger
            .catalog()
            .publisher_for(&claimed.game_id)
            .unwrap_or("unknown")
            .to_string();

        self.attempts
            .start(&FulfillmentAttempt {
                order_id: claimed.id.clone(),
                attempt_number,
                publisher: publisher.clone(),
                started_at: Utc::now(),
                completed_at: None,
                outcome: None,
                detail: None,
            })
            .await?;

        info!(
            order_id = %claimed.id,
            attempt = attempt_number,
            publisher = %publisher,
            player_id = %mask_player_id(&claimed.player_id),
            "calling publisher"
        );

        let result = self.deliver(&claimed, &publisher, attempt_number).await;

        match result {
            Ok(reference) => {
                self.finish_attempt(&claimed, attempt_number, AttemptOutcome::Success, &reference)
                    .await;
                self.mark_fulfilled(claimed).await
            }
            Err(PublisherError::Transient(detail)) => {
                self.finish_attempt(
                    &claimed,
                    attempt_number,
                    AttemptOutcome::TransientFailure,
                    &detail,
                )
                .await;
                self.schedule_retry(claimed, attempt_number, detail).await
            }
            Err(PublisherError::Permanent(detail)) => {
                self.finish_attempt(
                    &claimed,
                    attempt_number,
                    AttemptOutcome::PermanentFailure,
                    &detail,
                )
                .await;
                warn!(order_id = %claimed.id, error = %detail, "publisher rejected top-up");

                let claimed = self
                    .ledger
                    .update_fields(
                        &claimed.id,
                        claimed.version,
                        OrderStatus::Fulfilling,
                        OrderPatch {
                            last_error: Some(Some(detail)),
                            ..Default::default()
                        },
                    )
                    .await?;
                let refunded = self
                    .refunds
                    .refund(&claimed.id, RefundReason::PermanentFailure)
                    .await?;
                Ok(FulfillmentOutcome::RefundRequested(refunded.status))
            }
        }
    }

    fn is_due(&self, order: &Order) -> bool {
        match order.status {
            OrderStatus::Paid => true,
            OrderStatus::FailedRetry => order.next_retry_at.is_some_and(|t| t <= Utc::now()),
            _ => false,
        }
    }

    async fn deliver(
        &self,
        order: &Order,
        publisher: &str,
        attempt: i32,
    ) -> Result<String, PublisherError> {
        let client = self.publishers.resolve(publisher).ok_or_else(|| {
            PublisherError::Transient(format!("no client configured for publisher {}", publisher))
        })?;

        let request = DeliveryRequest {
            order_id: order.id.clone(),
            game_id: order.game_id.clone(),
            denom_code: order.denom_code.clone(),
            player_id: order.player_id.clone(),
            server_id: order.server_id.clone(),
            attempt,
        };

        match tokio::time::timeout(self.publisher_timeout, client.deliver(&request)).await {
            Ok(result) => result.map(|receipt| receipt.reference),
            Err(_) => Err(PublisherError::Transient(format!(
                "publisher {} did not answer within {}s",
                publisher,
                self.publisher_timeout.as_secs()
            ))),
        }
    }

    async fn finish_attempt(
        &self,
        order: &Order,
        attempt_number: i32,
        outcome: AttemptOutcome,
        detail: &str,
    ) {
        let detail = (!detail.is_empty()).then_some(detail);
        if let Err(e) = self
            .attempts
            .complete(&order.id, attempt_number, outcome, detail)
            .await
        {
            warn!(order_id = %order.id, attempt = attempt_number, error = %e, "failed to record attempt outcome");
        }
    }

    async fn mark_fulfilled(&self, order: Order) -> Result<FulfillmentOutcome, FulfillmentError> {
        match self
            .ledger
            .transition_with(
                &order.id,
                order.version,
                &[OrderStatus::Fulfilling],
                OrderStatus::Fulfilled,
                OrderPatch {
                    last_error: Some(None),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(_) => {
                info!(order_id = %order.id, "order fulfilled");
                Ok(FulfillmentOutcome::Fulfilled)
            }
            Err(err) if err.is_conflict() => {
                // The SLA watchdog moved the order to refunding while the
                // publisher call was in flight.
                error!(
                    order_id = %order.id,
                    "publisher credited an order that is already being refunded"
                );
                Ok(FulfillmentOutcome::Skipped)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn schedule_retry(
        &self,
        order: Order,
        attempt: i32,
        detail: String,
    ) -> Result<FulfillmentOutcome, FulfillmentError> {
        let exhausted = self.retry.is_exhausted(attempt);
        let next_retry_at = (!exhausted).then(|| {
            Utc::now()
                + chrono::Duration::from_std(self.retry.delay_for(attempt as u32))
                    .unwrap_or_else(|_| chrono::Duration::seconds(60))
        });

        let failed = match self
            .ledger
            .transition_with(
                &order.id,
                order.version,
                &[OrderStatus::Fulfilling],
                OrderStatus::FailedRetry,
                OrderPatch {
                    next_retry_at: Some(next_retry_at),
                    last_error: Some(Some(detail.clone())),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(failed) => failed,
            Err(err) if err.is_conflict() => {
                debug!(order_id = %order.id, "order left FULFILLING during the attempt");
                return Ok(FulfillmentOutcome::Skipped);
            }
            Err(err) => return Err(err.into()),
        };

        match next_retry_at {
            Some(next_retry_at) => {
                warn!(
                    order_id = %order.id,
                    attempt,
                    next_retry_at = %next_retry_at,
                    error = %detail,
                    "fulfillment failed, retry scheduled"
                );
                Ok(FulfillmentOutcome::RetryScheduled {
                    attempt,
                    next_retry_at,
                })
            }
            None => {
                warn!(order_id = %order.id, attempts = attempt, "fulfillment retries exhausted");
                let refunded = self
                    .refunds
                    .refund(&failed.id, RefundReason::RetriesExhausted)
                    .await?;
                Ok(FulfillmentOutcome::RefundRequested(refunded.status))
            }
        }
    }
}
