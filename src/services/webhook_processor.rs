//! Payment webhook handling.
//!
//! Every event is deduplicated on its `eventId` through the idempotency
//! store, so a redelivered event replays the first response without touching
//! the ledger again.

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::database::order_repository::{Order, OrderPatch, OrderStatus};
use crate::database::payment_session_repository::SessionStatus;
use crate::database::webhook_repository::{WebhookEvent, WebhookEventRepository};
use crate::error::{AppError, AppErrorKind, DomainError};
use crate::payments::gateway::PaymentGateway;
use crate::payments::types::{PaymentNotification, PaymentOutcome};
use crate::services::idempotency::{run_idempotent, IdempotencyPolicy, IdempotencyStore, StoredResponse};
use crate::services::order_ledger::{LedgerError, OrderLedger};
use crate::workers::fulfillment::FulfillmentQueue;

const SETTLE_ATTEMPTS: usize = 3;

/// What an event did, reported back to the provider as `result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookResult {
    Paid,
    /// Order already moved past payment
    Duplicate,
    /// Success reported for an order that had expired or failed
    LatePayment,
    PaymentFailed,
    SessionExpired,
    Ignored,
    OrderNotFound,
}

impl WebhookResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookResult::Paid => "paid",
            WebhookResult::Duplicate => "duplicate",
            WebhookResult::LatePayment => "late_payment",
            WebhookResult::PaymentFailed => "payment_failed",
            WebhookResult::SessionExpired => "session_expired",
            WebhookResult::Ignored => "ignored",
            WebhookResult::OrderNotFound => "order_not_found",
        }
    }
}

enum Settlement {
    Moved(Order),
    Already(Order),
    Missing,
}

pub struct WebhookProcessor {
    ledger: Arc<OrderLedger>,
    gateway: Arc<PaymentGateway>,
    events: Arc<dyn WebhookEventRepository>,
    idempotency: Arc<dyn IdempotencyStore>,
    policy: IdempotencyPolicy,
    queue: FulfillmentQueue,
}

impl WebhookProcessor {
    pub fn new(
        ledger: Arc<OrderLedger>,
        gateway: Arc<PaymentGateway>,
        events: Arc<dyn WebhookEventRepository>,
        idempotency: Arc<dyn IdempotencyStore>,
        policy: IdempotencyPolicy,
        queue: FulfillmentQueue,
    ) -> Self {
        Self {
            ledger,
            gateway,
            events,
            idempotency,
            policy,
            queue,
        }
    }

    /// Verifies, deduplicates and applies one webhook delivery.
    ///
    /// A bad signature is rejected before anything is read or written.
    pub async fn process(
        &self,
        raw_payload: &[u8],
        signature: Option<&str>,
    ) -> Result<StoredResponse, AppError> {
        if !self.gateway.verify_webhook_signature(raw_payload, signature) {
            warn!(
                has_signature = signature.is_some(),
                "rejecting webhook with invalid signature"
            );
            return Err(AppError::new(AppErrorKind::Domain(
                DomainError::SignatureInvalid,
            )));
        }

        let notification =
            PaymentNotification::parse(raw_payload).map_err(|e| AppError::malformed(e.to_string()))?;
        let key = format!("webhook:{}", notification.event_id);

        run_idempotent(self.idempotency.as_ref(), &key, &self.policy, || {
            self.handle(&notification, raw_payload)
        })
        .await
    }

    async fn handle(
        &self,
        notification: &PaymentNotification,
        raw_payload: &[u8],
    ) -> Result<StoredResponse, AppError> {
        let raw = String::from_utf8_lossy(raw_payload);
        let first_delivery = self
            .events
            .record_received(&WebhookEvent::received(
                &notification.event_id,
                Some(&notification.order_id),
                &raw,
            ))
            .await?;
        if !first_delivery {
            debug!(event_id = %notification.event_id, "webhook event already recorded");
        }

        let result = self.apply(notification).await?;

        info!(
            event_id = %notification.event_id,
            order_id = %notification.order_id,
            status = ?notification.status,
            result = result.as_str(),
            "webhook processed"
        );

        if let Err(e) = self
            .events
            .mark_processed(&notification.event_id, result.as_str())
            .await
        {
            warn!(event_id = %notification.event_id, error = %e, "failed to mark webhook processed");
        }

        Ok(StoredResponse::new(
            200,
            json!({
                "status": "ok",
                "eventId": notification.event_id,
                "result": result.as_str(),
            }),
        ))
    }

    async fn apply(&self, notification: &PaymentNotification) -> Result<WebhookResult, AppError> {
        let order_id = notification.order_id.as_str();
        match notification.status {
            PaymentOutcome::Success => match self.settle(order_id, OrderStatus::Paid).await? {
                Settlement::Moved(order) => {
                    self.close_session(&order.id, SessionStatus::Confirmed).await;
                    self.queue.enqueue(&order.id);
                    Ok(WebhookResult::Paid)
                }
                Settlement::Already(order)
                    if matches!(order.status, OrderStatus::Expired | OrderStatus::PaymentFailed) =>
                {
                    error!(
                        order_id = %order.id,
                        event_id = %notification.event_id,
                        status = %order.status,
                        amount = ?notification.amount,
                        "payment received for a closed order, needs manual follow-up"
                    );
                    Ok(WebhookResult::LatePayment)
                }
                Settlement::Already(_) => Ok(WebhookResult::Duplicate),
                Settlement::Missing => Ok(self.not_found(notification)),
            },
            PaymentOutcome::Failure => {
                match self.settle(order_id, OrderStatus::PaymentFailed).await? {
                    Settlement::Moved(order) => {
                        self.close_session(&order.id, SessionStatus::Failed).await;
                        Ok(WebhookResult::PaymentFailed)
                    }
                    Settlement::Already(order) if order.status == OrderStatus::PaymentFailed => {
                        Ok(WebhookResult::Duplicate)
                    }
                    Settlement::Already(order) => {
                        warn!(
                            order_id = %order.id,
                            status = %order.status,
                            "ignoring payment failure for order past payment"
                        );
                        Ok(WebhookResult::Ignored)
                    }
                    Settlement::Missing => Ok(self.not_found(notification)),
                }
            }
            PaymentOutcome::Expired => {
                match self.ledger.get(order_id).await {
                    Ok(_) => {}
                    Err(LedgerError::NotFound { .. }) => return Ok(self.not_found(notification)),
                    Err(e) => return Err(e.into()),
                }
                self.gateway
                    .settle_active_session(order_id, SessionStatus::Expired)
                    .await?;
                Ok(WebhookResult::SessionExpired)
            }
            PaymentOutcome::Pending => Ok(WebhookResult::Ignored),
        }
    }

    /// Moves a `PENDING_PAYMENT` order to `to`, re-reading on version races.
    async fn settle(&self, order_id: &str, to: OrderStatus) -> Result<Settlement, AppError> {
        let mut last_conflict = None;
        for _ in 0..SETTLE_ATTEMPTS {
            let order = match self.ledger.get(order_id).await {
                Ok(order) => order,
                Err(LedgerError::NotFound { .. }) => return Ok(Settlement::Missing),
                Err(e) => return Err(e.into()),
            };
            if order.status != OrderStatus::PendingPayment {
                return Ok(Settlement::Already(order));
            }

            match self
                .ledger
                .transition_with(
                    &order.id,
                    order.version,
                    &[OrderStatus::PendingPayment],
                    to,
                    OrderPatch::default(),
                )
                .await
            {
                Ok(moved) => return Ok(Settlement::Moved(moved)),
                Err(e) if e.is_conflict() => {
                    debug!(order_id = %order_id, "webhook lost a version race, re-reading");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_conflict
            .map(AppError::from)
            .unwrap_or_else(|| AppError::internal("order settlement did not converge")))
    }

    async fn close_session(&self, order_id: &str, status: SessionStatus) {
        if let Err(e) = self.gateway.settle_active_session(order_id, status).await {
            warn!(order_id = %order_id, error = %e, "failed to update payment session");
        }
    }

    fn not_found(&self, notification: &PaymentNotification) -> WebhookResult {
        warn!(
            event_id = %notification.event_id,
            order_id = %notification.order_id,
            "webhook for unknown order"
        );
        WebhookResult::OrderNotFound
    }
}
