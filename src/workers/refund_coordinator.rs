//! Refund coordinator.
//!
//! An order is claimed into `REFUNDING` before the provider is called, so a
//! refund has exactly one owner at a time. Failed provider calls are retried
//! on the shared backoff schedule (driven by the retry scheduler) until the
//! attempt budget is spent, after which the order lands in
//! `REFUND_FAILED_MANUAL` for an operator.
//!
//! A claim stamps `next_retry_at` with a lease. If the owner dies before it
//! records an outcome, the lease runs out and the retry scheduler takes the
//! refund over.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::database::order_repository::{Order, OrderPatch, OrderStatus};
use crate::error::{AppError, AppErrorKind, DomainError};
use crate::payments::gateway::PaymentGateway;
use crate::services::order_ledger::{LedgerError, OrderLedger};
use crate::workers::fulfillment::retry::RetryPolicy;

const CLAIM_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundReason {
    RetriesExhausted,
    PermanentFailure,
    SlaBreached,
    /// Scheduled retry of a refund already in progress
    Retry,
}

impl RefundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundReason::RetriesExhausted => "retries_exhausted",
            RefundReason::PermanentFailure => "permanent_failure",
            RefundReason::SlaBreached => "sla_breached",
            RefundReason::Retry => "refund_retry",
        }
    }

    /// A running fulfillment may only be cut short for these reasons.
    fn may_interrupt_fulfillment(&self) -> bool {
        matches!(
            self,
            RefundReason::PermanentFailure | RefundReason::SlaBreached
        )
    }
}

#[derive(Debug, Error)]
pub enum RefundError {
    #[error("order {order_id} is {status} and cannot be refunded")]
    NotRefundable {
        order_id: String,
        status: OrderStatus,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<RefundError> for AppError {
    fn from(err: RefundError) -> Self {
        match err {
            RefundError::NotRefundable { order_id, status } => {
                AppError::new(AppErrorKind::Domain(DomainError::InvalidOrderState {
                    order_id,
                    status,
                    expected: "FULFILLING, FAILED_RETRY or REFUNDING".to_string(),
                }))
            }
            RefundError::Ledger(err) => err.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefundCoordinatorConfig {
    pub max_attempts: i32,
    /// How long a claim stays owned; must outlive the provider call
    pub claim_lease: Duration,
}

impl Default for RefundCoordinatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            claim_lease: Duration::from_secs(120),
        }
    }
}

impl RefundCoordinatorConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.max_attempts = std::env::var("REFUND_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(cfg.max_attempts);
        cfg.claim_lease = Duration::from_secs(
            std::env::var("REFUND_CLAIM_LEASE_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.claim_lease.as_secs()),
        );
        cfg
    }

    /// Stretches the lease to cover a provider call of `call_timeout` plus
    /// a margin for the ledger writes around it.
    pub fn covering(mut self, call_timeout: Duration) -> Self {
        self.claim_lease = self.claim_lease.max(call_timeout + Duration::from_secs(30));
        self
    }
}

pub struct RefundCoordinator {
    ledger: Arc<OrderLedger>,
    gateway: Arc<PaymentGateway>,
    retry: RetryPolicy,
    config: RefundCoordinatorConfig,
}

impl RefundCoordinator {
    pub fn new(
        ledger: Arc<OrderLedger>,
        gateway: Arc<PaymentGateway>,
        retry: RetryPolicy,
        config: RefundCoordinatorConfig,
    ) -> Self {
        Self {
            ledger,
            gateway,
            retry,
            config,
        }
    }

    /// Refunds the order if it is refundable. Terminal orders are returned
    /// unchanged, so repeated calls are harmless.
    pub async fn refund(&self, order_id: &str, reason: RefundReason) -> Result<Order, RefundError> {
        for _ in 0..CLAIM_ATTEMPTS {
            let order = self.ledger.get(order_id).await?;
            if order.status.is_terminal() {
                return Ok(order);
            }

            let claim = match order.status {
                OrderStatus::Refunding => {
                    let due = order.next_retry_at.is_some_and(|t| t <= Utc::now());
                    if reason != RefundReason::Retry || !due {
                        // someone else owns this refund
                        return Ok(order);
                    }
                    self.ledger
                        .update_fields(
                            &order.id,
                            order.version,
                            OrderStatus::Refunding,
                            OrderPatch {
                                next_retry_at: Some(Some(self.lease_expiry())),
                                ..Default::default()
                            },
                        )
                        .await
                }
                OrderStatus::FailedRetry => {
                    self.claim(&order, OrderStatus::FailedRetry).await
                }
                OrderStatus::Fulfilling if reason.may_interrupt_fulfillment() => {
                    self.claim(&order, OrderStatus::Fulfilling).await
                }
                status => {
                    return Err(RefundError::NotRefundable {
                        order_id: order.id,
                        status,
                    })
                }
            };

            match claim {
                Ok(claimed) => return self.execute(claimed, reason).await,
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            }
        }

        warn!(order_id = %order_id, "refund claim kept conflicting, leaving it to the current owner");
        Ok(self.ledger.get(order_id).await?)
    }

    async fn claim(&self, order: &Order, from: OrderStatus) -> Result<Order, LedgerError> {
        self.ledger
            .transition_with(
                &order.id,
                order.version,
                &[from],
                OrderStatus::Refunding,
                OrderPatch {
                    next_retry_at: Some(Some(self.lease_expiry())),
                    ..Default::default()
                },
            )
            .await
    }

    fn lease_expiry(&self) -> DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(self.config.claim_lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(120))
    }

    async fn execute(&self, order: Order, reason: RefundReason) -> Result<Order, RefundError> {
        info!(
            order_id = %order.id,
            reason = reason.as_str(),
            attempt = order.refund_attempts + 1,
            amount = order.amount,
            "refunding order"
        );

        match self.gateway.refund(&order, reason.as_str()).await {
            Ok(receipt) => {
                let refunded = self
                    .ledger
                    .transition_with(
                        &order.id,
                        order.version,
                        &[OrderStatus::Refunding],
                        OrderStatus::FailedRefunded,
                        OrderPatch {
                            add_refund_attempt: true,
                            next_retry_at: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?;
                info!(order_id = %order.id, refund_id = %receipt.refund_id, "order refunded");
                Ok(refunded)
            }
            Err(err) => {
                let attempts = order.refund_attempts + 1;
                if !err.is_retryable() || attempts >= self.config.max_attempts {
                    error!(
                        order_id = %order.id,
                        attempts,
                        error = %err,
                        "refund failed, order needs manual intervention"
                    );
                    return Ok(self
                        .ledger
                        .transition_with(
                            &order.id,
                            order.version,
                            &[OrderStatus::Refunding],
                            OrderStatus::RefundFailedManual,
                            OrderPatch {
                                add_refund_attempt: true,
                                next_retry_at: Some(None),
                                last_error: Some(Some(err.to_string())),
                                ..Default::default()
                            },
                        )
                        .await?);
                }

                let next_retry_at = Utc::now()
                    + chrono::Duration::from_std(self.retry.delay_for(attempts as u32))
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                warn!(
                    order_id = %order.id,
                    attempts,
                    next_retry_at = %next_retry_at,
                    error = %err,
                    "refund failed, will retry"
                );
                Ok(self
                    .ledger
                    .update_fields(
                        &order.id,
                        order.version,
                        OrderStatus::Refunding,
                        OrderPatch {
                            add_refund_attempt: true,
                            next_retry_at: Some(Some(next_retry_at)),
                            last_error: Some(Some(err.to_string())),
                            ..Default::default()
                        },
                    )
                    .await?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_outlives_the_provider_call() {
        let config = RefundCoordinatorConfig {
            max_attempts: 5,
            claim_lease: Duration::from_secs(20),
        }
        .covering(Duration::from_secs(60));
        assert_eq!(config.claim_lease, Duration::from_secs(90));

        let config = RefundCoordinatorConfig::default().covering(Duration::from_secs(10));
        assert_eq!(config.claim_lease, Duration::from_secs(120));
    }
}
