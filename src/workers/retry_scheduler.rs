use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::database::order_repository::{OrderScan, OrderStatus};
use crate::services::order_ledger::OrderLedger;
use crate::workers::fulfillment::FulfillmentQueue;
use crate::workers::refund_coordinator::{RefundCoordinator, RefundReason};

#[derive(Debug, Clone)]
pub struct RetrySchedulerConfig {
    pub sweep_interval: Duration,
    /// A `PAID` order older than this is assumed to have lost its job.
    pub stale_paid_grace: Duration,
    pub batch_size: i64,
}

impl Default for RetrySchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            stale_paid_grace: Duration::from_secs(120),
            batch_size: 100,
        }
    }
}

impl RetrySchedulerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.sweep_interval = Duration::from_secs(
            std::env::var("RETRY_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(cfg.sweep_interval.as_secs()),
        );
        cfg.stale_paid_grace = Duration::from_secs(
            std::env::var("STALE_PAID_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.stale_paid_grace.as_secs()),
        );
        cfg
    }
}

/// Counts from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrySweep {
    pub requeued: usize,
    pub refunds_started: usize,
    pub refunds_retried: usize,
}

/// Re-queues due fulfillment retries and lost jobs, and drives refund retries.
pub struct RetryScheduler {
    ledger: Arc<OrderLedger>,
    queue: FulfillmentQueue,
    refunds: Arc<RefundCoordinator>,
    config: RetrySchedulerConfig,
}

impl RetryScheduler {
    pub fn new(
        ledger: Arc<OrderLedger>,
        queue: FulfillmentQueue,
        refunds: Arc<RefundCoordinator>,
        config: RetrySchedulerConfig,
    ) -> Self {
        Self {
            ledger,
            queue,
            refunds,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            stale_paid_grace_secs = self.config.stale_paid_grace.as_secs(),
            "retry scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("retry scheduler stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.sweep_interval) => {
                    match self.run_cycle().await {
                        Ok(sweep) if sweep != RetrySweep::default() => {
                            debug!(?sweep, "retry sweep finished");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "retry scheduler cycle failed"),
                    }
                }
            }
        }

        info!("retry scheduler stopped");
    }

    pub async fn run_cycle(&self) -> anyhow::Result<RetrySweep> {
        let now = Utc::now();
        let mut sweep = RetrySweep::default();

        let failed = self
            .ledger
            .find_due(
                &[OrderStatus::FailedRetry],
                OrderScan::Any,
                self.config.batch_size,
            )
            .await?;
        for order in failed {
            match order.next_retry_at {
                Some(at) if at <= now => {
                    if self.queue.enqueue(&order.id) {
                        sweep.requeued += 1;
                    }
                }
                Some(_) => {}
                None => {
                    // Retries ran out but the refund hand-off did not happen.
                    match self
                        .refunds
                        .refund(&order.id, RefundReason::RetriesExhausted)
                        .await
                    {
                        Ok(_) => sweep.refunds_started += 1,
                        Err(e) => error!(order_id = %order.id, error = %e, "refund hand-off failed"),
                    }
                }
            }
        }

        let grace = chrono::Duration::from_std(self.config.stale_paid_grace)?;
        let stale_paid = self
            .ledger
            .find_due(
                &[OrderStatus::Paid],
                OrderScan::PaidBefore(now - grace),
                self.config.batch_size,
            )
            .await?;
        for order in stale_paid {
            debug!(order_id = %order.id, "re-queueing paid order without a live job");
            if self.queue.enqueue(&order.id) {
                sweep.requeued += 1;
            }
        }

        let refunding = self
            .ledger
            .find_due(
                &[OrderStatus::Refunding],
                OrderScan::RetryDueBy(now),
                self.config.batch_size,
            )
            .await?;
        for order in refunding {
            match self.refunds.refund(&order.id, RefundReason::Retry).await {
                Ok(_) => sweep.refunds_retried += 1,
                Err(e) => error!(order_id = %order.id, error = %e, "refund retry failed"),
            }
        }

        Ok(sweep)
    }
}
