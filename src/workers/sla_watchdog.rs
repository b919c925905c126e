//! Refunds paid orders that were not delivered within the fulfillment SLA.
//!
//! The SLA is measured from `paid_at`. Orders past it are refunded even when
//! retry budget remains.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::database::order_repository::{OrderScan, OrderStatus};
use crate::services::order_ledger::OrderLedger;
use crate::workers::refund_coordinator::{RefundCoordinator, RefundReason};

#[derive(Debug, Clone)]
pub struct SlaWatchdogConfig {
    pub sweep_interval: Duration,
    pub sla: Duration,
    pub batch_size: i64,
}

impl Default for SlaWatchdogConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            sla: Duration::from_secs(1800),
            batch_size: 100,
        }
    }
}

impl SlaWatchdogConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.sweep_interval = Duration::from_secs(
            std::env::var("SLA_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.sweep_interval.as_secs()),
        );
        cfg.sla = Duration::from_secs(
            std::env::var("FULFILLMENT_SLA_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.sla.as_secs()),
        );
        cfg
    }
}

pub struct SlaWatchdog {
    ledger: Arc<OrderLedger>,
    refunds: Arc<RefundCoordinator>,
    config: SlaWatchdogConfig,
}

impl SlaWatchdog {
    pub fn new(
        ledger: Arc<OrderLedger>,
        refunds: Arc<RefundCoordinator>,
        config: SlaWatchdogConfig,
    ) -> Self {
        Self {
            ledger,
            refunds,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            sla_secs = self.config.sla.as_secs(),
            "sla watchdog started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("sla watchdog stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.sweep_interval) => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "sla watchdog cycle failed");
                    }
                }
            }
        }

        info!("sla watchdog stopped");
    }

    /// Hands every breached order to the refund coordinator. Returns the
    /// number of orders touched.
    pub async fn run_cycle(&self) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.sla)?;
        let breached = self
            .ledger
            .find_due(
                &[OrderStatus::Fulfilling, OrderStatus::FailedRetry],
                OrderScan::PaidBefore(cutoff),
                self.config.batch_size,
            )
            .await?;

        let mut handled = 0;
        for order in breached {
            warn!(
                order_id = %order.id,
                status = %order.status,
                attempts = order.fulfillment_attempts,
                paid_at = ?order.paid_at,
                "fulfillment sla breached"
            );
            match self.refunds.refund(&order.id, RefundReason::SlaBreached).await {
                Ok(refunded) => {
                    handled += 1;
                    info!(order_id = %order.id, status = %refunded.status, "sla refund handled");
                }
                Err(e) => error!(order_id = %order.id, error = %e, "sla refund failed"),
            }
        }
        Ok(handled)
    }
}
