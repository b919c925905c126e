use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::services::order_ledger::OrderLedger;

#[derive(Debug, Clone)]
pub struct OrderExpiryConfig {
    /// How often unpaid orders are swept.
    pub sweep_interval: Duration,
    /// Age after which a `PENDING_PAYMENT` order expires.
    pub pending_ttl: Duration,
}

impl Default for OrderExpiryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            pending_ttl: Duration::from_secs(3600),
        }
    }
}

impl OrderExpiryConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.sweep_interval = Duration::from_secs(
            std::env::var("EXPIRY_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.sweep_interval.as_secs()),
        );
        cfg.pending_ttl = Duration::from_secs(
            std::env::var("ORDER_PENDING_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.pending_ttl.as_secs()),
        );
        cfg
    }
}

pub struct OrderExpiryWorker {
    ledger: Arc<OrderLedger>,
    config: OrderExpiryConfig,
}

impl OrderExpiryWorker {
    pub fn new(ledger: Arc<OrderLedger>, config: OrderExpiryConfig) -> Self {
        Self { ledger, config }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            pending_ttl_secs = self.config.pending_ttl.as_secs(),
            "order expiry worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("order expiry worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.sweep_interval) => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "order expiry cycle failed");
                    }
                }
            }
        }

        info!("order expiry worker stopped");
    }

    /// Expires stale unpaid orders. Returns how many moved to `EXPIRED`.
    pub async fn run_cycle(&self) -> anyhow::Result<u64> {
        let expired = self
            .ledger
            .expire_pending_older_than(self.config.pending_ttl)
            .await?;
        if expired > 0 {
            info!(expired, "expired unpaid orders");
        }
        Ok(expired)
    }
}
