use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::dispatcher::FulfillmentDispatcher;
use super::types::{FulfillmentJob, FulfillmentOutcome};

pub type FulfillmentReceiver = mpsc::UnboundedReceiver<FulfillmentJob>;

/// Producer side of the fulfillment job channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FulfillmentQueue {
    tx: mpsc::UnboundedSender<FulfillmentJob>,
}

impl FulfillmentQueue {
    pub fn channel() -> (Self, FulfillmentReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `false` once the worker has stopped. The retry scheduler
    /// picks up anything that could not be queued.
    pub fn enqueue(&self, order_id: &str) -> bool {
        match self.tx.send(FulfillmentJob {
            order_id: order_id.to_string(),
        }) {
            Ok(()) => true,
            Err(_) => {
                warn!(order_id = %order_id, "fulfillment queue closed, job left for the retry sweep");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FulfillmentWorkerConfig {
    pub concurrency: usize,
}

impl Default for FulfillmentWorkerConfig {
    fn default() -> Self {
        Self { concurrency: 8 }
    }
}

impl FulfillmentWorkerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.concurrency = std::env::var("FULFILLMENT_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(cfg.concurrency);
        cfg
    }
}

pub struct FulfillmentWorker {
    dispatcher: Arc<FulfillmentDispatcher>,
    receiver: FulfillmentReceiver,
    config: FulfillmentWorkerConfig,
}

impl FulfillmentWorker {
    pub fn new(
        dispatcher: Arc<FulfillmentDispatcher>,
        receiver: FulfillmentReceiver,
        config: FulfillmentWorkerConfig,
    ) -> Self {
        Self {
            dispatcher,
            receiver,
            config,
        }
    }

    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            concurrency = self.config.concurrency,
            "fulfillment worker started"
        );

        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("fulfillment worker stopping");
                        break;
                    }
                }
                job = self.receiver.recv() => {
                    let Some(job) = job else {
                        debug!("fulfillment queue closed");
                        break;
                    };
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };
                    let dispatcher = self.dispatcher.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        run_job(&dispatcher, job).await;
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "fulfillment task panicked");
                    }
                }
            }
        }

        // Let started publisher calls finish so their outcome is recorded.
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "fulfillment task panicked");
            }
        }

        info!("fulfillment worker stopped");
    }
}

async fn run_job(dispatcher: &FulfillmentDispatcher, job: FulfillmentJob) {
    match dispatcher.attempt_fulfillment(&job.order_id).await {
        Ok(FulfillmentOutcome::Skipped) => {}
        Ok(outcome) => debug!(order_id = %job.order_id, ?outcome, "fulfillment job finished"),
        Err(e) => warn!(order_id = %job.order_id, error = %e, "fulfillment job failed"),
    }
}
