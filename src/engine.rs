//! Wires the ledger, payment gateway, webhook processor, fulfillment and
//! refund components together and starts the background workers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{AppConfig, PaymentConfig};
use crate::database::fulfillment_repository::FulfillmentAttemptRepository;
use crate::database::memory::{
    InMemoryFulfillmentAttemptRepository, InMemoryOrderRepository,
    InMemoryPaymentSessionRepository, InMemoryWebhookEventRepository,
};
use crate::database::order_repository::OrderRepository;
use crate::database::payment_session_repository::PaymentSessionRepository;
use crate::database::webhook_repository::WebhookEventRepository;
use crate::payments::gateway::PaymentGateway;
use crate::payments::provider::PaymentProvider;
use crate::services::catalog::Catalog;
use crate::services::idempotency::{IdempotencyPolicy, IdempotencyStore, InMemoryIdempotencyStore};
use crate::services::order_ledger::OrderLedger;
use crate::services::webhook_processor::WebhookProcessor;
use crate::workers::fulfillment::{
    FulfillmentDispatcher, FulfillmentQueue, FulfillmentReceiver, FulfillmentWorker,
    FulfillmentWorkerConfig, PublisherRegistry, RetryPolicy,
};
use crate::workers::order_expiry::{OrderExpiryConfig, OrderExpiryWorker};
use crate::workers::refund_coordinator::{RefundCoordinator, RefundCoordinatorConfig};
use crate::workers::retry_scheduler::{RetryScheduler, RetrySchedulerConfig};
use crate::workers::sla_watchdog::{SlaWatchdog, SlaWatchdogConfig};

/// Storage and integration backends.
pub struct EngineDeps {
    pub orders: Arc<dyn OrderRepository>,
    pub sessions: Arc<dyn PaymentSessionRepository>,
    pub webhook_events: Arc<dyn WebhookEventRepository>,
    pub attempts: Arc<dyn FulfillmentAttemptRepository>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub provider: Arc<dyn PaymentProvider>,
    pub publishers: PublisherRegistry,
    pub catalog: Catalog,
}

impl EngineDeps {
    /// In-memory stores around the given provider and publishers.
    pub fn in_memory(provider: Arc<dyn PaymentProvider>, publishers: PublisherRegistry) -> Self {
        Self {
            orders: Arc::new(InMemoryOrderRepository::new()),
            sessions: Arc::new(InMemoryPaymentSessionRepository::new()),
            webhook_events: Arc::new(InMemoryWebhookEventRepository::new()),
            attempts: Arc::new(InMemoryFulfillmentAttemptRepository::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            provider,
            publishers,
            catalog: Catalog::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub payment: PaymentConfig,
    pub idempotency: IdempotencyPolicy,
    pub retry: RetryPolicy,
    pub refund: RefundCoordinatorConfig,
    pub publisher_timeout: Duration,
    pub fulfillment: FulfillmentWorkerConfig,
    pub expiry: OrderExpiryConfig,
    pub sla: SlaWatchdogConfig,
    pub retry_sweep: RetrySchedulerConfig,
}

impl EngineConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            payment: config.payment.clone(),
            idempotency: IdempotencyPolicy::from(&config.idempotency),
            retry: RetryPolicy::from_env(),
            refund: RefundCoordinatorConfig::from_env()
                .covering(Duration::from_secs(config.payment.timeout_secs)),
            publisher_timeout: Duration::from_secs(config.publisher.timeout_secs),
            fulfillment: FulfillmentWorkerConfig::from_env(),
            expiry: OrderExpiryConfig::from_env(),
            sla: SlaWatchdogConfig::from_env(),
            retry_sweep: RetrySchedulerConfig::from_env(),
        }
    }
}

/// The assembled order engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    pub ledger: Arc<OrderLedger>,
    pub gateway: Arc<PaymentGateway>,
    pub webhooks: Arc<WebhookProcessor>,
    pub dispatcher: Arc<FulfillmentDispatcher>,
    pub refunds: Arc<RefundCoordinator>,
    pub queue: FulfillmentQueue,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub idempotency_policy: IdempotencyPolicy,
    config: Arc<EngineConfig>,
}

impl Engine {
    /// Builds the engine. The receiver feeds [`FulfillmentWorker`]; pass it
    /// to [`Engine::spawn_workers`] or drive jobs by hand in tests.
    pub fn new(deps: EngineDeps, config: EngineConfig) -> (Self, FulfillmentReceiver) {
        let publisher_timeout = if config.publisher_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            config.publisher_timeout
        };

        let ledger = Arc::new(OrderLedger::new(
            deps.orders,
            deps.sessions.clone(),
            Arc::new(deps.catalog),
        ));
        let gateway = Arc::new(PaymentGateway::new(
            deps.provider,
            deps.sessions,
            ledger.clone(),
            config.payment.clone(),
        ));
        let refunds = Arc::new(RefundCoordinator::new(
            ledger.clone(),
            gateway.clone(),
            config.retry.clone(),
            config.refund.clone(),
        ));
        let dispatcher = Arc::new(FulfillmentDispatcher::new(
            ledger.clone(),
            deps.attempts,
            Arc::new(deps.publishers),
            refunds.clone(),
            config.retry.clone(),
            publisher_timeout,
        ));

        let (queue, receiver) = FulfillmentQueue::channel();
        let webhooks = Arc::new(WebhookProcessor::new(
            ledger.clone(),
            gateway.clone(),
            deps.webhook_events,
            deps.idempotency.clone(),
            config.idempotency.clone(),
            queue.clone(),
        ));

        let engine = Self {
            ledger,
            gateway,
            webhooks,
            dispatcher,
            refunds,
            queue,
            idempotency: deps.idempotency,
            idempotency_policy: config.idempotency.clone(),
            config: Arc::new(config),
        };
        (engine, receiver)
    }

    pub fn in_memory(
        provider: Arc<dyn PaymentProvider>,
        publishers: PublisherRegistry,
        config: EngineConfig,
    ) -> (Self, FulfillmentReceiver) {
        Self::new(EngineDeps::in_memory(provider, publishers), config)
    }

    pub fn order_expiry(&self) -> OrderExpiryWorker {
        OrderExpiryWorker::new(self.ledger.clone(), self.config.expiry.clone())
    }

    pub fn sla_watchdog(&self) -> SlaWatchdog {
        SlaWatchdog::new(
            self.ledger.clone(),
            self.refunds.clone(),
            self.config.sla.clone(),
        )
    }

    pub fn retry_scheduler(&self) -> RetryScheduler {
        RetryScheduler::new(
            self.ledger.clone(),
            self.queue.clone(),
            self.refunds.clone(),
            self.config.retry_sweep.clone(),
        )
    }

    /// Starts the fulfillment worker and the three sweeps. Each task exits
    /// when `shutdown_rx` flips to `true`.
    pub fn spawn_workers(
        &self,
        receiver: FulfillmentReceiver,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let worker = FulfillmentWorker::new(
            self.dispatcher.clone(),
            receiver,
            self.config.fulfillment.clone(),
        );

        let handles = vec![
            tokio::spawn(worker.run(shutdown_rx.clone())),
            tokio::spawn(self.order_expiry().run(shutdown_rx.clone())),
            tokio::spawn(self.sla_watchdog().run(shutdown_rx.clone())),
            tokio::spawn(self.retry_scheduler().run(shutdown_rx)),
        ];
        info!(workers = handles.len(), "background workers started");
        handles
    }
}
