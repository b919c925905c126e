#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ciel_topup::config::PaymentConfig;
use ciel_topup::database::memory::{
    InMemoryFulfillmentAttemptRepository, InMemoryOrderRepository,
    InMemoryPaymentSessionRepository, InMemoryWebhookEventRepository,
};
use ciel_topup::database::order_repository::Order;
use ciel_topup::database::webhook_repository::WebhookEventRepository;
use ciel_topup::engine::{Engine, EngineConfig, EngineDeps};
use ciel_topup::payments::error::{PaymentError, PaymentResult};
use ciel_topup::payments::provider::PaymentProvider;
use ciel_topup::payments::providers::MockPaymentProvider;
use ciel_topup::payments::types::{
    PaymentMethod, ProviderSession, RefundReceipt, RefundRequest, SessionRequest,
};
use ciel_topup::payments::utils::sign_hmac_sha256_hex;
use ciel_topup::services::catalog::Catalog;
use ciel_topup::services::idempotency::{IdempotencyPolicy, InMemoryIdempotencyStore};
use ciel_topup::services::order_ledger::NewOrder;
use ciel_topup::workers::fulfillment::publisher::{DeliveryReceipt, DeliveryRequest};
use ciel_topup::workers::fulfillment::{
    FulfillmentReceiver, PublisherClient, PublisherError, PublisherRegistry, RetryPolicy,
};
use ciel_topup::workers::refund_coordinator::RefundCoordinatorConfig;
use ciel_topup::workers::sla_watchdog::SlaWatchdogConfig;

pub const WEBHOOK_SECRET: &str = "whsec_integration_secret";

/// Publisher that replays a script of results, then succeeds.
#[derive(Default)]
pub struct ScriptedPublisher {
    script: Mutex<VecDeque<Result<(), PublisherError>>>,
    pub calls: AtomicUsize,
}

impl ScriptedPublisher {
    pub fn new(script: Vec<Result<(), PublisherError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_transiently(times: usize) -> Self {
        Self::new(
            (0..times)
                .map(|i| Err(PublisherError::Transient(format!("HTTP 503: attempt {}", i + 1))))
                .collect(),
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublisherClient for ScriptedPublisher {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, PublisherError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        next.map(|()| DeliveryReceipt {
            reference: format!("pub_{}_{}", request.order_id, request.attempt),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Mock checkout that counts refund calls and can fail them.
pub struct RecordingProvider {
    inner: MockPaymentProvider,
    refund_failures: Mutex<VecDeque<PaymentError>>,
    stall_next_refund: AtomicBool,
    pub refunds: Mutex<Vec<RefundRequest>>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::with_refund_failures(Vec::new())
    }

    pub fn with_refund_failures(failures: Vec<PaymentError>) -> Self {
        Self {
            inner: MockPaymentProvider::new("https://checkout.test"),
            refund_failures: Mutex::new(failures.into()),
            stall_next_refund: AtomicBool::new(false),
            refunds: Mutex::new(Vec::new()),
        }
    }

    /// The next refund call never answers, like a process dying mid-call.
    pub fn stalling_first_refund() -> Self {
        let provider = Self::new();
        provider.stall_next_refund.store(true, Ordering::SeqCst);
        provider
    }

    pub fn refund_calls(&self) -> usize {
        self.refunds.lock().unwrap().len()
    }
}

pub fn transient_refund_error() -> PaymentError {
    PaymentError::ProviderError {
        provider: "MOCK".to_string(),
        message: "upstream unavailable".to_string(),
        provider_code: Some("503".to_string()),
        retryable: true,
    }
}

#[async_trait]
impl PaymentProvider for RecordingProvider {
    async fn create_session(&self, request: SessionRequest) -> PaymentResult<ProviderSession> {
        self.inner.create_session(request).await
    }

    async fn refund(&self, request: RefundRequest) -> PaymentResult<RefundReceipt> {
        self.refunds.lock().unwrap().push(request.clone());
        if self.stall_next_refund.swap(false, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(err) = self.refund_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.inner.refund(request).await
    }

    fn name(&self) -> &str {
        "MOCK"
    }
}

/// Retries without waiting, so tests can drive every attempt directly.
pub fn immediate_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        jitter: 0.0,
    }
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        payment: PaymentConfig {
            webhook_secret: WEBHOOK_SECRET.to_string(),
            ..Default::default()
        },
        idempotency: IdempotencyPolicy {
            wait: Duration::from_secs(2),
            ..Default::default()
        },
        retry: immediate_retries(5),
        refund: RefundCoordinatorConfig {
            max_attempts: 5,
            ..Default::default()
        },
        publisher_timeout: Duration::from_secs(2),
        sla: SlaWatchdogConfig {
            sla: Duration::from_secs(1800),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub struct TestApp {
    pub engine: Engine,
    pub jobs: FulfillmentReceiver,
    pub orders: Arc<InMemoryOrderRepository>,
    pub attempts: Arc<InMemoryFulfillmentAttemptRepository>,
    pub provider: Arc<RecordingProvider>,
}

pub fn test_app(
    provider: RecordingProvider,
    publisher: Arc<dyn PublisherClient>,
    config: EngineConfig,
) -> TestApp {
    test_app_with_events(
        provider,
        publisher,
        config,
        Arc::new(InMemoryWebhookEventRepository::new()),
    )
}

pub fn test_app_with_events(
    provider: RecordingProvider,
    publisher: Arc<dyn PublisherClient>,
    config: EngineConfig,
    webhook_events: Arc<dyn WebhookEventRepository>,
) -> TestApp {
    let orders = Arc::new(InMemoryOrderRepository::new());
    let attempts = Arc::new(InMemoryFulfillmentAttemptRepository::new());
    let provider = Arc::new(provider);

    let deps = EngineDeps {
        orders: orders.clone(),
        sessions: Arc::new(InMemoryPaymentSessionRepository::new()),
        webhook_events,
        attempts: attempts.clone(),
        idempotency: Arc::new(InMemoryIdempotencyStore::new()),
        provider: provider.clone(),
        publishers: PublisherRegistry::single(publisher),
        catalog: Catalog::default(),
    };
    let (engine, jobs) = Engine::new(deps, config);

    TestApp {
        engine,
        jobs,
        orders,
        attempts,
        provider,
    }
}

impl TestApp {
    pub async fn create_order(&self) -> Order {
        self.engine
            .ledger
            .create_order(NewOrder {
                game_id: "mlbb".to_string(),
                denom_code: "86dm".to_string(),
                player_id: "12345".to_string(),
                server_id: Some("2001".to_string()),
            })
            .await
            .unwrap()
    }

    /// Creates an order, opens a QRIS session and confirms it by webhook.
    pub async fn paid_order(&mut self) -> Order {
        let order = self.create_order().await;
        self.engine
            .gateway
            .create_session(&order.id, PaymentMethod::Qris)
            .await
            .unwrap();
        let (raw, signature) = signed_webhook(&format!("evt_{}", order.id), &order.id, "success");
        self.engine
            .webhooks
            .process(&raw, Some(&signature))
            .await
            .unwrap();
        let job = self.jobs.try_recv().expect("fulfillment job queued");
        assert_eq!(job.order_id, order.id);
        self.engine.ledger.get(&order.id).await.unwrap()
    }

    pub async fn order(&self, order_id: &str) -> Order {
        self.engine.ledger.get(order_id).await.unwrap()
    }
}

pub fn signed_webhook(event_id: &str, order_id: &str, status: &str) -> (Vec<u8>, String) {
    let raw = serde_json::to_vec(&json!({
        "eventId": event_id,
        "orderId": order_id,
        "status": status,
    }))
    .unwrap();
    let signature = sign_hmac_sha256_hex(&raw, WEBHOOK_SECRET);
    (raw, signature)
}
