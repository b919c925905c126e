mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use ciel_topup::api::{self, AppState};
use ciel_topup::database::order_repository::OrderStatus;
use ciel_topup::health::{HealthChecker, IdempotencyProbe};

use async_trait::async_trait;
use ciel_topup::database::error::DatabaseError;
use ciel_topup::database::memory::InMemoryWebhookEventRepository;
use ciel_topup::database::webhook_repository::{WebhookEvent, WebhookEventRepository};
use std::time::Duration;
use tokio::sync::watch;

use common::{
    engine_config, signed_webhook, test_app, test_app_with_events, RecordingProvider,
    ScriptedPublisher, TestApp,
};

fn app() -> (TestApp, Router) {
    let test = test_app(
        RecordingProvider::new(),
        Arc::new(ScriptedPublisher::default()),
        engine_config(),
    );
    let health = HealthChecker::new(vec![Arc::new(IdempotencyProbe::new(
        test.engine.idempotency.clone(),
    ))]);
    let router = api::router(AppState {
        engine: test.engine.clone(),
        health,
    });
    (test, router)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn order_body() -> Value {
    json!({
        "gameId": "mlbb",
        "denomCode": "86dm",
        "playerId": "12345",
        "serverId": "2001"
    })
}

#[tokio::test]
async fn create_and_read_order() {
    let (_test, router) = app();

    let (status, created) = send(&router, post_json("/orders", order_body())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "PENDING_PAYMENT");
    assert_eq!(created["amount"], 20_000);
    assert_eq!(created["currency"], "IDR");

    let order_id = created["orderId"].as_str().unwrap();
    let (status, view) = send(
        &router,
        Request::get(format!("/orders/{}", order_id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["orderId"], order_id);
    assert_eq!(view["version"], 1);
    assert_eq!(view["fulfillmentAttempts"], 0);
}

#[tokio::test]
async fn unknown_order_is_404() {
    let (_test, router) = app();
    let (status, body) = send(
        &router,
        Request::get("/orders/ord_missing").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "ORDER_NOT_FOUND");
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn invalid_order_bodies_are_rejected() {
    let (test, router) = app();

    let (status, body) = send(
        &router,
        post_json("/orders", json!({ "gameId": "mlbb", "denomCode": "86dm" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");
    assert_eq!(body["details"]["field"], "playerId");

    let (status, _) = send(
        &router,
        post_json(
            "/orders",
            json!({ "gameId": "mlbb", "denomCode": "nope", "playerId": "1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::post("/orders")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");

    assert!(test.orders.snapshot().await.is_empty());
}

#[tokio::test]
async fn idempotency_key_replays_order_creation() {
    let (test, router) = app();
    let keyed = || {
        Request::post("/orders")
            .header("content-type", "application/json")
            .header("idempotency-key", "client-key-1")
            .body(Body::from(order_body().to_string()))
            .unwrap()
    };

    let (first_status, first) = send(&router, keyed()).await;
    let (second_status, second) = send(&router, keyed()).await;
    assert_eq!(first_status, StatusCode::CREATED);
    assert_eq!(second_status, StatusCode::CREATED);
    assert_eq!(first, second);
    assert_eq!(test.orders.snapshot().await.len(), 1);

    let oversized = Request::post("/orders")
        .header("content-type", "application/json")
        .header("idempotency-key", "k".repeat(129))
        .body(Body::from(order_body().to_string()))
        .unwrap();
    let (status, _) = send(&router, oversized).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn payment_session_is_issued() {
    let (test, router) = app();
    let order = test.create_order().await;

    let (status, body) = send(
        &router,
        post_json("/payments", json!({ "orderId": order.id, "method": "QRIS" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["orderId"], order.id.as_str());
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["amount"], 20_000);
    assert!(body["paymentUrl"].as_str().unwrap().starts_with("https://"));
    assert_eq!(
        body["totalAmount"].as_i64().unwrap(),
        body["amount"].as_i64().unwrap() + body["fee"].as_i64().unwrap()
    );

    let (status, body) = send(&router, post_json("/payments", json!({ "method": "QRIS" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"]["field"], "orderId");

    let (status, _) = send(
        &router,
        post_json("/payments", json!({ "orderId": "ord_missing" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_requires_a_valid_signature() {
    let (test, router) = app();
    let order = test.create_order().await;
    let (raw, signature) = signed_webhook("evt_http", &order.id, "success");

    let unsigned = Request::post("/webhooks/payment")
        .header("content-type", "application/json")
        .body(Body::from(raw.clone()))
        .unwrap();
    let (status, body) = send(&router, unsigned).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "SIGNATURE_INVALID");
    assert_eq!(test.order(&order.id).await.status, OrderStatus::PendingPayment);

    let signed = || {
        Request::post("/webhooks/payment")
            .header("content-type", "application/json")
            .header("x-signature", signature.as_str())
            .body(Body::from(raw.clone()))
            .unwrap()
    };
    let (status, body) = send(&router, signed()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["eventId"], "evt_http");
    assert_eq!(body["result"], "paid");
    assert_eq!(test.order(&order.id).await.status, OrderStatus::Paid);

    let (status, replay) = send(&router, signed()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay, body);
}

#[tokio::test]
async fn manual_refund_queue_starts_empty() {
    let (_test, router) = app();
    let (status, body) = send(
        &router,
        Request::get("/admin/refunds/manual?limit=10")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
    assert_eq!(body["orders"], json!([]));
}

#[tokio::test]
async fn health_probes_report_up() {
    let (_test, router) = app();

    let (status, body) = send(&router, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Healthy");
    assert_eq!(body["checks"]["idempotency"]["status"], "Up");

    let (status, _) = send(
        &router,
        Request::get("/health/ready").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &router,
        Request::get("/health/live").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".to_string()));
}

#[tokio::test]
async fn request_id_is_generated_and_echoed() {
    let (_test, router) = app();

    let response = router
        .clone()
        .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let generated = response.headers().get("x-request-id").unwrap();
    assert!(!generated.is_empty());

    let response = router
        .clone()
        .oneshot(
            Request::get("/orders/ord_missing")
                .header("x-request-id", "req-abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers().get("x-request-id").unwrap(), "req-abc");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["request_id"], "req-abc");
}

/// Event log that holds every write until the gate opens.
struct GatedEvents {
    inner: InMemoryWebhookEventRepository,
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl WebhookEventRepository for GatedEvents {
    async fn record_received(&self, event: &WebhookEvent) -> Result<bool, DatabaseError> {
        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;
        self.inner.record_received(event).await
    }

    async fn mark_processed(&self, event_id: &str, outcome: &str) -> Result<(), DatabaseError> {
        self.inner.mark_processed(event_id, outcome).await
    }

    async fn find(&self, event_id: &str) -> Result<Option<WebhookEvent>, DatabaseError> {
        self.inner.find(event_id).await
    }
}

#[tokio::test]
async fn webhook_survives_a_dropped_connection() {
    let (open_gate, gate) = watch::channel(false);
    let test = test_app_with_events(
        RecordingProvider::new(),
        Arc::new(ScriptedPublisher::default()),
        engine_config(),
        Arc::new(GatedEvents {
            inner: InMemoryWebhookEventRepository::new(),
            gate,
        }),
    );
    let router = api::router(AppState {
        engine: test.engine.clone(),
        health: HealthChecker::new(Vec::new()),
    });
    let order = test.create_order().await;
    let (raw, signature) = signed_webhook("evt_dropped", &order.id, "success");
    let delivery = || {
        Request::post("/webhooks/payment")
            .header("content-type", "application/json")
            .header("x-signature", signature.as_str())
            .body(Body::from(raw.clone()))
            .unwrap()
    };

    // the provider gives up before processing finishes
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), router.clone().oneshot(delivery())).await;
    assert!(abandoned.is_err());
    open_gate.send(true).unwrap();

    for _ in 0..200 {
        if test.order(&order.id).await.status == OrderStatus::Paid {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(test.order(&order.id).await.status, OrderStatus::Paid);

    let (status, body) = send(&router, delivery()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "paid");
}
