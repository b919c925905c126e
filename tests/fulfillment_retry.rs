mod common;

use std::sync::Arc;
use std::time::Duration;

use ciel_topup::database::fulfillment_repository::{AttemptOutcome, FulfillmentAttemptRepository};
use ciel_topup::database::order_repository::OrderStatus;
use ciel_topup::payments::error::PaymentError;
use ciel_topup::workers::fulfillment::{FulfillmentOutcome, PublisherError};
use ciel_topup::workers::retry_scheduler::RetrySweep;

use common::{
    engine_config, test_app, transient_refund_error, RecordingProvider, ScriptedPublisher,
};

async fn settle_clock() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn transient_failures_exhaust_retries_and_refund_once() {
    let publisher = Arc::new(ScriptedPublisher::failing_transiently(5));
    let mut app = test_app(RecordingProvider::new(), publisher.clone(), engine_config());
    let order = app.paid_order().await;

    for attempt in 1..=4 {
        let outcome = app
            .engine
            .dispatcher
            .attempt_fulfillment(&order.id)
            .await
            .unwrap();
        assert!(
            matches!(outcome, FulfillmentOutcome::RetryScheduled { attempt: a, .. } if a == attempt),
            "attempt {attempt}: {outcome:?}"
        );
        let current = app.order(&order.id).await;
        assert_eq!(current.status, OrderStatus::FailedRetry);
        assert!(current.next_retry_at.is_some());
    }

    let outcome = app
        .engine
        .dispatcher
        .attempt_fulfillment(&order.id)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        FulfillmentOutcome::RefundRequested(OrderStatus::FailedRefunded)
    );

    let refunded = app.order(&order.id).await;
    assert_eq!(refunded.status, OrderStatus::FailedRefunded);
    assert_eq!(refunded.fulfillment_attempts, 5);
    assert_eq!(refunded.refund_attempts, 1);
    assert_eq!(publisher.calls(), 5);
    assert_eq!(app.provider.refund_calls(), 1);

    // nothing left for a late job or a sweep to do
    let again = app
        .engine
        .dispatcher
        .attempt_fulfillment(&order.id)
        .await
        .unwrap();
    assert_eq!(again, FulfillmentOutcome::Skipped);
    let sweep = app.engine.retry_scheduler().run_cycle().await.unwrap();
    assert_eq!(sweep, RetrySweep::default());
    assert_eq!(app.provider.refund_calls(), 1);

    let attempts = app.attempts.list_for_order(&order.id).await.unwrap();
    assert_eq!(attempts.len(), 5);
    assert!(attempts
        .iter()
        .all(|a| a.outcome == Some(AttemptOutcome::TransientFailure)));
}

#[tokio::test]
async fn recovered_publisher_fulfills_on_retry() {
    let publisher = Arc::new(ScriptedPublisher::failing_transiently(2));
    let mut app = test_app(RecordingProvider::new(), publisher.clone(), engine_config());
    let order = app.paid_order().await;

    for _ in 0..2 {
        app.engine
            .dispatcher
            .attempt_fulfillment(&order.id)
            .await
            .unwrap();
    }
    let outcome = app
        .engine
        .dispatcher
        .attempt_fulfillment(&order.id)
        .await
        .unwrap();
    assert_eq!(outcome, FulfillmentOutcome::Fulfilled);

    let fulfilled = app.order(&order.id).await;
    assert_eq!(fulfilled.status, OrderStatus::Fulfilled);
    assert_eq!(fulfilled.fulfillment_attempts, 3);
    assert!(fulfilled.last_error.is_none());
    assert_eq!(app.provider.refund_calls(), 0);
}

#[tokio::test]
async fn permanent_rejection_refunds_immediately() {
    let publisher = Arc::new(ScriptedPublisher::new(vec![Err(PublisherError::Permanent(
        "HTTP 400: unknown player".to_string(),
    ))]));
    let mut app = test_app(RecordingProvider::new(), publisher, engine_config());
    let order = app.paid_order().await;

    let outcome = app
        .engine
        .dispatcher
        .attempt_fulfillment(&order.id)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        FulfillmentOutcome::RefundRequested(OrderStatus::FailedRefunded)
    );

    let refunded = app.order(&order.id).await;
    assert_eq!(refunded.status, OrderStatus::FailedRefunded);
    assert_eq!(refunded.fulfillment_attempts, 1);
    assert_eq!(app.provider.refund_calls(), 1);
    let refund = app.provider.refunds.lock().unwrap()[0].clone();
    assert_eq!(refund.amount, order.amount);
    assert_eq!(refund.reason, "permanent_failure");
}

#[tokio::test]
async fn watchdog_refunds_orders_past_the_deadline() {
    let mut config = engine_config();
    config.sla.sla = Duration::ZERO;
    let mut app = test_app(
        RecordingProvider::new(),
        Arc::new(ScriptedPublisher::default()),
        config,
    );
    let order = app.paid_order().await;
    app.engine
        .ledger
        .transition(
            &order.id,
            order.version,
            &[OrderStatus::Paid],
            OrderStatus::Fulfilling,
        )
        .await
        .unwrap();
    settle_clock().await;

    let refunded = app.engine.sla_watchdog().run_cycle().await.unwrap();
    assert_eq!(refunded, 1);
    assert_eq!(app.order(&order.id).await.status, OrderStatus::FailedRefunded);
    assert_eq!(app.provider.refund_calls(), 1);

    assert_eq!(app.engine.sla_watchdog().run_cycle().await.unwrap(), 0);
    assert_eq!(app.provider.refund_calls(), 1);
}

#[tokio::test]
async fn watchdog_leaves_fresh_orders_alone() {
    let mut app = test_app(
        RecordingProvider::new(),
        Arc::new(ScriptedPublisher::default()),
        engine_config(),
    );
    let order = app.paid_order().await;
    app.engine
        .ledger
        .transition(
            &order.id,
            order.version,
            &[OrderStatus::Paid],
            OrderStatus::Fulfilling,
        )
        .await
        .unwrap();

    assert_eq!(app.engine.sla_watchdog().run_cycle().await.unwrap(), 0);
    assert_eq!(app.order(&order.id).await.status, OrderStatus::Fulfilling);
}

#[tokio::test]
async fn rejected_refund_lands_in_manual_queue() {
    let provider = RecordingProvider::with_refund_failures(vec![PaymentError::ProviderError {
        provider: "MOCK".to_string(),
        message: "refund window closed".to_string(),
        provider_code: Some("422".to_string()),
        retryable: false,
    }]);
    let publisher = Arc::new(ScriptedPublisher::new(vec![Err(PublisherError::Permanent(
        "HTTP 404: unknown denomination".to_string(),
    ))]));
    let mut app = test_app(provider, publisher, engine_config());
    let order = app.paid_order().await;

    let outcome = app
        .engine
        .dispatcher
        .attempt_fulfillment(&order.id)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        FulfillmentOutcome::RefundRequested(OrderStatus::RefundFailedManual)
    );

    let stuck = app.order(&order.id).await;
    assert_eq!(stuck.status, OrderStatus::RefundFailedManual);
    assert!(stuck.last_error.as_deref().unwrap().contains("refund window closed"));

    let queue = app.engine.ledger.manual_review_queue(50).await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].id, order.id);
}

#[tokio::test]
async fn failing_refunds_are_retried_then_escalated() {
    let provider = RecordingProvider::with_refund_failures(
        (0..5).map(|_| transient_refund_error()).collect(),
    );
    let publisher = Arc::new(ScriptedPublisher::new(vec![Err(PublisherError::Permanent(
        "HTTP 400: invalid server".to_string(),
    ))]));
    let mut app = test_app(provider, publisher, engine_config());
    let order = app.paid_order().await;

    let outcome = app
        .engine
        .dispatcher
        .attempt_fulfillment(&order.id)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        FulfillmentOutcome::RefundRequested(OrderStatus::Refunding)
    );

    for round in 2..=4 {
        settle_clock().await;
        let sweep = app.engine.retry_scheduler().run_cycle().await.unwrap();
        assert_eq!(sweep.refunds_retried, 1, "round {round}");
        let current = app.order(&order.id).await;
        assert_eq!(current.status, OrderStatus::Refunding);
        assert_eq!(current.refund_attempts, round);
    }

    settle_clock().await;
    app.engine.retry_scheduler().run_cycle().await.unwrap();
    let escalated = app.order(&order.id).await;
    assert_eq!(escalated.status, OrderStatus::RefundFailedManual);
    assert_eq!(escalated.refund_attempts, 5);
    assert_eq!(app.provider.refund_calls(), 5);

    // every call reused the same provider idempotency key
    let refunds = app.provider.refunds.lock().unwrap().clone();
    assert!(refunds
        .windows(2)
        .all(|w| w[0].idempotency_key == w[1].idempotency_key));
}

#[tokio::test]
async fn abandoned_refund_claim_is_taken_over() {
    let mut config = engine_config();
    config.sla.sla = Duration::ZERO;
    config.refund.claim_lease = Duration::ZERO;
    let mut app = test_app(
        RecordingProvider::stalling_first_refund(),
        Arc::new(ScriptedPublisher::default()),
        config,
    );
    let order = app.paid_order().await;
    app.engine
        .ledger
        .transition(
            &order.id,
            order.version,
            &[OrderStatus::Paid],
            OrderStatus::Fulfilling,
        )
        .await
        .unwrap();
    settle_clock().await;

    // the refund owner dies while the provider call is outstanding
    let watchdog = app.engine.sla_watchdog();
    let owner = tokio::spawn(async move { watchdog.run_cycle().await });
    for _ in 0..200 {
        if app.provider.refund_calls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(app.provider.refund_calls(), 1);
    owner.abort();
    let _ = owner.await;

    let abandoned = app.order(&order.id).await;
    assert_eq!(abandoned.status, OrderStatus::Refunding);
    assert!(abandoned.next_retry_at.is_some());

    settle_clock().await;
    let sweep = app.engine.retry_scheduler().run_cycle().await.unwrap();
    assert_eq!(sweep.refunds_retried, 1);

    let refunded = app.order(&order.id).await;
    assert_eq!(refunded.status, OrderStatus::FailedRefunded);
    assert_eq!(app.provider.refund_calls(), 2);
    let refunds = app.provider.refunds.lock().unwrap().clone();
    assert_eq!(refunds[0].idempotency_key, refunds[1].idempotency_key);
}

#[tokio::test]
async fn live_refund_claim_is_not_stolen() {
    let mut config = engine_config();
    config.sla.sla = Duration::ZERO;
    let mut app = test_app(
        RecordingProvider::stalling_first_refund(),
        Arc::new(ScriptedPublisher::default()),
        config,
    );
    let order = app.paid_order().await;
    app.engine
        .ledger
        .transition(
            &order.id,
            order.version,
            &[OrderStatus::Paid],
            OrderStatus::Fulfilling,
        )
        .await
        .unwrap();
    settle_clock().await;

    let watchdog = app.engine.sla_watchdog();
    let owner = tokio::spawn(async move { watchdog.run_cycle().await });
    for _ in 0..200 {
        if app.provider.refund_calls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let sweep = app.engine.retry_scheduler().run_cycle().await.unwrap();
    assert_eq!(sweep.refunds_retried, 0);
    assert_eq!(app.provider.refund_calls(), 1);
    owner.abort();
}

#[tokio::test]
async fn scheduler_requeues_due_and_stale_orders() {
    let mut config = engine_config();
    config.retry_sweep.stale_paid_grace = Duration::ZERO;
    let publisher = Arc::new(ScriptedPublisher::failing_transiently(1));
    let mut app = test_app(RecordingProvider::new(), publisher, config);

    let retrying = app.paid_order().await;
    app.engine
        .dispatcher
        .attempt_fulfillment(&retrying.id)
        .await
        .unwrap();
    assert_eq!(app.order(&retrying.id).await.status, OrderStatus::FailedRetry);

    // paid, but its job was lost
    let stale = app.paid_order().await;
    settle_clock().await;

    let sweep = app.engine.retry_scheduler().run_cycle().await.unwrap();
    assert_eq!(sweep.requeued, 2);

    let mut queued = vec![
        app.jobs.try_recv().unwrap().order_id,
        app.jobs.try_recv().unwrap().order_id,
    ];
    queued.sort();
    let mut expected = vec![retrying.id.clone(), stale.id.clone()];
    expected.sort();
    assert_eq!(queued, expected);

    for order_id in &queued {
        assert_eq!(
            app.engine
                .dispatcher
                .attempt_fulfillment(order_id)
                .await
                .unwrap(),
            FulfillmentOutcome::Fulfilled
        );
    }
}

#[tokio::test]
async fn expiry_sweep_only_touches_pending_orders() {
    let mut config = engine_config();
    config.expiry.pending_ttl = Duration::ZERO;
    let mut app = test_app(
        RecordingProvider::new(),
        Arc::new(ScriptedPublisher::default()),
        config,
    );
    let pending = app.create_order().await;
    let paid = app.paid_order().await;
    settle_clock().await;

    assert_eq!(app.engine.order_expiry().run_cycle().await.unwrap(), 1);
    assert_eq!(app.order(&pending.id).await.status, OrderStatus::Expired);
    assert_eq!(app.order(&paid.id).await.status, OrderStatus::Paid);
}

#[tokio::test]
async fn unknown_order_jobs_are_errors() {
    let app = test_app(
        RecordingProvider::new(),
        Arc::new(ScriptedPublisher::default()),
        engine_config(),
    );
    assert!(app
        .engine
        .dispatcher
        .attempt_fulfillment("ord_missing")
        .await
        .is_err());
}
