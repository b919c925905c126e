//! In-process repository implementations.
//!
//! Used by the test suites and by `SKIP_EXTERNALS=true` local runs. Each
//! store guards its map with a single `RwLock`, so every trait method is
//! atomic with respect to the others, including the order compare-and-swap.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::database::fulfillment_repository::{
    AttemptOutcome, FulfillmentAttempt, FulfillmentAttemptRepository,
};
use crate::database::order_repository::{
    Order, OrderPatch, OrderRepository, OrderScan, OrderStatus,
};
use crate::database::payment_session_repository::{
    PaymentSession, PaymentSessionRepository, SessionStatus,
};
use crate::database::webhook_repository::{WebhookEvent, WebhookEventRepository};

#[derive(Default)]
pub struct InMemoryOrderRepository {
    orders: RwLock<HashMap<String, Order>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored order, for before/after comparisons.
    pub async fn snapshot(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.orders.read().await.values().cloned().collect();
        orders.sort_by(|a, b| a.id.cmp(&b.id));
        orders
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn insert(&self, order: &Order) -> Result<(), DatabaseError> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(DatabaseError::unique_violation("orders_pkey"));
        }
        orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn find_by_id(&self, order_id: &str) -> Result<Option<Order>, DatabaseError> {
        Ok(self.orders.read().await.get(order_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        order_id: &str,
        expected_version: i64,
        from: &[OrderStatus],
        to: OrderStatus,
        patch: &OrderPatch,
    ) -> Result<Option<Order>, DatabaseError> {
        let mut orders = self.orders.write().await;
        let Some(order) = orders.get_mut(order_id) else {
            return Ok(None);
        };
        if order.version != expected_version || !from.contains(&order.status) {
            return Ok(None);
        }
        patch.apply(order, to, Utc::now());
        Ok(Some(order.clone()))
    }

    async fn find_by_status(
        &self,
        statuses: &[OrderStatus],
        scan: OrderScan,
        limit: i64,
    ) -> Result<Vec<Order>, DatabaseError> {
        let orders = self.orders.read().await;
        let mut matched: Vec<Order> = orders
            .values()
            .filter(|o| statuses.contains(&o.status) && scan.matches(o))
            .cloned()
            .collect();
        matched.sort_by_key(|o| o.updated_at);
        matched.truncate(limit.max(0) as usize);
        Ok(matched)
    }
}

#[derive(Default)]
pub struct InMemoryPaymentSessionRepository {
    sessions: RwLock<Vec<PaymentSession>>,
}

impl InMemoryPaymentSessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentSessionRepository for InMemoryPaymentSessionRepository {
    async fn insert(&self, session: &PaymentSession) -> Result<(), DatabaseError> {
        let mut sessions = self.sessions.write().await;
        if sessions.iter().any(|s| s.id == session.id) {
            return Err(DatabaseError::unique_violation("payment_sessions_pkey"));
        }
        if session.status == SessionStatus::Pending
            && sessions
                .iter()
                .any(|s| s.order_id == session.order_id && s.status == SessionStatus::Pending)
        {
            return Err(DatabaseError::unique_violation(
                "uq_payment_sessions_active",
            ));
        }
        sessions.push(session.clone());
        Ok(())
    }

    async fn find_active_for_order(
        &self,
        order_id: &str,
    ) -> Result<Option<PaymentSession>, DatabaseError> {
        Ok(self
            .sessions
            .read()
            .await
            .iter()
            .filter(|s| s.order_id == order_id && s.status == SessionStatus::Pending)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn settle(&self, session_id: Uuid, status: SessionStatus) -> Result<bool, DatabaseError> {
        let mut sessions = self.sessions.write().await;
        match sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.status == SessionStatus::Pending)
        {
            Some(session) => {
                session.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expire_active_for_order(&self, order_id: &str) -> Result<u64, DatabaseError> {
        let mut sessions = self.sessions.write().await;
        let mut expired = 0;
        for session in sessions
            .iter_mut()
            .filter(|s| s.order_id == order_id && s.status == SessionStatus::Pending)
        {
            session.status = SessionStatus::Expired;
            expired += 1;
        }
        Ok(expired)
    }

    async fn list_for_order(&self, order_id: &str) -> Result<Vec<PaymentSession>, DatabaseError> {
        Ok(self
            .sessions
            .read()
            .await
            .iter()
            .filter(|s| s.order_id == order_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryWebhookEventRepository {
    events: RwLock<HashMap<String, WebhookEvent>>,
}

impl InMemoryWebhookEventRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookEventRepository for InMemoryWebhookEventRepository {
    async fn record_received(&self, event: &WebhookEvent) -> Result<bool, DatabaseError> {
        let mut events = self.events.write().await;
        if events.contains_key(&event.event_id) {
            return Ok(false);
        }
        events.insert(event.event_id.clone(), event.clone());
        Ok(true)
    }

    async fn mark_processed(&self, event_id: &str, outcome: &str) -> Result<(), DatabaseError> {
        if let Some(event) = self.events.write().await.get_mut(event_id) {
            if event.processed_at.is_none() {
                event.processed_at = Some(Utc::now());
                event.outcome = Some(outcome.to_string());
            }
        }
        Ok(())
    }

    async fn find(&self, event_id: &str) -> Result<Option<WebhookEvent>, DatabaseError> {
        Ok(self.events.read().await.get(event_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryFulfillmentAttemptRepository {
    attempts: RwLock<Vec<FulfillmentAttempt>>,
}

impl InMemoryFulfillmentAttemptRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FulfillmentAttemptRepository for InMemoryFulfillmentAttemptRepository {
    async fn start(&self, attempt: &FulfillmentAttempt) -> Result<(), DatabaseError> {
        let mut attempts = self.attempts.write().await;
        if attempts
            .iter()
            .any(|a| a.order_id == attempt.order_id && a.attempt_number == attempt.attempt_number)
        {
            return Err(DatabaseError::unique_violation("fulfillment_attempts_pkey"));
        }
        attempts.push(attempt.clone());
        Ok(())
    }

    async fn complete(
        &self,
        order_id: &str,
        attempt_number: i32,
        outcome: AttemptOutcome,
        detail: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let mut attempts = self.attempts.write().await;
        match attempts.iter_mut().find(|a| {
            a.order_id == order_id && a.attempt_number == attempt_number && a.completed_at.is_none()
        }) {
            Some(attempt) => {
                attempt.completed_at = Some(Utc::now());
                attempt.outcome = Some(outcome);
                attempt.detail = detail.map(str::to_string);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_for_order(
        &self,
        order_id: &str,
    ) -> Result<Vec<FulfillmentAttempt>, DatabaseError> {
        let mut matched: Vec<FulfillmentAttempt> = self
            .attempts
            .read()
            .await
            .iter()
            .filter(|a| a.order_id == order_id)
            .cloned()
            .collect();
        matched.sort_by_key(|a| a.attempt_number);
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pending_order(id: &str) -> Order {
        let now = Utc::now();
        Order {
            id: id.to_string(),
            game_id: "mlbb".to_string(),
            denom_code: "86dm".to_string(),
            player_id: "12345".to_string(),
            server_id: None,
            amount: 20_000,
            currency: "IDR".to_string(),
            status: OrderStatus::PendingPayment,
            payment_ref: None,
            fulfillment_attempts: 0,
            refund_attempts: 0,
            next_retry_at: None,
            last_error: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    #[tokio::test]
    async fn cas_rejects_stale_version_and_wrong_status() {
        let repo = InMemoryOrderRepository::new();
        repo.insert(&pending_order("ord_a")).await.unwrap();
        let patch = OrderPatch::default();

        let stale = repo
            .compare_and_swap("ord_a", 7, &[OrderStatus::PendingPayment], OrderStatus::Paid, &patch)
            .await
            .unwrap();
        assert!(stale.is_none());

        let wrong_status = repo
            .compare_and_swap("ord_a", 1, &[OrderStatus::Paid], OrderStatus::Fulfilling, &patch)
            .await
            .unwrap();
        assert!(wrong_status.is_none());

        let applied = repo
            .compare_and_swap("ord_a", 1, &[OrderStatus::PendingPayment], OrderStatus::Paid, &patch)
            .await
            .unwrap()
            .expect("guard holds");
        assert_eq!(applied.version, 2);
        assert_eq!(applied.status, OrderStatus::Paid);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cas_has_exactly_one_winner() {
        let repo = Arc::new(InMemoryOrderRepository::new());
        repo.insert(&pending_order("ord_race")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.compare_and_swap(
                    "ord_race",
                    1,
                    &[OrderStatus::PendingPayment],
                    OrderStatus::Paid,
                    &OrderPatch::default(),
                )
                .await
                .unwrap()
                .is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn duplicate_attempt_number_is_rejected() {
        let repo = InMemoryFulfillmentAttemptRepository::new();
        let attempt = FulfillmentAttempt {
            order_id: "ord_a".to_string(),
            attempt_number: 1,
            publisher: "publisher-a".to_string(),
            started_at: Utc::now(),
            completed_at: None,
            outcome: None,
            detail: None,
        };
        repo.start(&attempt).await.unwrap();
        let err = repo.start(&attempt).await.unwrap_err();
        assert!(err.is_unique_violation());

        assert!(repo
            .complete("ord_a", 1, AttemptOutcome::Success, None)
            .await
            .unwrap());
        assert!(!repo
            .complete("ord_a", 1, AttemptOutcome::PermanentFailure, Some("late"))
            .await
            .unwrap());
        let stored = repo.list_for_order("ord_a").await.unwrap();
        assert_eq!(stored[0].outcome, Some(AttemptOutcome::Success));
    }

    #[tokio::test]
    async fn webhook_event_keeps_first_delivery() {
        let repo = InMemoryWebhookEventRepository::new();
        let first = WebhookEvent::received("evt1", Some("ord_a"), "{\"a\":1}");
        let second = WebhookEvent::received("evt1", Some("ord_a"), "{\"a\":2}");

        assert!(repo.record_received(&first).await.unwrap());
        assert!(!repo.record_received(&second).await.unwrap());
        repo.mark_processed("evt1", "paid").await.unwrap();

        let stored = repo.find("evt1").await.unwrap().unwrap();
        assert_eq!(stored.raw_payload, "{\"a\":1}");
        assert_eq!(stored.outcome.as_deref(), Some("paid"));
    }
}
