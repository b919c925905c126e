//! Payment gateway adapter used by the order flow.
//!
//! Wraps a [`PaymentProvider`] with session bookkeeping, call timeouts and
//! webhook signature verification.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PaymentConfig;
use crate::database::error::DatabaseError;
use crate::database::order_repository::{Order, OrderPatch, OrderStatus};
use crate::database::payment_session_repository::{
    PaymentSession, PaymentSessionRepository, SessionStatus,
};
use crate::error::{AppError, AppErrorKind, DomainError};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{PaymentMethod, RefundReceipt, RefundRequest, SessionRequest};
use crate::payments::utils::verify_hmac_sha256_hex;
use crate::services::order_ledger::{LedgerError, OrderLedger};

const PAYMENT_REF_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("order {order_id} is {status}, payment needs PENDING_PAYMENT")]
    NotPayable {
        order_id: String,
        status: OrderStatus,
    },

    #[error(transparent)]
    Provider(#[from] PaymentError),

    #[error(transparent)]
    Ledger(LedgerError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<LedgerError> for GatewayError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound { order_id } => GatewayError::OrderNotFound(order_id),
            other => GatewayError::Ledger(other),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::OrderNotFound(order_id) => AppError::order_not_found(order_id),
            GatewayError::NotPayable { order_id, status } => {
                AppError::new(AppErrorKind::Domain(DomainError::InvalidOrderState {
                    order_id,
                    status,
                    expected: OrderStatus::PendingPayment.to_string(),
                }))
            }
            GatewayError::Provider(err) => err.into(),
            GatewayError::Ledger(err) => err.into(),
            GatewayError::Database(err) => err.into(),
        }
    }
}

pub struct PaymentGateway {
    provider: Arc<dyn PaymentProvider>,
    sessions: Arc<dyn PaymentSessionRepository>,
    ledger: Arc<OrderLedger>,
    config: PaymentConfig,
}

impl PaymentGateway {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        sessions: Arc<dyn PaymentSessionRepository>,
        ledger: Arc<OrderLedger>,
        config: PaymentConfig,
    ) -> Self {
        Self {
            provider,
            sessions,
            ledger,
            config,
        }
    }

    pub fn signature_header(&self) -> &str {
        &self.config.signature_header
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    fn timeout_error(&self) -> PaymentError {
        PaymentError::Timeout {
            provider: self.provider.name().to_string(),
            timeout_secs: self.config.timeout_secs,
        }
    }

    /// Opens (or reuses) a checkout session for a `PENDING_PAYMENT` order.
    pub async fn create_session(
        &self,
        order_id: &str,
        method: PaymentMethod,
    ) -> Result<PaymentSession, GatewayError> {
        let order = self.ledger.get(order_id).await?;
        ensure_payable(&order)?;

        if !self.provider.supported_methods().contains(&method) {
            return Err(PaymentError::ValidationError {
                message: format!("{} does not support {}", self.provider.name(), method),
                field: Some("method".to_string()),
            }
            .into());
        }

        let now = Utc::now();
        if let Some(active) = self.sessions.find_active_for_order(order_id).await? {
            if active.is_usable(method, now) {
                info!(order_id = %order_id, session_id = %active.id, "reusing payment session");
                return Ok(active);
            }
            self.sessions.expire_active_for_order(order_id).await?;
        }

        let fee = method.fee_for(order.amount);
        let expires_at = now + chrono::Duration::seconds(self.config.session_ttl_secs as i64);
        let request = SessionRequest {
            order_id: order.id.clone(),
            amount: order.amount,
            fee,
            currency: order.currency.clone(),
            method,
            expires_at,
            idempotency_key: format!("session:{}:{}", order.id, Uuid::new_v4().simple()),
        };

        let created = tokio::time::timeout(self.call_timeout(), self.provider.create_session(request))
            .await
            .map_err(|_| self.timeout_error())??;

        let session = PaymentSession {
            id: Uuid::new_v4(),
            order_id: order.id.clone(),
            provider: self.provider.name().to_string(),
            provider_session_id: created.provider_session_id,
            method,
            amount: order.amount,
            fee,
            payment_url: created.payment_url,
            status: SessionStatus::Pending,
            created_at: now,
            expires_at,
        };

        if let Err(err) = self.sessions.insert(&session).await {
            if err.is_unique_violation() {
                // A concurrent request opened a session first.
                if let Some(winner) = self.sessions.find_active_for_order(order_id).await? {
                    return Ok(winner);
                }
            }
            return Err(err.into());
        }

        self.attach_payment_ref(order, &session.provider_session_id)
            .await?;

        info!(
            order_id = %session.order_id,
            session_id = %session.id,
            method = %method,
            total_amount = session.total_amount(),
            "payment session created"
        );

        Ok(session)
    }

    async fn attach_payment_ref(
        &self,
        mut order: Order,
        payment_ref: &str,
    ) -> Result<(), GatewayError> {
        for _ in 0..PAYMENT_REF_ATTEMPTS {
            let patch = OrderPatch {
                payment_ref: Some(payment_ref.to_string()),
                ..Default::default()
            };
            match self
                .ledger
                .update_fields(&order.id, order.version, OrderStatus::PendingPayment, patch)
                .await
            {
                Ok(_) => return Ok(()),
                Err(LedgerError::Conflict { current_status, .. })
                    if current_status == OrderStatus::PendingPayment =>
                {
                    order = self.ledger.get(&order.id).await?;
                }
                Err(LedgerError::Conflict { current_status, .. }) => {
                    warn!(
                        order_id = %order.id,
                        status = %current_status,
                        "order left PENDING_PAYMENT before payment ref was attached"
                    );
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(order_id = %order.id, "gave up attaching payment ref after repeated conflicts");
        Ok(())
    }

    /// HMAC-SHA256 over the raw body with the shared webhook secret.
    pub fn verify_webhook_signature(&self, raw_payload: &[u8], signature: Option<&str>) -> bool {
        match signature {
            Some(sig) if !sig.trim().is_empty() => {
                verify_hmac_sha256_hex(raw_payload, &self.config.webhook_secret, sig)
            }
            _ => false,
        }
    }

    /// Refunds the captured amount of `order`. Repeating the call is safe:
    /// the provider sees the same idempotency key for every attempt.
    pub async fn refund(&self, order: &Order, reason: &str) -> PaymentResult<RefundReceipt> {
        let request = RefundRequest {
            order_id: order.id.clone(),
            payment_ref: order.payment_ref.clone(),
            amount: order.amount,
            currency: order.currency.clone(),
            reason: reason.to_string(),
            idempotency_key: format!("refund:{}", order.id),
        };

        tokio::time::timeout(self.call_timeout(), self.provider.refund(request))
            .await
            .map_err(|_| self.timeout_error())?
    }

    /// Moves the order's open session to `status`. Returns `false` when no
    /// session was pending.
    pub async fn settle_active_session(
        &self,
        order_id: &str,
        status: SessionStatus,
    ) -> Result<bool, DatabaseError> {
        match self.sessions.find_active_for_order(order_id).await? {
            Some(session) => self.sessions.settle(session.id, status).await,
            None => Ok(false),
        }
    }
}

fn ensure_payable(order: &Order) -> Result<(), GatewayError> {
    if order.status != OrderStatus::PendingPayment {
        return Err(GatewayError::NotPayable {
            order_id: order.id.clone(),
            status: order.status,
        });
    }
    Ok(())
}
