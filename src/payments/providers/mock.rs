use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::payments::error::PaymentResult;
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{ProviderSession, RefundReceipt, RefundRequest, SessionRequest};

/// Sandbox provider: issues checkout links on a local base URL and accepts
/// every refund. Payments are confirmed by posting a signed webhook.
#[derive(Debug, Clone)]
pub struct MockPaymentProvider {
    checkout_base_url: String,
}

impl MockPaymentProvider {
    pub const NAME: &'static str = "MOCK";

    pub fn new(checkout_base_url: impl Into<String>) -> Self {
        Self {
            checkout_base_url: checkout_base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn create_session(&self, request: SessionRequest) -> PaymentResult<ProviderSession> {
        let provider_session_id = format!("mock_{}", Uuid::new_v4().simple());
        Ok(ProviderSession {
            payment_url: format!(
                "{}/pay/{}?method={}&session={}",
                self.checkout_base_url,
                request.order_id,
                request.method.as_str(),
                provider_session_id
            ),
            provider_session_id,
        })
    }

    async fn refund(&self, request: RefundRequest) -> PaymentResult<RefundReceipt> {
        info!(
            order_id = %request.order_id,
            amount = request.amount,
            reason = %request.reason,
            "mock refund accepted"
        );
        Ok(RefundReceipt {
            refund_id: format!("mock_rf_{}", request.order_id),
            status: "ACCEPTED".to_string(),
        })
    }

    fn name(&self) -> &str {
        Self::NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::PaymentMethod;
    use chrono::Utc;

    #[tokio::test]
    async fn mock_session_links_back_to_the_order() {
        let provider = MockPaymentProvider::new("https://example.com/");
        let session = provider
            .create_session(SessionRequest {
                order_id: "ord_abc".to_string(),
                amount: 20_000,
                fee: 100,
                currency: "IDR".to_string(),
                method: PaymentMethod::Qris,
                expires_at: Utc::now(),
                idempotency_key: "session:ord_abc".to_string(),
            })
            .await
            .unwrap();

        assert!(session
            .payment_url
            .starts_with("https://example.com/pay/ord_abc?method=QRIS"));
        assert!(session.provider_session_id.starts_with("mock_"));
    }

    #[tokio::test]
    async fn mock_refund_is_deterministic_per_order() {
        let provider = MockPaymentProvider::new("https://example.com");
        let request = RefundRequest {
            order_id: "ord_abc".to_string(),
            payment_ref: None,
            amount: 20_000,
            currency: "IDR".to_string(),
            reason: "publisher rejected".to_string(),
            idempotency_key: "refund:ord_abc".to_string(),
        };
        let first = provider.refund(request.clone()).await.unwrap();
        let second = provider.refund(request).await.unwrap();
        assert_eq!(first, second);
    }
}
