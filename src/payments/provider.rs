use async_trait::async_trait;

use crate::payments::error::PaymentResult;
use crate::payments::types::{
    PaymentMethod, ProviderSession, RefundReceipt, RefundRequest, SessionRequest,
};

/// Outbound side of a payment provider integration.
///
/// Webhook verification is not part of the trait: every provider signs
/// notifications with the shared secret held by the gateway.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_session(&self, request: SessionRequest) -> PaymentResult<ProviderSession>;

    /// Refund a captured payment. Must be safe to repeat with the same
    /// `idempotency_key`.
    async fn refund(&self, request: RefundRequest) -> PaymentResult<RefundReceipt>;

    fn name(&self) -> &str;

    fn supported_methods(&self) -> &'static [PaymentMethod] {
        &[PaymentMethod::Qris, PaymentMethod::Ewallet, PaymentMethod::Va]
    }
}
