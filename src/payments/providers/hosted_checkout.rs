use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{ProviderSession, RefundReceipt, RefundRequest, SessionRequest};
use crate::payments::utils::PaymentHttpClient;

/// Generic hosted-checkout gateway speaking a small JSON contract:
///
/// * `POST {base}/v1/sessions` → `{ "id", "redirectUrl" }`
/// * `POST {base}/v1/refunds`  → `{ "refundId", "status" }`
///
/// Both calls carry a bearer secret and an `Idempotency-Key` header.
#[derive(Debug, Clone)]
pub struct HostedCheckoutConfig {
    pub base_url: String,
    pub secret_key: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for HostedCheckoutConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            secret_key: String::new(),
            timeout_secs: 10,
            max_retries: 1,
        }
    }
}

impl HostedCheckoutConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let base_url =
            std::env::var("PAYMENT_BASE_URL").map_err(|_| PaymentError::ConfigurationError {
                message: "PAYMENT_BASE_URL is required for the hosted provider".to_string(),
            })?;
        let secret_key =
            std::env::var("PAYMENT_SECRET_KEY").map_err(|_| PaymentError::ConfigurationError {
                message: "PAYMENT_SECRET_KEY is required for the hosted provider".to_string(),
            })?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key,
            timeout_secs: std::env::var("PAYMENT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(10),
            max_retries: std::env::var("PAYMENT_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(1),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostedSessionResponse {
    id: String,
    redirect_url: String,
}

pub struct HostedCheckoutProvider {
    config: HostedCheckoutConfig,
    http: PaymentHttpClient,
}

impl HostedCheckoutProvider {
    pub const NAME: &'static str = "HOSTED";

    pub fn new(config: HostedCheckoutConfig) -> PaymentResult<Self> {
        if config.base_url.is_empty() {
            return Err(PaymentError::ConfigurationError {
                message: "hosted checkout base URL must not be empty".to_string(),
            });
        }
        let http = PaymentHttpClient::new(
            Self::NAME,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(HostedCheckoutConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }
}

#[async_trait]
impl PaymentProvider for HostedCheckoutProvider {
    async fn create_session(&self, request: SessionRequest) -> PaymentResult<ProviderSession> {
        if request.total_amount() <= 0 {
            return Err(PaymentError::ValidationError {
                message: "amount must be positive".to_string(),
                field: Some("amount".to_string()),
            });
        }

        let payload = serde_json::json!({
            "reference": request.order_id,
            "amount": request.total_amount(),
            "currency": request.currency,
            "channel": request.method.as_str(),
            "expiresAt": request.expires_at.to_rfc3339(),
        });

        let raw: HostedSessionResponse = self
            .http
            .post_json(
                &self.endpoint("/v1/sessions"),
                Some(&self.config.secret_key),
                &request.idempotency_key,
                &payload,
            )
            .await?;

        info!(
            order_id = %request.order_id,
            provider_session_id = %raw.id,
            "hosted checkout session created"
        );

        Ok(ProviderSession {
            provider_session_id: raw.id,
            payment_url: raw.redirect_url,
        })
    }

    async fn refund(&self, request: RefundRequest) -> PaymentResult<RefundReceipt> {
        let payload = serde_json::json!({
            "reference": request.order_id,
            "sessionId": request.payment_ref,
            "amount": request.amount,
            "currency": request.currency,
            "reason": request.reason,
        });

        self.http
            .post_json(
                &self.endpoint("/v1/refunds"),
                Some(&self.config.secret_key),
                &request.idempotency_key,
                &payload,
            )
            .await
    }

    fn name(&self) -> &str {
        Self::NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_base_url_is_rejected() {
        let result = HostedCheckoutProvider::new(HostedCheckoutConfig::default());
        assert!(matches!(
            result,
            Err(PaymentError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn endpoints_are_joined_onto_base_url() {
        let provider = HostedCheckoutProvider::new(HostedCheckoutConfig {
            base_url: "https://pay.example.test".to_string(),
            secret_key: "sk_test".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            provider.endpoint("/v1/refunds"),
            "https://pay.example.test/v1/refunds"
        );
        assert_eq!(provider.name(), "HOSTED");
    }
}
