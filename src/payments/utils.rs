use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::warn;

use crate::payments::error::{PaymentError, PaymentResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    provider: String,
    timeout: Duration,
    max_retries: u32,
}

impl PaymentHttpClient {
    pub fn new(provider: &str, timeout: Duration, max_retries: u32) -> PaymentResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::ConfigurationError {
                message: format!("failed to initialize HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            provider: provider.to_string(),
            timeout,
            max_retries,
        })
    }

    /// POST a JSON body and decode the JSON answer.
    ///
    /// 429 and 5xx are retried in place with exponential backoff and then
    /// reported as retryable; other 4xx answers are final rejections.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        idempotency_key: &str,
        body: &B,
    ) -> PaymentResult<T> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            let mut request = self
                .client
                .post(url)
                .timeout(self.timeout)
                .header("Idempotency-Key", idempotency_key)
                .json(body);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            let error = match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            PaymentError::ProviderError {
                                provider: self.provider.clone(),
                                message: format!("invalid provider JSON response: {}", e),
                                provider_code: None,
                                retryable: false,
                            }
                        });
                    }

                    if status.as_u16() == 429 {
                        PaymentError::RateLimitError {
                            message: format!("{} rate limit exceeded", self.provider),
                            retry_after_seconds: None,
                        }
                    } else if status.is_server_error() {
                        PaymentError::ProviderError {
                            provider: self.provider.clone(),
                            message: format!("HTTP {}: {}", status, text),
                            provider_code: Some(status.as_u16().to_string()),
                            retryable: true,
                        }
                    } else {
                        return Err(PaymentError::Rejected {
                            provider: self.provider.clone(),
                            message: format!("HTTP {}: {}", status, text),
                            provider_code: Some(status.as_u16().to_string()),
                        });
                    }
                }
                Err(e) if e.is_timeout() => PaymentError::Timeout {
                    provider: self.provider.clone(),
                    timeout_secs: self.timeout.as_secs(),
                },
                Err(e) => PaymentError::NetworkError {
                    message: format!("provider request failed: {}", e),
                },
            };

            if attempt < self.max_retries {
                warn!(
                    provider = %self.provider,
                    attempt = attempt + 1,
                    error = %error,
                    "provider call failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(250 << attempt)).await;
            }
            last_error = Some(error);
        }

        Err(last_error.unwrap_or(PaymentError::NetworkError {
            message: "provider request failed".to_string(),
        }))
    }
}

/// Hex-encoded HMAC-SHA256 of `payload`.
pub fn sign_hmac_sha256_hex(payload: &[u8], secret: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Checks a hex HMAC-SHA256 signature in constant time.
pub fn verify_hmac_sha256_hex(payload: &[u8], secret: &str, signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let expected = match hex::decode(signature.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
