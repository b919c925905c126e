use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::payments::error::PaymentError;

/// Checkout channels offered to players.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    #[default]
    Qris,
    Ewallet,
    Va,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Qris => "QRIS",
            PaymentMethod::Ewallet => "EWALLET",
            PaymentMethod::Va => "VA",
        }
    }

    /// Convenience fee charged on top of the order amount (IDR).
    ///
    /// QRIS is 0.5% rounded half away from zero; e-wallets and virtual
    /// accounts are flat.
    pub fn fee_for(&self, amount: i64) -> i64 {
        match self {
            PaymentMethod::Qris => (amount * 5 + 500) / 1000,
            PaymentMethod::Ewallet => 1_500,
            PaymentMethod::Va => 1_000,
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "QRIS" => Ok(PaymentMethod::Qris),
            "EWALLET" | "E-WALLET" => Ok(PaymentMethod::Ewallet),
            "VA" | "VIRTUAL_ACCOUNT" => Ok(PaymentMethod::Va),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported payment method: {}", value),
                field: Some("method".to_string()),
            }),
        }
    }
}

/// Request sent to a provider to open a hosted checkout.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub order_id: String,
    pub amount: i64,
    pub fee: i64,
    pub currency: String,
    pub method: PaymentMethod,
    pub expires_at: DateTime<Utc>,
    pub idempotency_key: String,
}

impl SessionRequest {
    pub fn total_amount(&self) -> i64 {
        self.amount + self.fee
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSession {
    pub provider_session_id: String,
    pub payment_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub order_id: String,
    pub payment_ref: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub reason: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RefundReceipt {
    pub refund_id: String,
    #[serde(default)]
    pub status: String,
}

/// Payment result reported by a webhook.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentOutcome {
    #[serde(alias = "settlement", alias = "capture", alias = "paid")]
    Success,
    #[serde(alias = "failed", alias = "deny", alias = "cancel")]
    Failure,
    #[serde(alias = "expire")]
    Expired,
    Pending,
}

/// Signed body of `POST /webhooks/payment`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentNotification {
    pub event_id: String,
    pub order_id: String,
    pub status: PaymentOutcome,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
}

impl PaymentNotification {
    pub fn parse(payload: &[u8]) -> Result<Self, PaymentError> {
        let notification: PaymentNotification =
            serde_json::from_slice(payload).map_err(|e| PaymentError::ValidationError {
                message: format!("invalid webhook payload: {}", e),
                field: None,
            })?;

        if notification.event_id.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "eventId must not be empty".to_string(),
                field: Some("eventId".to_string()),
            });
        }
        if notification.order_id.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "orderId must not be empty".to_string(),
                field: Some("orderId".to_string()),
            });
        }

        Ok(notification)
    }
}
