use thiserror::Error;

use crate::error::{AppError, AppErrorKind, ExternalError, InfrastructureError, ValidationError};

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Provider {provider} did not answer within {timeout_secs}s")]
    Timeout { provider: String, timeout_secs: u64 },

    #[error("Provider error: provider={provider}, message={message}")]
    ProviderError {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },

    #[error("Provider {provider} rejected the request: {message}")]
    Rejected {
        provider: String,
        message: String,
        provider_code: Option<String>,
    },

    #[error("Payment configuration error: {message}")]
    ConfigurationError { message: String },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::Timeout { .. } => true,
            PaymentError::ProviderError { retryable, .. } => *retryable,
            PaymentError::Rejected { .. } => false,
            PaymentError::ConfigurationError { .. } => false,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::NetworkError { .. }
            | PaymentError::RateLimitError { .. }
            | PaymentError::Timeout { .. } => {
                "Payment provider is temporarily unavailable".to_string()
            }
            PaymentError::ProviderError { .. } => "Payment provider returned an error".to_string(),
            PaymentError::Rejected { .. } => "Payment provider rejected the request".to_string(),
            PaymentError::ConfigurationError { .. } => {
                "Payments are not configured correctly".to_string()
            }
        }
    }
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        let kind = match &err {
            PaymentError::ValidationError { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidValue {
                    field: field.clone().unwrap_or_else(|| "payment".to_string()),
                    reason: message.clone(),
                })
            }
            PaymentError::Timeout {
                provider,
                timeout_secs,
            } => AppErrorKind::External(ExternalError::Timeout {
                service: provider.clone(),
                timeout_secs: *timeout_secs,
            }),
            PaymentError::ConfigurationError { message } => {
                AppErrorKind::Infrastructure(InfrastructureError::Configuration {
                    message: message.clone(),
                })
            }
            PaymentError::ProviderError { provider, .. } | PaymentError::Rejected { provider, .. }
                if !err.is_retryable() =>
            {
                AppErrorKind::External(ExternalError::PermanentProvider {
                    provider: provider.clone(),
                    message: err.to_string(),
                })
            }
            PaymentError::ProviderError { provider, .. } => {
                AppErrorKind::External(ExternalError::TransientProvider {
                    provider: provider.clone(),
                    message: err.to_string(),
                })
            }
            _ => AppErrorKind::External(ExternalError::TransientProvider {
                provider: "payments".to_string(),
                message: err.to_string(),
            }),
        };

        AppError::new(kind)
    }
}
