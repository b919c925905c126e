//! Unified error handling for the top-up backend
//!
//! Component errors (ledger, payments, fulfillment, idempotency, database)
//! are converted into [`AppError`], which carries the HTTP status mapping,
//! a machine-readable [`ErrorCode`] and a user-facing message.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::database::order_repository::OrderStatus;

/// Error codes for programmatic handling by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "ORDER_NOT_FOUND")]
    OrderNotFound,
    #[serde(rename = "CONFLICT")]
    Conflict,
    #[serde(rename = "INVALID_ORDER_STATE")]
    InvalidOrderState,
    #[serde(rename = "REQUEST_IN_FLIGHT")]
    RequestInFlight,
    #[serde(rename = "SIGNATURE_INVALID")]
    SignatureInvalid,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "IDEMPOTENCY_UNAVAILABLE")]
    IdempotencyUnavailable,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 504)
    #[serde(rename = "TRANSIENT_PROVIDER_ERROR")]
    TransientProviderError,
    #[serde(rename = "PERMANENT_PROVIDER_ERROR")]
    PermanentProviderError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business rule violations on orders and requests
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Order with the given id doesn't exist
    OrderNotFound { order_id: String },
    /// Compare-and-swap lost against a concurrent writer
    Conflict {
        order_id: String,
        expected_version: i64,
        current_version: i64,
        current_status: OrderStatus,
    },
    /// Order exists but is not in a state that allows the operation
    InvalidOrderState {
        order_id: String,
        status: OrderStatus,
        expected: String,
    },
    /// Another request holding the same idempotency key is still running
    RequestInFlight { key: String },
    /// Webhook signature did not verify
    SignatureInvalid,
}

/// Infrastructure-level errors (database, idempotency store, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    /// Idempotency store unreachable; the request must not run undeduplicated
    IdempotencyStore { message: String },
    Configuration { message: String },
    Internal { message: String },
}

/// Failures reported by payment providers and game publishers
#[derive(Debug, Clone)]
pub enum ExternalError {
    TransientProvider { provider: String, message: String },
    PermanentProvider { provider: String, message: String },
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    MissingField { field: String },
    InvalidValue { field: String, reason: String },
    UnknownProduct { game_id: String, denom_code: String },
    MalformedPayload { reason: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::MissingField {
            field: field.into(),
        }))
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::MalformedPayload {
            reason: reason.into(),
        }))
    }

    pub fn order_not_found(order_id: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Domain(DomainError::OrderNotFound {
            order_id: order_id.into(),
        }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Infrastructure(InfrastructureError::Internal {
            message: message.into(),
        }))
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OrderNotFound { .. } => 404,
                DomainError::Conflict { .. } => 409,
                DomainError::InvalidOrderState { .. } => 409,
                DomainError::RequestInFlight { .. } => 409,
                DomainError::SignatureInvalid => 400,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => {
                    if *is_retryable {
                        503
                    } else {
                        500
                    }
                }
                InfrastructureError::IdempotencyStore { .. } => 503,
                InfrastructureError::Configuration { .. } => 500,
                InfrastructureError::Internal { .. } => 500,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::TransientProvider { .. } => 502,
                ExternalError::PermanentProvider { .. } => 502,
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OrderNotFound { .. } => ErrorCode::OrderNotFound,
                DomainError::Conflict { .. } => ErrorCode::Conflict,
                DomainError::InvalidOrderState { .. } => ErrorCode::InvalidOrderState,
                DomainError::RequestInFlight { .. } => ErrorCode::RequestInFlight,
                DomainError::SignatureInvalid => ErrorCode::SignatureInvalid,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::IdempotencyStore { .. } => ErrorCode::IdempotencyUnavailable,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
                InfrastructureError::Internal { .. } => ErrorCode::InternalError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::TransientProvider { .. } => ErrorCode::TransientProviderError,
                ExternalError::PermanentProvider { .. } => ErrorCode::PermanentProviderError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OrderNotFound { order_id } => {
                    format!("Order '{}' not found", order_id)
                }
                DomainError::Conflict { order_id, .. } => {
                    format!("Order '{}' was modified concurrently. Please retry", order_id)
                }
                DomainError::InvalidOrderState {
                    order_id,
                    status,
                    expected,
                } => format!(
                    "Order '{}' is {} but must be {} for this operation",
                    order_id, status, expected
                ),
                DomainError::RequestInFlight { .. } => {
                    "An identical request is still being processed. Please retry shortly"
                        .to_string()
                }
                DomainError::SignatureInvalid => "Invalid webhook signature".to_string(),
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::TransientProvider { provider, .. } => format!(
                    "Payment provider ({}) is temporarily unavailable. Please try again",
                    provider
                ),
                ExternalError::PermanentProvider { .. } => {
                    "Payment provider rejected the request. Please contact support".to_string()
                }
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds. Please try again",
                    service, timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidValue { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::UnknownProduct {
                    game_id,
                    denom_code,
                } => format!(
                    "Denomination '{}' is not available for game '{}'",
                    denom_code, game_id
                ),
                ValidationError::MalformedPayload { reason } => {
                    format!("Malformed request body: {}", reason)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(err) => matches!(
                err,
                DomainError::Conflict { .. } | DomainError::RequestInFlight { .. }
            ),
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::IdempotencyStore { .. } => true,
                InfrastructureError::Configuration { .. } => false,
                InfrastructureError::Internal { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::TransientProvider { .. } => true,
                ExternalError::PermanentProvider { .. } => false,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
