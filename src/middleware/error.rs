//! Error response formatting
//!
//! Every failed request renders the same JSON envelope with a
//! machine-readable code, a user-facing message and a retry hint.

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{AppError, AppErrorKind, DomainError, ErrorCode, ValidationError};
use crate::middleware::logging::REQUEST_ID_HEADER;

/// Standardized error response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub error: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Request ID for debugging and support
    pub request_id: Option<String>,

    /// RFC 3339 timestamp of the error
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Whether the client should retry the request
    pub retryable: bool,
}

impl ErrorResponse {
    pub fn from_app_error(error: &AppError) -> Self {
        Self {
            error: error.error_code(),
            message: error.user_message(),
            request_id: error.request_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            details: details_for(error),
            retryable: error.is_retryable(),
        }
    }

    pub fn internal_error(request_id: Option<String>) -> Self {
        Self {
            error: ErrorCode::InternalError,
            message: "An internal server error occurred. Please try again later.".to_string(),
            request_id,
            timestamp: Utc::now().to_rfc3339(),
            details: None,
            retryable: false,
        }
    }
}

fn details_for(error: &AppError) -> Option<serde_json::Value> {
    match &error.kind {
        AppErrorKind::Domain(DomainError::Conflict {
            current_status,
            current_version,
            ..
        }) => Some(json!({
            "currentStatus": current_status,
            "currentVersion": current_version,
        })),
        AppErrorKind::Domain(DomainError::InvalidOrderState { status, .. }) => {
            Some(json!({ "status": status }))
        }
        AppErrorKind::Validation(ValidationError::MissingField { field })
        | AppErrorKind::Validation(ValidationError::InvalidValue { field, .. }) => {
            Some(json!({ "field": field }))
        }
        _ => error.context.as_ref().map(|c| json!({ "context": c })),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status_code =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status_code.is_server_error() {
            tracing::error!(
                error = ?self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Server error occurred"
            );
        } else {
            tracing::warn!(
                error = ?self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Client error occurred"
            );
        }

        let error_response = ErrorResponse::from_app_error(&self);
        (status_code, Json(error_response)).into_response()
    }
}

pub fn get_request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::order_repository::OrderStatus;
    use crate::error::InfrastructureError;

    #[test]
    fn test_error_response_from_app_error() {
        let app_error = AppError::order_not_found("ord_123").with_request_id("req_123");

        let error_response = ErrorResponse::from_app_error(&app_error);

        assert_eq!(error_response.error, ErrorCode::OrderNotFound);
        assert_eq!(error_response.request_id, Some("req_123".to_string()));
        assert!(error_response.message.contains("ord_123"));
        assert!(!error_response.retryable);
    }

    #[test]
    fn test_conflict_carries_current_state() {
        let app_error = AppError::new(AppErrorKind::Domain(DomainError::Conflict {
            order_id: "ord_1".to_string(),
            expected_version: 1,
            current_version: 3,
            current_status: OrderStatus::Paid,
        }));

        let body = serde_json::to_value(ErrorResponse::from_app_error(&app_error)).unwrap();
        assert_eq!(body["error"], "CONFLICT");
        assert_eq!(body["retryable"], true);
        assert_eq!(body["details"]["currentStatus"], "PAID");
        assert_eq!(body["details"]["currentVersion"], 3);
    }

    #[test]
    fn test_app_error_into_response() {
        let response = AppError::missing_field("gameId").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::IdempotencyStore {
                message: "down".to_string(),
            },
        ))
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_envelope_omits_empty_details() {
        let body = serde_json::to_value(ErrorResponse::internal_error(None)).unwrap();
        assert!(body.get("details").is_none());
        assert_eq!(body["error"], "INTERNAL_ERROR");
        assert_eq!(body["retryable"], false);
    }
}
