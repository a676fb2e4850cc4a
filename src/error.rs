use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::service::error::ServiceError;

/// Stable machine-readable error codes returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    StateConflict,
    InsufficientFunds,
    PaymentFailed,
    SignatureInvalid,
    DuplicateReference,
    NotFound,
    Forbidden,
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION_ERROR",
            ErrorCode::StateConflict => "STATE_CONFLICT",
            ErrorCode::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorCode::PaymentFailed => "PAYMENT_FAILED",
            ErrorCode::SignatureInvalid => "SIGNATURE_INVALID",
            ErrorCode::DuplicateReference => "DUPLICATE_REFERENCE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::Internal => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::Validation => StatusCode::BAD_REQUEST,
            ErrorCode::StateConflict | ErrorCode::DuplicateReference => StatusCode::CONFLICT,
            ErrorCode::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            ErrorCode::PaymentFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::SignatureInvalid => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub error: String,
    pub code: ErrorCode,
    pub correlation_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct HttpError {
    pub message: String,
    pub status: StatusCode,
    pub code: ErrorCode,
    pub correlation_id: Uuid,
}

impl HttpError {
    pub fn new(message: impl Into<String>, code: ErrorCode, correlation_id: Uuid) -> Self {
        HttpError {
            message: message.into(),
            status: code.status(),
            code,
            correlation_id,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        HttpError::new(message, ErrorCode::Validation, Uuid::new_v4())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        HttpError::new(message, ErrorCode::NotFound, Uuid::new_v4())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        HttpError::new(message, ErrorCode::SignatureInvalid, Uuid::new_v4())
    }

    /// Logs the real cause under the correlation id and hides it from the
    /// response.
    pub fn server_error(cause: impl fmt::Display, correlation_id: Uuid) -> Self {
        tracing::error!(correlation_id = %correlation_id, error = %cause, "Internal error");
        HttpError::new("Internal server error", ErrorCode::Internal, correlation_id)
    }

    pub fn from_service(error: ServiceError, correlation_id: Uuid) -> Self {
        if error.is_client_facing() {
            tracing::warn!(correlation_id = %correlation_id, code = error.code().as_str(), error = %error, "Request rejected");
            return HttpError::new(error.to_string(), error.code(), correlation_id);
        }

        match error {
            ServiceError::ExternalGateway(cause) => {
                tracing::error!(correlation_id = %correlation_id, error = %cause, "Payment gateway call failed");
                HttpError::new("Payment processor unavailable", ErrorCode::PaymentFailed, correlation_id)
            }
            other => HttpError::server_error(other, correlation_id),
        }
    }

    pub fn into_http_response(self) -> Response {
        let body = Json(ErrorResponse {
            status: "fail".to_string(),
            error: self.message,
            code: self.code,
            correlation_id: self.correlation_id,
        });
        (self.status, body).into_response()
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HttpError: message: {}, status: {}, code: {}",
            self.message,
            self.status,
            self.code.as_str()
        )
    }
}

impl std::error::Error for HttpError {}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        self.into_http_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::StoreError;

    #[test]
    fn codes_serialize_to_stable_strings() {
        for code in [
            ErrorCode::Validation,
            ErrorCode::StateConflict,
            ErrorCode::InsufficientFunds,
            ErrorCode::PaymentFailed,
            ErrorCode::SignatureInvalid,
            ErrorCode::DuplicateReference,
            ErrorCode::NotFound,
            ErrorCode::Forbidden,
            ErrorCode::Internal,
        ] {
            let value = serde_json::to_value(code).unwrap();
            assert_eq!(value, code.as_str());
        }
    }

    #[test]
    fn internal_errors_are_sanitized() {
        let correlation_id = Uuid::new_v4();
        let err = HttpError::from_service(
            ServiceError::Store(StoreError::Unavailable("password=hunter2".into())),
            correlation_id,
        );
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.correlation_id, correlation_id);
        assert!(!err.message.contains("hunter2"));
    }

    #[test]
    fn client_errors_keep_their_message() {
        let err = HttpError::from_service(ServiceError::conflict("milestone is not approved"), Uuid::new_v4());
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert!(err.message.contains("milestone is not approved"));
    }
}
