use axum::http::StatusCode;
use sqlx::types::BigDecimal;
use thiserror::Error;

use crate::{
    db::store::{constraints, StoreError},
    error::{ErrorCode, HttpError},
    service::payment_provider::GatewayError,
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state transition: {0}")]
    StateConflict(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Insufficient escrow funds: required {required}, available {available}")]
    InsufficientFunds { required: BigDecimal, available: BigDecimal },

    #[error("Duplicate external reference: {0}")]
    DuplicateReference(String),

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("Payment gateway error: {0}")]
    ExternalGateway(#[from] GatewayError),

    #[error("Webhook signature verification failed")]
    SignatureVerification,

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{actor} is not allowed to {action}")]
    Forbidden { actor: String, action: &'static str },

    #[error("Storage error: {0}")]
    Store(StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ServiceError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ServiceError::StateConflict(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::Validation(_) => ErrorCode::Validation,
            ServiceError::StateConflict(_) | ServiceError::ConcurrentModification(_) => ErrorCode::StateConflict,
            ServiceError::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
            ServiceError::DuplicateReference(_) => ErrorCode::DuplicateReference,
            ServiceError::PaymentFailed(_) | ServiceError::ExternalGateway(_) => ErrorCode::PaymentFailed,
            ServiceError::SignatureVerification => ErrorCode::SignatureInvalid,
            ServiceError::NotFound { .. } => ErrorCode::NotFound,
            ServiceError::Forbidden { .. } => ErrorCode::Forbidden,
            ServiceError::Store(_) | ServiceError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code().status()
    }

    /// Errors whose message may be shown to the caller as-is.
    pub fn is_client_facing(&self) -> bool {
        !matches!(
            self,
            ServiceError::Store(_) | ServiceError::Internal(_) | ServiceError::ExternalGateway(_)
        )
    }
}

impl From<StoreError> for ServiceError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { entity, id } => ServiceError::NotFound { entity, id },
            StoreError::VersionConflict { entity, id } => {
                ServiceError::ConcurrentModification(format!("{} {}", entity, id))
            }
            StoreError::UniqueViolation(constraint) => match constraint.as_str() {
                constraints::TRANSACTION_REFERENCE => {
                    ServiceError::DuplicateReference("external reference is already recorded".to_string())
                }
                // a concurrent call with the same operation id won the race
                constraints::TRANSACTION_OPERATION => {
                    ServiceError::ConcurrentModification("operation id already applied".to_string())
                }
                constraints::OPEN_DISPUTE => {
                    ServiceError::conflict("milestone already has an open dispute")
                }
                other => ServiceError::conflict(format!("unique constraint {} violated", other)),
            },
            other => ServiceError::Store(other),
        }
    }
}

impl From<ServiceError> for HttpError {
    fn from(error: ServiceError) -> Self {
        HttpError::from_service(error, uuid::Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_conflicts_map_to_taxonomy() {
        let err: ServiceError = StoreError::VersionConflict {
            entity: "project",
            id: "p1".into(),
        }
        .into();
        assert!(matches!(err, ServiceError::ConcurrentModification(_)));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err: ServiceError =
            StoreError::UniqueViolation(constraints::TRANSACTION_REFERENCE.to_string()).into();
        assert_eq!(err.code(), ErrorCode::DuplicateReference);

        let err: ServiceError = StoreError::Unavailable("down".into()).into();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(!err.is_client_facing());
    }

    #[test]
    fn status_codes() {
        assert_eq!(ServiceError::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ServiceError::conflict("x").status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ServiceError::InsufficientFunds {
                required: BigDecimal::from(5),
                available: BigDecimal::from(1)
            }
            .status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(ServiceError::SignatureVerification.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ServiceError::not_found("dispute", "d").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ServiceError::Forbidden { actor: "user:x".into(), action: "approve" }.status_code(),
            StatusCode::FORBIDDEN
        );
    }
}
