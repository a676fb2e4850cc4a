pub mod audit;
pub mod disputes;
pub mod milestones;
pub mod projects;
pub mod webhook;

use axum::http::HeaderMap;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::escrowdtos::ActorDto,
    error::{ErrorCode, HttpError},
    models::actor::OperationContext,
    service::error::ServiceError,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Correlation id and idempotency key pulled from the request headers.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub correlation_id: Uuid,
    pub idempotency_key: Option<String>,
}

impl RequestMeta {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let correlation_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .unwrap_or_else(Uuid::new_v4);
        let idempotency_key = headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty() && v.len() <= 200);

        Self {
            correlation_id,
            idempotency_key,
        }
    }

    pub fn context(&self, actor: &ActorDto) -> OperationContext {
        OperationContext::with_correlation(actor.actor(), self.correlation_id)
    }

    pub fn fail(&self, error: ServiceError) -> HttpError {
        HttpError::from_service(error, self.correlation_id)
    }

    pub fn validate<T: Validate>(&self, body: &T) -> Result<(), HttpError> {
        body.validate()
            .map_err(|e| HttpError::new(e.to_string(), ErrorCode::Validation, self.correlation_id))
    }
}
