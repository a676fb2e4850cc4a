// handler/webhook.rs
use std::sync::Arc;

use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Extension, Json, Router,
};

use super::{RequestMeta, SIGNATURE_HEADER};
use crate::{
    error::HttpError,
    models::webhookmodel::{RejectReason, WebhookOutcome},
    AppState,
};

pub fn webhook_handler() -> Router {
    Router::new().route("/payments", post(payment_webhook))
}

/// 200 tells the processor to stop redelivering, 202 means we stored the
/// event and will retry it ourselves, 401 is a forged or corrupted delivery.
pub fn outcome_status(outcome: &WebhookOutcome) -> StatusCode {
    match outcome {
        WebhookOutcome::Applied | WebhookOutcome::Duplicate => StatusCode::OK,
        WebhookOutcome::Rejected(RejectReason::UnsupportedEventType(_)) => StatusCode::OK,
        WebhookOutcome::Rejected(RejectReason::InvalidSignature) => StatusCode::UNAUTHORIZED,
        WebhookOutcome::Rejected(_) => StatusCode::ACCEPTED,
    }
}

/// Takes the raw body: the signature covers the exact bytes sent.
pub async fn payment_webhook(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let signature = headers.get(SIGNATURE_HEADER).and_then(|h| h.to_str().ok());

    let outcome = app_state
        .webhook_service
        .process(&body, signature)
        .await
        .map_err(|e| meta.fail(e))?;

    Ok((outcome_status(&outcome), Json(outcome)))
}
