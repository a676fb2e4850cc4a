// handler/disputes.rs
use std::sync::Arc;

use axum::{
    extract::Path,
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use uuid::Uuid;

use super::RequestMeta;
use crate::{
    dtos::escrowdtos::{ActorDto, ApiResponse, ArbitrationDto, ConfirmFeeDto, SettlementDto},
    error::HttpError,
    AppState,
};

pub fn disputes_handler() -> Router {
    Router::new()
        .route("/:dispute_id", get(get_dispute))
        .route("/:dispute_id/advice", get(get_advice))
        .route("/:dispute_id/fee", post(confirm_fee))
        .route("/:dispute_id/mediation", post(begin_mediation))
        .route("/:dispute_id/settlement", post(propose_settlement))
        .route("/:dispute_id/arbitration", post(arbitrate))
        .route("/:dispute_id/confirm", post(confirm_escalated))
}

pub async fn get_dispute(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(dispute_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let dispute = app_state
        .dispute_service
        .get(dispute_id)
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Dispute retrieved successfully", dispute)))
}

/// Advisory output is informational only; `data` is null until the
/// background request finishes.
pub async fn get_advice(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(dispute_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let advice = app_state
        .dispute_service
        .advice(dispute_id)
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Advisory suggestion", advice)))
}

pub async fn confirm_fee(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(dispute_id): Path<Uuid>,
    Json(body): Json<ConfirmFeeDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    meta.validate(&body)?;

    let dispute = app_state
        .dispute_service
        .confirm_fee(dispute_id, body.external_reference.clone(), &meta.context(&body.actor))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Dispute fee confirmed", dispute)))
}

pub async fn begin_mediation(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(dispute_id): Path<Uuid>,
    Json(body): Json<ActorDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let dispute = app_state
        .dispute_service
        .begin_mediation(dispute_id, &meta.context(&body))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Mediation started", dispute)))
}

pub async fn propose_settlement(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(dispute_id): Path<Uuid>,
    Json(body): Json<SettlementDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    meta.validate(&body)?;

    let outcome = app_state
        .dispute_service
        .propose_settlement(dispute_id, body.decision, &meta.context(&body.actor))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Settlement proposal recorded", outcome)))
}

pub async fn arbitrate(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(dispute_id): Path<Uuid>,
    Json(body): Json<ArbitrationDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    meta.validate(&body)?;

    let outcome = app_state
        .dispute_service
        .arbitrate(
            dispute_id,
            body.decision,
            body.summary.clone(),
            &meta.context(&body.actor),
        )
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Arbitration decision recorded", outcome)))
}

pub async fn confirm_escalated(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(dispute_id): Path<Uuid>,
    Json(body): Json<ActorDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let outcome = app_state
        .dispute_service
        .confirm_escalated(dispute_id, &meta.context(&body))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Escalated decision applied", outcome)))
}
