// handler/milestones.rs
use std::sync::Arc;

use axum::{
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use uuid::Uuid;

use super::RequestMeta;
use crate::{
    dtos::escrowdtos::{ActorDto, ApiResponse, RaiseDisputeDto, ReleaseDto, RevisionDto},
    error::HttpError,
    service::escrow_service::ReleaseRequest,
    AppState,
};

pub fn milestones_handler() -> Router {
    Router::new()
        .route("/:milestone_id", get(get_milestone))
        .route("/:milestone_id/start", post(start_milestone))
        .route("/:milestone_id/submit", post(submit_milestone))
        .route("/:milestone_id/approve", post(approve_milestone))
        .route("/:milestone_id/revision", post(request_revision))
        .route("/:milestone_id/resubmit", post(resubmit_milestone))
        .route("/:milestone_id/release", post(release_milestone))
        .route("/:milestone_id/disputes", post(raise_dispute))
}

pub async fn get_milestone(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(milestone_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let milestone = app_state
        .milestone_service
        .get(milestone_id)
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Milestone retrieved successfully", milestone)))
}

pub async fn start_milestone(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(milestone_id): Path<Uuid>,
    Json(body): Json<ActorDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let milestone = app_state
        .milestone_service
        .start(milestone_id, &meta.context(&body))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Milestone started", milestone)))
}

pub async fn submit_milestone(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(milestone_id): Path<Uuid>,
    Json(body): Json<ActorDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let milestone = app_state
        .milestone_service
        .submit(milestone_id, &meta.context(&body))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Milestone submitted for review", milestone)))
}

pub async fn approve_milestone(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(milestone_id): Path<Uuid>,
    Json(body): Json<ActorDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let outcome = app_state
        .milestone_service
        .approve(milestone_id, &meta.context(&body))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Milestone approved", outcome)))
}

pub async fn request_revision(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(milestone_id): Path<Uuid>,
    Json(body): Json<RevisionDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    meta.validate(&body)?;

    let outcome = app_state
        .milestone_service
        .request_revision(milestone_id, body.note.clone(), &meta.context(&body.actor))
        .await
        .map_err(|e| meta.fail(e))?;

    let message = if outcome.dispute.is_some() {
        "Revision limit reached, dispute opened"
    } else {
        "Revision requested"
    };
    Ok(Json(ApiResponse::success(message, outcome)))
}

pub async fn resubmit_milestone(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(milestone_id): Path<Uuid>,
    Json(body): Json<ActorDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let milestone = app_state
        .milestone_service
        .resubmit(milestone_id, &meta.context(&body))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Milestone back in progress", milestone)))
}

pub async fn release_milestone(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(milestone_id): Path<Uuid>,
    Json(body): Json<ReleaseDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    meta.validate(&body)?;

    let amount = match body.amount.clone() {
        Some(amount) => amount,
        None => {
            app_state
                .milestone_service
                .get(milestone_id)
                .await
                .map_err(|e| meta.fail(e))?
                .amount
        }
    };
    let request = ReleaseRequest {
        milestone_id,
        amount,
        operation_id: meta.idempotency_key.clone(),
    };
    let receipt = app_state
        .escrow_service
        .release(request, &meta.context(&body.actor))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Funds released", receipt)))
}

pub async fn raise_dispute(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(milestone_id): Path<Uuid>,
    Json(body): Json<RaiseDisputeDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    meta.validate(&body)?;

    let dispute = app_state
        .dispute_service
        .raise(milestone_id, body.reason.clone(), &meta.context(&body.actor))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success("Dispute raised", dispute)),
    ))
}
