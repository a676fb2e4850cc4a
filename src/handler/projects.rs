// handler/projects.rs
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
    dtos::escrowdtos::{ActorDto, ApiResponse, CancelProjectDto, CreateProjectDto, InviteFreelancerDto, RefundDto},
    error::{ErrorCode, HttpError},
    service::escrow_service::RefundRequest,
    AppState,
};

pub fn projects_handler() -> Router {
    Router::new()
        .route("/", post(create_project))
        .route("/:project_id", get(get_project))
        .route("/:project_id/invite", post(invite_freelancer))
        .route("/:project_id/accept", post(accept_project))
        .route("/:project_id/deposit", post(initiate_deposit))
        .route("/:project_id/refund", post(refund_escrow))
        .route("/:project_id/cancel", post(cancel_project))
        .route("/:project_id/on-hold", post(set_on_hold))
        .route("/:project_id/resume", post(resume_project))
}

pub async fn create_project(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateProjectDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    body.validate_all()
        .map_err(|e| HttpError::new(e.to_string(), ErrorCode::Validation, meta.correlation_id))?;

    let ctx = meta.context(&body.actor);
    let view = app_state
        .project_service
        .create(body.into_new_project(), &ctx)
        .await
        .map_err(|e| meta.fail(e))?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success("Project created successfully", view)),
    ))
}

pub async fn get_project(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let view = app_state
        .project_service
        .view(project_id)
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Project retrieved successfully", view)))
}

pub async fn invite_freelancer(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
    Json(body): Json<InviteFreelancerDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let project = app_state
        .project_service
        .invite_freelancer(project_id, body.freelancer_id, &meta.context(&body.actor))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Freelancer invited", project)))
}

pub async fn accept_project(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
    Json(body): Json<ActorDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let project = app_state
        .project_service
        .accept(project_id, &meta.context(&body))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Project accepted, awaiting deposit", project)))
}

pub async fn initiate_deposit(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
    Json(body): Json<ActorDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let receipt = app_state
        .escrow_service
        .initiate_deposit(project_id, meta.idempotency_key.clone(), &meta.context(&body))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success("Deposit initiated", receipt)),
    ))
}

pub async fn refund_escrow(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
    Json(body): Json<RefundDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    meta.validate(&body)?;

    let request = RefundRequest {
        project_id,
        milestone_id: body.milestone_id,
        amount: body.amount.clone(),
        reason: body.reason.clone(),
        operation_id: meta.idempotency_key.clone(),
    };
    let receipt = app_state
        .escrow_service
        .refund(request, &meta.context(&body.actor))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Refund recorded", receipt)))
}

pub async fn cancel_project(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
    Json(body): Json<CancelProjectDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    meta.validate(&body)?;

    let outcome = app_state
        .project_service
        .cancel(
            project_id,
            body.reason.clone(),
            meta.idempotency_key.clone(),
            &meta.context(&body.actor),
        )
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Project cancelled", outcome)))
}

pub async fn set_on_hold(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
    Json(body): Json<ActorDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let project = app_state
        .project_service
        .set_on_hold(project_id, &meta.context(&body))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Project put on hold", project)))
}

pub async fn resume_project(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
    Json(body): Json<ActorDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    let project = app_state
        .project_service
        .resume(project_id, &meta.context(&body))
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Project resumed", project)))
}
