// handler/audit.rs
use std::sync::Arc;

use axum::{
    extract::Query,
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Extension, Json, Router,
};

use super::RequestMeta;
use crate::{
    dtos::escrowdtos::{ApiResponse, AuditQueryDto},
    error::HttpError,
    AppState,
};

pub fn audit_handler() -> Router {
    Router::new().route("/", get(query_audit))
}

pub async fn query_audit(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<AuditQueryDto>,
) -> Result<impl IntoResponse, HttpError> {
    let meta = RequestMeta::from_headers(&headers);
    meta.validate(&params)?;

    let entries = app_state
        .audit_service
        .query(params.into())
        .await
        .map_err(|e| meta.fail(e))?;

    Ok(Json(ApiResponse::success("Audit entries retrieved", entries)))
}
