// routes.rs
use std::sync::Arc;

use axum::{routing::get, Extension, Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    handler::{
        audit::audit_handler, disputes::disputes_handler, milestones::milestones_handler,
        projects::projects_handler, webhook::webhook_handler,
    },
    AppState,
};

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Server is running"
    }))
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_route = Router::new()
        .nest("/projects", projects_handler())
        .nest("/milestones", milestones_handler())
        .nest("/disputes", disputes_handler())
        .nest("/webhooks", webhook_handler())
        .nest("/audit", audit_handler())
        .layer(TraceLayer::new_for_http())
        .layer(Extension(app_state));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_route)
}
