mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use common::*;
use escrowline::{config::Config, routes::create_router, service::webhook_service::sign_payload};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

fn app(h: &Harness) -> Router {
    create_router(h.state.clone())
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn health_check_responds() {
    let h = Harness::new();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

    let (status, body) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn creating_a_project_returns_201_with_its_milestones() {
    let h = Harness::new();
    let payload = json!({
        "actor_id": h.client,
        "freelancer_id": h.freelancer,
        "title": "Mobile app",
        "currency": "usd",
        "total_budget": "1000.00",
        "sequential": true,
        "milestones": [
            { "title": "Design", "amount": "400.00" },
            { "title": "Build", "amount": "600.00", "deadline": "2030-01-31" }
        ]
    });

    let (status, body) = send(app(&h), post_json("/api/projects", &payload)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["project"]["status"], "pending_acceptance");
    assert_eq!(body["data"]["project"]["currency"], "USD");
    assert_eq!(body["data"]["milestones"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn milestone_sum_mismatch_is_a_validation_error() {
    let h = Harness::new();
    let payload = json!({
        "actor_id": h.client,
        "title": "Mobile app",
        "currency": "USD",
        "total_budget": "1000.00",
        "milestones": [{ "title": "Everything", "amount": "900.00" }]
    });
    let correlation_id = Uuid::new_v4();
    let mut request = post_json("/api/projects", &payload);
    request
        .headers_mut()
        .insert("x-request-id", correlation_id.to_string().parse().unwrap());

    let (status, body) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "fail");
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert_eq!(body["correlation_id"], correlation_id.to_string());
}

#[tokio::test]
async fn unknown_project_is_404() {
    let h = Harness::new();
    let request = Request::builder()
        .uri(format!("/api/projects/{}", Uuid::new_v4()))
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn releasing_before_approval_is_a_conflict() {
    let h = Harness::new();
    let view = h.funded_project(&["500.00"], false).await;
    let m1 = view.milestones[0].id;
    h.submit(m1).await;

    let uri = format!("/api/milestones/{}/release", m1);
    let (status, body) = send(app(&h), post_json(&uri, &json!({ "actor_id": h.client }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "STATE_CONFLICT");
}

#[tokio::test]
async fn webhook_with_a_bad_signature_is_401() {
    let h = Harness::new();
    let raw = serde_json::to_vec(&json!({ "id": "evt_1", "type": "deposit.succeeded" })).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/api/webhooks/payments")
        .header("x-signature", "deadbeef")
        .body(Body::from(raw))
        .unwrap();

    let (status, body) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["outcome"], "rejected");
    assert_eq!(body["reason"], "invalid_signature");
}

#[tokio::test]
async fn signed_deposit_webhook_funds_the_project() {
    let h = Harness::new();
    let view = h.accepted_project(&["250.00"], false).await;
    let raw = serde_json::to_vec(&deposit_event("evt_http", view.project.id, "ch_http", 25_000)).unwrap();
    let signature = sign_payload(&raw, SECRET).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/api/webhooks/payments")
        .header("x-signature", signature)
        .body(Body::from(raw))
        .unwrap();

    let (status, body) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "applied");

    let request = Request::builder()
        .uri(format!("/api/projects/{}", view.project.id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["project"]["status"], "active");
}

#[tokio::test]
async fn audit_query_filters_by_entity() {
    let h = Harness::new();
    let view = h.funded_project(&["250.00"], false).await;
    let uri = format!(
        "/api/audit?entity_type=project&entity_id={}&limit=10",
        view.project.id
    );
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();

    let (status, body) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["data"].as_array().unwrap();
    assert!(!entries.is_empty());
    assert!(entries
        .iter()
        .all(|e| e["entity_id"] == view.project.id.to_string()));
}

#[tokio::test]
async fn partial_release_of_an_approved_milestone_is_400() {
    let mut config = Config::for_memory(SECRET);
    config.auto_release_on_approval = false;
    let h = Harness::with_config(config);
    let view = h.funded_project(&["500.00"], false).await;
    let m1 = view.milestones[0].id;
    h.submit(m1).await;
    h.state
        .milestone_service
        .approve(m1, &h.client_ctx())
        .await
        .unwrap();

    let uri = format!("/api/milestones/{}/release", m1);
    let payload = json!({ "actor_id": h.client, "amount": "200.00" });
    let (status, body) = send(app(&h), post_json(&uri, &payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}
