mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::TestApp;
use tower::ServiceExt;

#[tokio::test]
async fn health_check_works() {
    let app = TestApp::spawn();

    let response = app
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "ok");
    assert_eq!(response.body["service"], "expense-import-service");
}

#[tokio::test]
async fn readiness_check_works() {
    let app = TestApp::spawn();

    let response = app
        .send(Request::get("/ready").body(Body::empty()).unwrap())
        .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["datastore"], "ok");
    assert_eq!(response.body["cache"], "ok");
}

#[tokio::test]
async fn metrics_endpoint_returns_prometheus_format() {
    let app = TestApp::spawn();
    let csv = format!("{}Sunset Villa,2024-05-03,,,100\n", common::CSV_HEADER);
    app.preview_csv(&csv).await;

    let response = app
        .send(Request::get("/metrics").body(Body::empty()).unwrap())
        .await;

    assert_eq!(response.status, StatusCode::OK);
    let text = response.body.as_str().unwrap_or_default();
    assert!(text.contains("expense_import_stages_total"));
}

#[tokio::test]
async fn requests_without_tenant_headers_are_unauthorized() {
    let app = TestApp::spawn();

    let response = app
        .send(
            Request::get(format!("/imports/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_tenant_header_is_a_bad_request() {
    let app = TestApp::spawn();

    let response = app
        .send(
            Request::get(format!("/imports/{}", uuid::Uuid::new_v4()))
                .header("X-Org-ID", "not-a-uuid")
                .header("X-User-ID", uuid::Uuid::new_v4().to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let app = TestApp::spawn();

    let response = app
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert!(response.headers().contains_key("x-request-id"));
}
