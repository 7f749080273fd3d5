//! Router tests: authentication, validation and status-code mapping.
//!
//! These drive the real router through `tower::ServiceExt::oneshot`
//! with a controller wired to a lazy Redis client; every path tested
//! here is rejected before any backend call is made.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use stevedore_core::api::{build_router, AppState};
use stevedore_core::config::Config;
use stevedore_core::controller::Controller;
use stevedore_core::db::RedisPool;
use stevedore_core::joblog::JobLogStore;
use stevedore_core::pool::WorkerPool;

const SECRET: &str = "s3cr3t";

fn test_state() -> AppState {
    let redis = RedisPool::new("redis://127.0.0.1:6399", "testing").unwrap();
    let dir = tempfile::tempdir().unwrap().into_path();
    let logs = JobLogStore::new(dir, 24).unwrap();
    let pool = Arc::new(WorkerPool::new(redis, logs.clone(), &Config::default()));

    AppState {
        controller: Arc::new(Controller::new(pool, logs)),
        secret: Arc::new(SECRET.to_string()),
    }
}

fn authed(req: axum::http::request::Builder) -> axum::http::request::Builder {
    req.header(header::AUTHORIZATION, format!("Harbor-Secret {}", SECRET))
        .header(header::CONTENT_TYPE, "application/json")
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_health_is_public() {
    let app = build_router(test_state());

    let resp = app
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");
}

#[tokio::test]
async fn test_missing_secret_is_unauthorized() {
    let app = build_router(test_state());

    let resp = app
        .oneshot(
            Request::get("/api/v1/jobs/some-id")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_wrong_secret_is_unauthorized() {
    let app = build_router(test_state());

    let resp = app
        .oneshot(
            Request::get("/api/v1/jobs/some-id")
                .header(header::AUTHORIZATION, "Harbor-Secret wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

// ============================================================================
// Launch validation
// ============================================================================

#[tokio::test]
async fn test_launch_with_empty_name_is_bad_request() {
    let app = build_router(test_state());
    let body = r#"{"name":"","metadata":{"kind":"Generic"}}"#;

    let resp = app
        .oneshot(
            authed(Request::post("/api/v1/jobs"))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_launch_unknown_job_is_bad_request() {
    let app = build_router(test_state());
    let body = r#"{"name":"no-such-job","metadata":{"kind":"Generic"}}"#;

    let resp = app
        .oneshot(
            authed(Request::post("/api/v1/jobs"))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_launch_with_bad_cron_is_bad_request() {
    let app = build_router(test_state());
    // 5-field cron expressions are rejected before dispatch.
    let body = r#"{"name":"demo","metadata":{"kind":"Periodic","cron":"* * * * *"}}"#;

    let resp = app
        .oneshot(
            authed(Request::post("/api/v1/jobs"))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_launch_with_unknown_kind_is_bad_request() {
    let app = build_router(test_state());
    let body = r#"{"name":"demo","metadata":{"kind":"Sporadic"}}"#;

    let resp = app
        .oneshot(
            authed(Request::post("/api/v1/jobs"))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_launch_with_malformed_json_is_bad_request() {
    let app = build_router(test_state());

    let resp = app
        .oneshot(
            authed(Request::post("/api/v1/jobs"))
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// ============================================================================
// Job actions
// ============================================================================

#[tokio::test]
async fn test_unknown_action_is_not_implemented() {
    let app = build_router(test_state());
    let body = r#"{"action":"pause"}"#;

    let resp = app
        .oneshot(
            authed(Request::post("/api/v1/jobs/some-id"))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
}

// ============================================================================
// Job log endpoint
// ============================================================================

#[tokio::test]
async fn test_log_with_path_traversal_id_is_bad_request() {
    let app = build_router(test_state());

    let resp = app
        .oneshot(
            authed(Request::get("/api/v1/jobs/..%2fescape/log"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_log_for_unknown_job_is_not_found() {
    let app = build_router(test_state());

    let resp = app
        .oneshot(
            authed(Request::get("/api/v1/jobs/doesnotexist/log"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
