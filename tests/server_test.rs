//! HTTP entry point tests, driven through the router without a socket

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use learntrack::config::{DbConfig, ExecutionContext, TrackingSettings};
use learntrack::server::{router, ServerState};
use learntrack::store::{DefaultConnector, SqliteStore};
use learntrack::tracker::Tracker;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;

fn state(dir: &Path) -> ServerState {
    let tracking = TrackingSettings {
        log_dir: Some(dir.join("logs")),
        context: ExecutionContext::Local,
        quit_delay_secs: -1,
        ..Default::default()
    };
    let db = DbConfig {
        url: Some(format!("sqlite://{}", dir.join("events.db").display())),
        base: Some("course".to_string()),
        ..Default::default()
    };
    let tracker = Tracker::new(tracking, "events", db, Arc::new(DefaultConnector::new()));

    ServerState { tracker }
}

async fn call(state: &ServerState, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, value)
}

#[tokio::test]
async fn test_status() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());

    let (status, body) = call(&state, Method::GET, "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_sessions"], 0);
}

#[tokio::test]
async fn test_session_lifecycle_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());

    let (status, start) = call(&state, Method::POST, "/api/sessions", Some(json!({
        "app": "a02_regression",
        "query": {"user": "Sam", "iemail": "sam@example.org"}
    }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(start["tracking"], true);
    let id = start["session_id"].as_str().unwrap().to_string();

    let (status, body) = call(&state, Method::POST, &format!("/api/sessions/{}/inputs", id), Some(json!({
        "name": "slope", "value": 0.5, "type": "numeric", "binding": "shiny.numberInput"
    }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["recorded"], true);

    let (status, body) = call(&state, Method::POST, &format!("/api/sessions/{}/submit", id), Some(json!({
        "answer": {"slope": 0.5},
        "solution": {"slope": 0.4}
    }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["correct"], false);
    assert_eq!(body["notice"]["level"], "error");

    let (status, body) = call(&state, Method::POST, &format!("/api/sessions/{}/quit", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["shutdown_scheduled"], false);
    assert_eq!(state.tracker.active_sessions().await, 0);

    let store = SqliteStore::open(&dir.path().join("events.db"), "course").await.unwrap();
    let events = store.documents("events").await.unwrap();
    let result = events.iter().find(|e| e["event"] == "result").unwrap();
    assert_eq!(result["correct"], "FALSE");
    assert!(events.iter().any(|e| e["event"] == "quit"));
    assert!(events.iter().all(|e| e["email"] == "sam@example.org"));
}

#[tokio::test]
async fn test_unknown_session() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());

    let (status, _) = call(&state, Method::POST, "/api/sessions/nope/inputs", Some(json!({
        "name": "x", "value": 1
    }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&state, Method::DELETE, "/api/sessions/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_quit_for_unknown_session_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());

    let (status, body) = call(&state, Method::POST, "/api/sessions/nope/quit?delay=0", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("unknown session"));

    tokio::task::yield_now().await;
    assert!(!*state.tracker.shutdown_signal().borrow());
}

#[tokio::test]
async fn test_reserved_input_names_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());

    let (_, start) = call(&state, Method::POST, "/api/sessions", Some(json!({
        "app": "app", "query": {"user": "u"}
    }))).await;
    let id = start["session_id"].as_str().unwrap();

    for name in [learntrack::normalize::RESULT_LABEL, learntrack::normalize::QUIT_LABEL] {
        let (status, body) = call(&state, Method::POST, &format!("/api/sessions/{}/inputs", id), Some(json!({
            "name": name, "value": "{\"correct\":true}"
        }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("reserved"));
    }

    // The session is still open and nothing was graded
    assert!(state.tracker.is_active(id).await);
}

#[tokio::test]
async fn test_empty_solution_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());

    let (_, start) = call(&state, Method::POST, "/api/sessions", Some(json!({
        "app": "app", "query": {"user": "u"}
    }))).await;
    let id = start["session_id"].as_str().unwrap();

    let (status, body) = call(&state, Method::POST, &format!("/api/sessions/{}/submit", id), Some(json!({
        "answer": {}, "solution": {}
    }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("solution"));
}

#[tokio::test]
async fn test_untracked_session_reports_notice() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());

    let (status, start) = call(&state, Method::POST, "/api/sessions", Some(json!({"app": "app"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(start["tracking"], false);
    assert_eq!(start["notice"]["level"], "warning");

    let id = start["session_id"].as_str().unwrap();
    let (status, body) = call(&state, Method::DELETE, &format!("/api/sessions/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    // Nothing buffered, nothing transferred
    assert_eq!(body["transferred"], false);
}
