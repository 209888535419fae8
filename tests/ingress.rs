mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chatgate::config::BackendKind;
use chatgate::routing::dispatch::dispatch_request;
use serde_json::{json, Value};

fn offline_state() -> Arc<chatgate::state::AppState> {
    let mut primary = common::backend(
        "codex",
        BackendKind::TypedSse,
        "http://127.0.0.1:9".to_string(),
        &["gpt-5-codex"],
    );
    primary.is_default = true;
    let secondary = common::backend(
        "kiro",
        BackendKind::EventStream,
        "http://127.0.0.1:9".to_string(),
        &["sonnet:claude-sonnet-4"],
    );
    common::build_state(common::config(vec![primary, secondary]))
}

async fn send(state: &Arc<chatgate::state::AppState>, base_path: &str, method: &str, uri: &str, body: &str) -> (StatusCode, bytes::Bytes) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body.to_string()))
        .expect("request");
    let response = dispatch_request(Arc::clone(state), Arc::from(base_path), request)
        .await
        .expect("dispatch is infallible");
    let status = response.status();
    (status, common::body_bytes(response).await)
}

#[tokio::test]
async fn test_health_lists_backends_and_models() {
    let state = offline_state();
    let (status, body) = send(&state, "", "GET", "/", "").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(body["backends"][0]["name"], "codex");
    assert_eq!(body["backends"][0]["kind"], "typed_sse");
    assert_eq!(body["backends"][1]["kind"], "event_stream");
    assert_eq!(body["backends"][0]["credentials"][0]["id"], "codex-primary");
    assert_eq!(body["known_models"], json!(["gpt-5-codex", "sonnet"]));
}

#[tokio::test]
async fn test_base_path_is_honoured() {
    let state = offline_state();
    let (status, _) = send(&state, "/gate", "GET", "/gate", "").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&state, "/gate", "GET", "/", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&state, "/gate", "GET", "/gate/v1/chat", "").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_malformed_body_is_an_invalid_request() {
    let state = offline_state();
    let (status, body) = send(&state, "", "POST", "/v1/chat", "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_empty_conversation_is_rejected_before_any_upstream_call() {
    let state = offline_state();
    let (status, body) = send(
        &state,
        "",
        "POST",
        "/v1/chat",
        &json!({"model": "gpt-5-codex", "messages": []}).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(state.sessions.len(), 0);
}

#[tokio::test]
async fn test_system_only_conversation_is_rejected() {
    let state = offline_state();
    let (status, body) = send(
        &state,
        "",
        "POST",
        "/v1/chat",
        &json!({"model": "gpt-5-codex", "messages": [{"role": "system", "content": "be terse"}]}).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(state.sessions.len(), 0);
}

#[tokio::test]
async fn test_oversized_body_is_refused() {
    let state = offline_state();
    let huge = "x".repeat(3 * 1024 * 1024);
    let (status, _) = send(&state, "", "POST", "/v1/chat", &huge).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}
