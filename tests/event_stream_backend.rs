mod common;

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chatgate::config::BackendKind;
use serde_json::{json, Value};

use common::{assert_block_order, events_of, joined_text, wire_lines};

/// Wrap a JSON payload in a binary envelope shaped like the real upstream's.
fn frame(payload: &Value) -> Vec<u8> {
    let headers: &[u8] = b"\x0b:event-type\x07\x00\x16assistantResponseEvent";
    let mut body = payload.to_string().into_bytes();
    loop {
        let total = (12 + headers.len() + body.len() + 4) as u32;
        let prelude = [total.to_be_bytes(), (headers.len() as u32).to_be_bytes()].concat();
        if prelude.iter().any(|b| *b == b'{' || *b == b'}') {
            body.push(b' ');
            continue;
        }
        let mut out = prelude;
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(headers);
        out.extend_from_slice(&body);
        out.extend_from_slice(&[0, 0, 0, 0]);
        return out;
    }
}

/// Concatenate frames and cut them into `chunk`-sized pieces.
fn chunked_body(records: &[Value], chunk: usize) -> Body {
    let bytes: Vec<u8> = records.iter().flat_map(frame).collect();
    let pieces: Vec<Result<Bytes, Infallible>> = bytes
        .chunks(chunk)
        .map(|piece| Ok(Bytes::copy_from_slice(piece)))
        .collect();
    Body::from_stream(futures_util::stream::iter(pieces))
}

fn stream_response(records: &[Value], chunk: usize) -> Response {
    let mut response = Response::new(chunked_body(records, chunk));
    response.headers_mut().insert(
        "content-type",
        "application/vnd.amazon.eventstream".parse().expect("header"),
    );
    response
}

async fn event_stream_state(app: Router) -> Arc<chatgate::state::AppState> {
    let addr = common::spawn_upstream(app).await;
    let backend = common::backend(
        "kiro",
        BackendKind::EventStream,
        format!("http://{addr}"),
        &["claude-sonnet-4"],
    );
    common::build_state(common::config(vec![backend]))
}

#[tokio::test]
async fn test_split_frames_are_reassembled_and_duplicates_dropped() {
    let records = vec![
        json!({"content": "Hel"}),
        json!({"content": "lo"}),
        json!({"content": "lo"}),
        json!({"content": " there"}),
        json!({"followupPrompt": {"content": "ask more"}}),
        json!({"contextUsagePercentage": 1.5}),
    ];
    let app = Router::new().route(
        "/generateAssistantResponse",
        post(move || {
            let records = records.clone();
            async move { stream_response(&records, 7) }
        }),
    );
    let state = event_stream_state(app).await;

    let response = common::post_chat(
        &state,
        &json!({"model": "claude-sonnet-4", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let lines = wire_lines(response).await;
    assert_block_order(&lines);
    assert_eq!(joined_text(&lines), "Hello there");

    let delta = events_of(&lines, "message_delta")[0];
    assert_eq!(delta["stop_reason"], "end_turn");
    assert_eq!(delta["usage"]["input_tokens"], 3000);
    assert!(delta["usage"]["output_tokens"].as_u64().unwrap_or(0) > 0);
}

#[tokio::test]
async fn test_long_tool_name_is_restored_and_arguments_joined() {
    let long_name = format!("mcp__workspace_filesystem__{}", "read_text_file_".repeat(4));
    assert!(long_name.len() > 64);
    let seen_name: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let seen = Arc::clone(&seen_name);
    let app = Router::new().route(
        "/generateAssistantResponse",
        post(move |Json(payload): Json<Value>| {
            let seen = Arc::clone(&seen);
            async move {
                let short = payload["conversationState"]["currentMessage"]["userInputMessage"]
                    ["userInputMessageContext"]["tools"][0]["toolSpecification"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                *seen.lock().expect("lock") = Some(short.clone());
                let records = vec![
                    json!({"content": "Reading the file."}),
                    json!({"name": short, "toolUseId": "tooluse_1", "input": "{\"pa"}),
                    json!({"name": short, "toolUseId": "tooluse_1", "input": "th\": \"/tmp/a.txt\"}"}),
                    json!({"name": short, "toolUseId": "tooluse_1", "stop": true}),
                ];
                stream_response(&records, 5)
            }
        }),
    );
    let state = event_stream_state(app).await;

    let response = common::post_chat(
        &state,
        &json!({
            "model": "claude-sonnet-4",
            "messages": [{"role": "user", "content": "show /tmp/a.txt"}],
            "tools": [{"name": long_name, "description": "", "input_schema": {"type": "object"}}]
        }),
    )
    .await;
    let lines = wire_lines(response).await;
    assert_block_order(&lines);

    let short = seen_name.lock().expect("lock").clone().unwrap_or_default();
    assert!(short.len() <= 64, "upstream saw {short}");
    assert_ne!(short, long_name);

    let tool_block = events_of(&lines, "content_block_start")
        .into_iter()
        .find(|payload| payload["content_block"]["type"] == "tool_use")
        .expect("tool block");
    assert_eq!(tool_block["content_block"]["name"], long_name.as_str());
    assert_eq!(tool_block["content_block"]["id"], "tooluse_1");

    let arguments: String = events_of(&lines, "content_block_delta")
        .into_iter()
        .filter(|payload| payload["delta"]["type"] == "input_json_delta")
        .filter_map(|payload| payload["delta"]["partial_json"].as_str())
        .collect();
    let arguments: Value = serde_json::from_str(&arguments).expect("arguments are JSON");
    assert_eq!(arguments, json!({"path": "/tmp/a.txt"}));
    assert_eq!(events_of(&lines, "message_delta")[0]["stop_reason"], "tool_use");
}

#[tokio::test]
async fn test_expired_token_is_refreshed_once() {
    let refresh_hits = Arc::new(AtomicUsize::new(0));
    let upstream_hits = Arc::new(AtomicUsize::new(0));

    let refresh_counter = Arc::clone(&refresh_hits);
    let upstream_counter = Arc::clone(&upstream_hits);
    let app = Router::new()
        .route(
            "/refresh",
            post(move |Json(body): Json<Value>| {
                let refresh_counter = Arc::clone(&refresh_counter);
                async move {
                    refresh_counter.fetch_add(1, Ordering::Relaxed);
                    assert_eq!(body["refreshToken"], "refresh-1");
                    Json(json!({"accessToken": "token-2"}))
                }
            }),
        )
        .route(
            "/generateAssistantResponse",
            post(move |headers: HeaderMap| {
                let upstream_counter = Arc::clone(&upstream_counter);
                async move {
                    upstream_counter.fetch_add(1, Ordering::Relaxed);
                    let authorized = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        == Some("Bearer token-2");
                    if authorized {
                        stream_response(&[json!({"content": "fresh"})], 64)
                    } else {
                        (
                            StatusCode::UNAUTHORIZED,
                            Json(json!({"message": "The bearer token included in the request is invalid"})),
                        )
                            .into_response()
                    }
                }
            }),
        );
    let addr = common::spawn_upstream(app).await;
    let mut backend = common::backend(
        "kiro",
        BackendKind::EventStream,
        format!("http://{addr}"),
        &["claude-sonnet-4"],
    );
    backend.refresh_url = Some(format!("http://{addr}/refresh"));
    let state = common::build_state(common::config(vec![backend]));

    let response = common::post_chat(
        &state,
        &json!({"model": "claude-sonnet-4", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let lines = wire_lines(response).await;
    assert_block_order(&lines);
    assert_eq!(joined_text(&lines), "fresh");
    assert_eq!(refresh_hits.load(Ordering::Relaxed), 1);
    assert_eq!(upstream_hits.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_non_streaming_request_collects_message() {
    let app = Router::new().route(
        "/generateAssistantResponse",
        post(|| async {
            stream_response(
                &[
                    json!({"reasoningText": {"text": "thinking..."}}),
                    json!({"content": "Answer"}),
                    json!({"usage": {"inputTokens": 11, "outputTokens": 2}}),
                ],
                3,
            )
        }),
    );
    let state = event_stream_state(app).await;

    let response = common::post_chat(
        &state,
        &json!({
            "model": "claude-sonnet-4",
            "stream": false,
            "messages": [{"role": "user", "content": "hi"}]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&common::body_bytes(response).await).expect("json");
    assert_eq!(body["content"][0], json!({"type": "thinking", "thinking": "thinking..."}));
    assert_eq!(body["content"][1], json!({"type": "text", "text": "Answer"}));
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"], json!({"input_tokens": 11, "output_tokens": 2}));
}
