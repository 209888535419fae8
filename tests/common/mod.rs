#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use chatgate::config::{
    AppConfig, BackendConfig, BackendKind, CredentialConfig, FeaturesConfig, RetryConfig,
    ServerConfig, SessionConfig,
};
use chatgate::routing::dispatch::dispatch_request;
use chatgate::state::AppState;
use serde_json::Value;

pub async fn spawn_upstream(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("mock upstream addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

pub fn backend(name: &str, kind: BackendKind, base_url: String, models: &[&str]) -> BackendConfig {
    BackendConfig {
        name: name.to_string(),
        kind,
        base_url,
        models: models.iter().map(ToString::to_string).collect(),
        description: String::new(),
        is_default: false,
        tool_name_limit: 64,
        context_window: 200_000,
        credentials: vec![CredentialConfig {
            id: format!("{name}-primary"),
            access_token: "token-1".to_string(),
            refresh_token: Some("refresh-1".to_string()),
        }],
        refresh_url: None,
    }
}

pub fn config(backends: Vec<BackendConfig>) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            idle_timeout_secs: 5,
            connect_timeout_secs: 5,
            ..ServerConfig::default()
        },
        backends,
        retry: RetryConfig {
            max_attempts: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 5,
            max_retry_after_secs: 1,
        },
        session: SessionConfig::default(),
        features: FeaturesConfig::default(),
    }
}

pub fn build_state(config: AppConfig) -> Arc<AppState> {
    Arc::new(AppState::new(config).expect("build app state"))
}

pub async fn post_chat(state: &Arc<AppState>, body: &Value) -> Response {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("build chat request");
    dispatch_request(Arc::clone(state), Arc::from(""), request)
        .await
        .expect("dispatch is infallible")
}

pub async fn body_bytes(response: Response) -> bytes::Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body")
}

/// Decode every wire line of a streamed response.
pub async fn wire_lines(response: Response) -> Vec<(String, Value)> {
    let bytes = body_bytes(response).await;
    let text = std::str::from_utf8(&bytes).expect("utf-8 wire body");
    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (kind, payload) = chatgate::protocol::wire::decode_line(line)
                .unwrap_or_else(|| panic!("undecodable wire line: {line}"));
            (kind.to_string(), payload)
        })
        .collect()
}

/// Check the structural invariants of a successful event sequence.
///
/// One `message_start` first, blocks strictly sequential with increasing
/// indices, every delta inside its open block, `message_delta` then
/// `message_stop` last.
pub fn assert_block_order(lines: &[(String, Value)]) {
    assert!(!lines.is_empty(), "empty event sequence");
    assert_eq!(lines[0].0, "message_start", "first event: {lines:?}");
    let mut open: Option<u64> = None;
    let mut next_index = 0u64;
    let mut saw_message_delta = false;
    for (position, (kind, payload)) in lines.iter().enumerate().skip(1) {
        match kind.as_str() {
            "message_start" => panic!("second message_start at {position}"),
            "content_block_start" => {
                assert!(open.is_none(), "block opened while another is open at {position}");
                let index = payload["index"].as_u64().expect("block index");
                assert_eq!(index, next_index, "block index at {position}");
                open = Some(index);
                next_index += 1;
            }
            "content_block_delta" => {
                assert_eq!(payload["index"].as_u64(), open, "delta outside its block at {position}");
            }
            "content_block_stop" => {
                assert_eq!(payload["index"].as_u64(), open, "stop for a closed block at {position}");
                open = None;
            }
            "message_delta" => {
                assert!(open.is_none(), "message_delta with an open block");
                assert!(!saw_message_delta, "second message_delta");
                saw_message_delta = true;
            }
            "message_stop" => {
                assert!(saw_message_delta, "message_stop before message_delta");
                assert_eq!(position, lines.len() - 1, "events after message_stop");
            }
            other => panic!("unexpected event type {other} at {position}"),
        }
    }
    assert_eq!(lines.last().map(|(kind, _)| kind.as_str()), Some("message_stop"));
}

pub fn joined_text(lines: &[(String, Value)]) -> String {
    lines
        .iter()
        .filter(|(kind, payload)| kind == "content_block_delta" && payload["delta"]["type"] == "text_delta")
        .filter_map(|(_, payload)| payload["delta"]["text"].as_str())
        .collect()
}

pub fn events_of<'a>(lines: &'a [(String, Value)], kind: &str) -> Vec<&'a Value> {
    lines
        .iter()
        .filter(|(k, _)| k == kind)
        .map(|(_, payload)| payload)
        .collect()
}
