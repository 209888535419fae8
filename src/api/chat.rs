use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use futures_util::StreamExt;

use crate::error::GatewayError;
use crate::executor::GatewayStream;
use crate::observability::log_request_complete;
use crate::protocol::canonical::{CanonicalEvent, MessageAccumulator, Usage};
use crate::protocol::request::UnifiedRequest;
use crate::protocol::wire::{encode_error, encode_event};
use crate::state::AppState;

const ANONYMOUS_USER: &str = "anonymous";

/// `POST {base_path}/v1/chat`.
pub async fn handler(state: Arc<AppState>, body: Bytes) -> Response {
    match run(&state, &body).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "chat request failed before streaming");
            err.into_response()
        }
    }
}

async fn run(state: &AppState, body: &[u8]) -> Result<Response, GatewayError> {
    let mut request: UnifiedRequest = serde_json::from_slice(body)
        .map_err(|err| GatewayError::InvalidRequest(format!("invalid request body: {err}")))?;
    request.validate()?;
    request.normalize(state.config.features.merge_adjacent_messages);

    let request_id = state.next_request_id();
    let client_model = request.model.clone();
    let (backend, target) = state.route(&client_model)?;
    request.model = target.actual_model.to_string();

    let user = request.user.as_deref().unwrap_or(ANONYMOUS_USER);
    let session_id = state.sessions.get(&request.model, user);
    tracing::info!(
        request_id = %request_id,
        model = %client_model,
        backend = %backend.config.name,
        stream = request.stream,
        "chat request"
    );

    let started = Instant::now();
    let events = backend.executor.execute(&request, &session_id).await?;
    if request.stream {
        Ok(stream_response(events, client_model, started))
    } else {
        collect_response(events, &client_model, started).await
    }
}

struct WireState {
    events: GatewayStream,
    model: String,
    started: Instant,
    usage: Usage,
    done: bool,
}

fn stream_response(events: GatewayStream, model: String, started: Instant) -> Response {
    let state = WireState {
        events,
        model,
        started,
        usage: Usage::default(),
        done: false,
    };
    let lines = futures_util::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        let line = match st.events.next().await {
            Some(Ok(event)) => {
                if let CanonicalEvent::MessageDelta { usage, .. } = &event {
                    st.usage = *usage;
                }
                if event.is_terminal() {
                    st.done = true;
                    log_request_complete(&st.model, &st.usage, st.started);
                }
                encode_event(&event)
            }
            Some(Err(err)) => {
                tracing::warn!(model = %st.model, error = %err, "stream failed after partial output");
                st.done = true;
                encode_error(&err)
            }
            None => return None,
        };
        Some((Ok::<Bytes, Infallible>(Bytes::from(line)), st))
    });

    let mut response = Response::new(Body::from_stream(lines));
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    response
}

async fn collect_response(
    mut events: GatewayStream,
    model: &str,
    started: Instant,
) -> Result<Response, GatewayError> {
    let mut accumulator = MessageAccumulator::new();
    while let Some(event) = events.next().await {
        accumulator.push(&event?);
    }
    let message = accumulator.finish();
    log_request_complete(model, &message.usage, started);
    Ok(Json(message.to_json()).into_response())
}
