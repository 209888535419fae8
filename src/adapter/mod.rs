//! Backend adapters: one per upstream protocol family.
//!
//! Each adapter opens its transport, decodes native events and maps them to
//! [`CanonicalEvent`]s through a [`StreamState`]. The returned stream is lazy and
//! owns the transport; dropping it closes the connection.

pub mod event_stream;
pub mod socket;
pub mod state;
pub mod typed_sse;

use std::collections::VecDeque;
use std::pin::Pin;

use futures_util::{Stream, StreamExt};

use crate::config::{BackendConfig, BackendKind, ServerConfig};
use crate::credentials::Credential;
use crate::error::UpstreamFailure;
use crate::observability::token_counter::estimate_request_tokens;
use crate::protocol::canonical::{CanonicalEvent, EventBatch};
use crate::protocol::request::UnifiedRequest;
use crate::protocol::tool_names::ToolNameMap;
use crate::transport::HttpTransport;
use crate::util::next_message_id;

pub use event_stream::EventStreamAdapter;
pub use socket::SocketAdapter;
pub use state::StreamState;
pub use typed_sse::TypedSseAdapter;

/// Lazily produced canonical events of one upstream attempt.
pub type CanonicalStream =
    Pin<Box<dyn Stream<Item = Result<CanonicalEvent, UpstreamFailure>> + Send + 'static>>;

/// Closed set of upstream protocol families.
pub enum BackendAdapter {
    EventStream(EventStreamAdapter),
    TypedSse(TypedSseAdapter),
    Socket(SocketAdapter),
}

impl BackendAdapter {
    #[must_use]
    pub fn from_config(config: &BackendConfig, server: &ServerConfig, transport: &HttpTransport) -> Self {
        match config.kind {
            BackendKind::EventStream => {
                BackendAdapter::EventStream(EventStreamAdapter::new(config, transport.clone()))
            }
            BackendKind::TypedSse => {
                BackendAdapter::TypedSse(TypedSseAdapter::new(config, transport.clone()))
            }
            BackendKind::Socket => BackendAdapter::Socket(SocketAdapter::new(
                config,
                server.connect_timeout(),
                server.idle_timeout(),
            )),
        }
    }

    /// Open one upstream attempt.
    ///
    /// # Errors
    ///
    /// Returns a classified [`UpstreamFailure`] when the upstream cannot be
    /// reached or rejects the request before streaming.
    pub async fn open(
        &self,
        credential: &Credential,
        request: &UnifiedRequest,
        session_id: &str,
    ) -> Result<CanonicalStream, UpstreamFailure> {
        match self {
            BackendAdapter::EventStream(adapter) => adapter.open(credential, request, session_id).await,
            BackendAdapter::TypedSse(adapter) => adapter.open(credential, request, session_id).await,
            BackendAdapter::Socket(adapter) => adapter.open(credential, request, session_id).await,
        }
    }
}

/// Per-attempt context shared by the adapters.
pub(crate) struct PreparedRequest {
    pub names: ToolNameMap,
    pub estimated_input: u64,
}

impl PreparedRequest {
    pub(crate) fn new(request: &UnifiedRequest, tool_name_limit: usize) -> Self {
        Self {
            names: ToolNameMap::build(tool_name_limit, request.tool_names()),
            estimated_input: estimate_request_tokens(request),
        }
    }

    pub(crate) fn into_state(self, model: &str) -> StreamState {
        StreamState::new(
            next_message_id(),
            model.to_string(),
            self.names,
            self.estimated_input,
        )
    }
}

/// Turns raw upstream items into canonical events.
pub(crate) trait EventMapper: Send + 'static {
    type Raw: Send + 'static;

    /// Map one raw item. An `Err` ends the stream after the events already pushed.
    fn on_raw(&mut self, raw: Self::Raw, out: &mut EventBatch) -> Result<(), UpstreamFailure>;

    /// The upstream closed its side.
    fn on_end(&mut self, out: &mut EventBatch) -> Result<(), UpstreamFailure>;

    fn is_finished(&self) -> bool;
}

struct Drive<S, M> {
    source: Pin<Box<S>>,
    mapper: M,
    pending: VecDeque<CanonicalEvent>,
    failure: Option<UpstreamFailure>,
    done: bool,
}

/// Pull raw items from `source` only when the consumer asks for the next event.
///
/// At most the events produced from one raw item are buffered. The source is
/// dropped as soon as the mapper finishes or fails.
pub(crate) fn drive<S, M>(source: S, mapper: M) -> CanonicalStream
where
    S: Stream<Item = Result<M::Raw, UpstreamFailure>> + Send + 'static,
    M: EventMapper,
{
    let state = Drive {
        source: Box::pin(source),
        mapper,
        pending: VecDeque::with_capacity(8),
        failure: None,
        done: false,
    };
    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        let mut batch = EventBatch::new();
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if let Some(failure) = st.failure.take() {
                return Some((Err(failure), st));
            }
            if st.done {
                return None;
            }

            let result = match st.source.as_mut().next().await {
                Some(Ok(raw)) => st.mapper.on_raw(raw, &mut batch),
                Some(Err(failure)) => Err(failure),
                None => {
                    st.done = true;
                    st.mapper.on_end(&mut batch)
                }
            };
            st.pending.extend(batch.drain(..));
            if let Err(failure) = result {
                st.failure = Some(failure);
                st.done = true;
            }
            if st.mapper.is_finished() {
                st.done = true;
            }
        }
    }))
}

pub(crate) fn bearer_headers(credential: &Credential) -> Result<http::HeaderMap, UpstreamFailure> {
    let mut headers = http::HeaderMap::new();
    let value = http::HeaderValue::from_str(&format!("Bearer {}", credential.access_token))
        .map_err(|_| UpstreamFailure::fatal(format!("credential '{}' is not a valid header value", credential.id)))?;
    headers.insert(http::header::AUTHORIZATION, value);
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    Ok(headers)
}

pub(crate) fn insert_header(headers: &mut http::HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = http::HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
