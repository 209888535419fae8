//! WebSocket connector for the socket-message backend.

use std::time::Duration;

use http::HeaderMap;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, http as ws_http};

use crate::error::{FailureKind, UpstreamFailure};
use crate::util::header_string;

use super::retry_policy::transport_failure_kind;

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Rewrite an `http(s)` base URL to its `ws(s)` form; `ws(s)` URLs pass through.
///
/// # Errors
///
/// Returns a fatal [`UpstreamFailure`] for any other scheme.
pub fn to_ws_url(base_url: &str) -> Result<String, UpstreamFailure> {
    let u = base_url.trim_end();
    let (scheme, rest) = if let Some(r) = u.strip_prefix("https://") {
        ("wss://", r)
    } else if let Some(r) = u.strip_prefix("http://") {
        ("ws://", r)
    } else if let Some(r) = u.strip_prefix("wss://") {
        ("wss://", r)
    } else if let Some(r) = u.strip_prefix("ws://") {
        ("ws://", r)
    } else {
        return Err(UpstreamFailure::fatal(format!(
            "unsupported URL scheme for socket backend: {base_url}"
        )));
    };
    Ok(format!("{scheme}{rest}"))
}

fn build_handshake_request(
    ws_url: &str,
    headers: &HeaderMap,
) -> Result<ws_http::Request<()>, UpstreamFailure> {
    let mut req = ws_url
        .to_string()
        .into_client_request()
        .map_err(|e| UpstreamFailure::fatal(format!("invalid WebSocket URL: {e}")))?;

    // HTTP-only headers would interfere with the upgrade.
    for (name, value) in headers {
        if matches!(
            name.as_str(),
            "accept"
                | "content-type"
                | "content-length"
                | "cache-control"
                | "connection"
                | "keep-alive"
                | "transfer-encoding"
                | "accept-encoding"
        ) {
            continue;
        }
        req.headers_mut().insert(name, value.clone());
    }
    Ok(req)
}

/// Perform the WebSocket handshake within `connect_timeout`.
///
/// # Errors
///
/// Returns a classified [`UpstreamFailure`]: a rejected upgrade is classified by
/// its HTTP status, network errors and the timeout are transient.
pub async fn connect_socket(
    base_url: &str,
    headers: &HeaderMap,
    connect_timeout: Duration,
) -> Result<WsStream, UpstreamFailure> {
    super::install_crypto_provider();
    let ws_url = to_ws_url(base_url)?;
    let req = build_handshake_request(&ws_url, headers)?;
    match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(req)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(err)) => Err(failure_from_ws_error(err)),
        Err(_) => Err(UpstreamFailure::transient(format!(
            "WebSocket handshake did not complete within {connect_timeout:?}"
        ))),
    }
}

/// Classify a WebSocket protocol or transport error.
#[must_use]
pub fn failure_from_ws_error(err: tungstenite::Error) -> UpstreamFailure {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            let headers = response.headers();
            let error_type = header_string(headers, "x-error-type");
            let request_id = header_string(headers, "x-request-id");
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            UpstreamFailure::from_status(status, error_type, &body).with_request_id(request_id)
        }
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Io(_) => UpstreamFailure::transient(err.to_string()),
        tungstenite::Error::Url(_) | tungstenite::Error::HttpFormat(_) => {
            UpstreamFailure::new(FailureKind::Fatal, err.to_string())
        }
        other => {
            let message = other.to_string();
            UpstreamFailure::new(transport_failure_kind(&message), message)
        }
    }
}
