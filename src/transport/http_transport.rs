use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use serde_json::Value;

use crate::config::ServerConfig;
use crate::error::{FailureKind, GatewayError, UpstreamFailure};
use crate::util::header_string;

use super::retry_policy::{parse_retry_after_delay, transport_failure_kind};

const ERROR_TYPE_HEADERS: [&str; 2] = ["x-amzn-errortype", "x-error-type"];
const REQUEST_ID_HEADERS: [&str; 4] = [
    "x-amzn-requestid",
    "x-request-id",
    "request-id",
    "x-amz-request-id",
];
/// Error bodies are only read for diagnostics; cap what we buffer.
const ERROR_BODY_MAX_BYTES: usize = 64 * 1024;

fn build_reqwest_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    connect_timeout: Duration,
) -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(connect_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|err| GatewayError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// HTTP client shared by the HTTP-based backend adapters.
///
/// Performs exactly one attempt per call; retry policy belongs to the executor.
/// Non-success responses are turned into classified [`UpstreamFailure`]s.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl HttpTransport {
    /// Create a transport with connection pooling and timeouts from the server config.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the HTTP client cannot be built.
    pub fn new(config: &ServerConfig) -> Result<Self, GatewayError> {
        let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
        };
        Self::with_timeouts(
            config.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            config.connect_timeout(),
            config.idle_timeout(),
        )
    }

    /// Create a transport with explicit timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the HTTP client cannot be built.
    pub fn with_timeouts(
        pool_max_idle_per_host: usize,
        pool_idle_timeout: Option<Duration>,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        super::install_crypto_provider();
        let client = build_reqwest_client(pool_max_idle_per_host, pool_idle_timeout, connect_timeout)?;
        Ok(Self {
            client,
            connect_timeout,
            idle_timeout,
        })
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Longest silence tolerated while waiting for headers or between body chunks.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// POST a body and return the response once its status is a success.
    ///
    /// # Errors
    ///
    /// Returns a classified [`UpstreamFailure`] for transport errors, timeouts
    /// and non-2xx responses.
    pub async fn post_stream(
        &self,
        url: &str,
        headers: http::HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, UpstreamFailure> {
        let request = self.client.post(url).headers(headers).body(body);
        let response = match tokio::time::timeout(self.idle_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(failure_from_reqwest(&err)),
            Err(_) => {
                return Err(UpstreamFailure::transient(format!(
                    "upstream sent no response headers within {:?}",
                    self.idle_timeout
                )))
            }
        };

        if response.status().is_success() {
            return Ok(response);
        }
        Err(failure_from_response(response).await)
    }

    /// POST a JSON document and parse the JSON response.
    ///
    /// # Errors
    ///
    /// Returns a classified [`UpstreamFailure`]; an unparseable success body is fatal.
    pub async fn post_json(
        &self,
        url: &str,
        headers: http::HeaderMap,
        body: &Value,
    ) -> Result<Value, UpstreamFailure> {
        let payload = serde_json::to_vec(body)
            .map_err(|err| UpstreamFailure::fatal(format!("failed to encode request: {err}")))?;
        let mut headers = headers;
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        let response = self.post_stream(url, headers, Bytes::from(payload)).await?;
        let bytes = match tokio::time::timeout(self.idle_timeout, response.bytes()).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => return Err(failure_from_reqwest(&err)),
            Err(_) => {
                return Err(UpstreamFailure::transient(format!(
                    "upstream body stalled for {:?}",
                    self.idle_timeout
                )))
            }
        };
        serde_json::from_slice(&bytes)
            .map_err(|err| UpstreamFailure::fatal(format!("invalid JSON from upstream: {err}")))
    }
}

/// The response body as a stream of chunks with classified errors.
pub fn body_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<Bytes, UpstreamFailure>> + Send + 'static {
    response
        .bytes_stream()
        .map_err(|err| failure_from_reqwest(&err))
}

/// Classify a reqwest error that happened before or while reading a body.
#[must_use]
pub fn failure_from_reqwest(err: &reqwest::Error) -> UpstreamFailure {
    let message = err.to_string();
    let kind = if err.is_builder() {
        FailureKind::Fatal
    } else if err.is_timeout() || err.is_connect() || err.is_body() || err.is_decode() {
        FailureKind::Transient
    } else {
        transport_failure_kind(&message)
    };
    let mut failure = UpstreamFailure::new(kind, message);
    failure.status = err.status().map(|status| status.as_u16());
    failure
}

async fn failure_from_response(response: reqwest::Response) -> UpstreamFailure {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let header_error_type = ERROR_TYPE_HEADERS
        .iter()
        .find_map(|name| header_string(&headers, name))
        .map(|raw| normalize_error_type(&raw));
    let request_id = REQUEST_ID_HEADERS
        .iter()
        .find_map(|name| header_string(&headers, name));
    let retry_after = parse_retry_after_delay(&headers);

    let body = read_error_body(response).await;
    let error_type = header_error_type.or_else(|| body_error_type(&body));

    tracing::debug!(
        status,
        error_type = error_type.as_deref().unwrap_or(""),
        request_id = request_id.as_deref().unwrap_or(""),
        "upstream rejected request"
    );

    UpstreamFailure::from_status(status, error_type, &body)
        .with_request_id(request_id)
        .with_retry_after(retry_after)
}

async fn read_error_body(mut response: reqwest::Response) -> String {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let room = ERROR_BODY_MAX_BYTES.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
                if buf.len() >= ERROR_BODY_MAX_BYTES {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// `ValidationException:http://internal.amazon.com/...` -> `ValidationException`.
fn normalize_error_type(raw: &str) -> String {
    raw.split(':').next().unwrap_or(raw).trim().to_string()
}

fn body_error_type(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let candidate = value
        .pointer("/error/type")
        .or_else(|| value.pointer("/error/code"))
        .or_else(|| value.get("__type"))
        .or_else(|| value.get("reason"))?;
    candidate
        .as_str()
        .filter(|s| !s.is_empty())
        .map(normalize_error_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_error_type_strips_namespace() {
        assert_eq!(
            normalize_error_type("ValidationException:http://internal.amazon.com/coral/"),
            "ValidationException"
        );
        assert_eq!(normalize_error_type("ThrottlingException"), "ThrottlingException");
    }

    #[test]
    fn test_body_error_type_shapes() {
        assert_eq!(
            body_error_type(r#"{"error":{"type":"rate_limit_error","message":"slow"}}"#).as_deref(),
            Some("rate_limit_error")
        );
        assert_eq!(
            body_error_type(r#"{"__type":"com.amazon#ThrottlingException"}"#).as_deref(),
            Some("com.amazon#ThrottlingException")
        );
        assert_eq!(body_error_type("not json"), None);
    }

    #[test]
    fn test_transport_builds_from_server_config() {
        let transport = HttpTransport::new(&ServerConfig::default()).unwrap();
        assert_eq!(transport.idle_timeout(), Duration::from_secs(120));
        assert_eq!(transport.connect_timeout(), Duration::from_secs(30));
    }
}
