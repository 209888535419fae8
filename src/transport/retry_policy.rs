use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;

use crate::error::FailureKind;

/// Upper bound accepted from an upstream `Retry-After` before the executor's own cap.
const RETRY_AFTER_PARSE_MAX_SECS: u64 = 3_600;

#[inline]
pub(crate) fn should_retry_transport_message(message: &str) -> bool {
    const NEEDLES: [&[u8]; 11] = [
        b"timed out",
        b"timeout",
        b"connection reset",
        b"connection aborted",
        b"connection closed",
        b"broken pipe",
        b"http2 error",
        b"connection refused",
        b"unexpected eof",
        b"stream closed",
        b"error sending request",
    ];
    let haystack = message.as_bytes();
    NEEDLES
        .iter()
        .any(|needle| contains_ascii_case_insensitive(haystack, needle))
}

/// Classify a transport-level error message that carries no HTTP status.
#[inline]
pub(crate) fn transport_failure_kind(message: &str) -> FailureKind {
    if should_retry_transport_message(message) {
        FailureKind::Transient
    } else {
        FailureKind::Fatal
    }
}

#[inline]
fn contains_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }

    haystack.windows(needle.len()).any(|window| {
        window
            .iter()
            .zip(needle.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}

/// Parse `Retry-After` as delta-seconds or an HTTP date.
#[inline]
pub(crate) fn parse_retry_after_delay(headers: &http::HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds.min(RETRY_AFTER_PARSE_MAX_SECS)));
    }

    let target = httpdate::parse_http_date(raw).ok()?;
    let delay = target.duration_since(SystemTime::now()).unwrap_or_default();
    Some(delay.min(Duration::from_secs(RETRY_AFTER_PARSE_MAX_SECS)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, http::HeaderValue::from_static("5"));
        let delay = parse_retry_after_delay(&headers).unwrap();
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let target = SystemTime::now() + Duration::from_secs(2);
        let mut headers = http::HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            http::HeaderValue::from_str(&httpdate::fmt_http_date(target)).unwrap(),
        );
        let delay = parse_retry_after_delay(&headers).unwrap();
        assert!(delay <= Duration::from_secs(2));
    }

    #[test]
    fn test_parse_retry_after_invalid() {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, http::HeaderValue::from_static("not-a-delay"));
        assert!(parse_retry_after_delay(&headers).is_none());
        assert!(parse_retry_after_delay(&http::HeaderMap::new()).is_none());
    }

    #[test]
    fn test_transport_failure_kind() {
        assert_eq!(
            transport_failure_kind("error sending request for url (http://x): connection refused"),
            FailureKind::Transient
        );
        assert_eq!(
            transport_failure_kind("upstream failed with HTTP2 error: stream closed"),
            FailureKind::Transient
        );
        assert_eq!(
            transport_failure_kind("relative URL without a base"),
            FailureKind::Fatal
        );
    }
}
