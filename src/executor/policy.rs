use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{FailureKind, GatewayError, UpstreamFailure};

use super::shrink::SHRINK_LEVELS;

/// Per-request counters the policy consults.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Attempts {
    pub transient: u32,
    pub refreshed: bool,
    pub shrink_level: usize,
}

/// What the executor does next after a failed attempt.
#[derive(Debug)]
pub(crate) enum Decision {
    /// Wait, then retry; `rotate` excludes the current credential.
    Backoff { delay: Duration, rotate: bool },
    Refresh,
    /// Retry the original request compressed to this level (1-based).
    Shrink(usize),
    Surface(GatewayError),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    max_retry_after: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.base_backoff_ms)),
            max_retry_after: Duration::from_secs(config.max_retry_after_secs),
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (0-based).
    ///
    /// `base * 2^retry` capped at the maximum, plus up to 10% jitter. An upstream
    /// `Retry-After` replaces the computed value, capped separately.
    #[must_use]
    pub fn backoff(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(retry_after) = retry_after {
            return retry_after.min(self.max_retry_after);
        }
        let factor = 1_u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
        let delay = self.base_backoff.saturating_mul(factor).min(self.max_backoff);
        let jitter_cap = (delay.as_millis() / 10) as u64;
        if jitter_cap == 0 {
            return delay;
        }
        delay + Duration::from_millis(fastrand::u64(0..=jitter_cap))
    }

    pub(crate) fn decide(&self, failure: UpstreamFailure, attempts: &mut Attempts) -> Decision {
        match failure.kind {
            FailureKind::Transient => {
                attempts.transient += 1;
                if attempts.transient >= self.max_attempts {
                    return Decision::Surface(GatewayError::RetriesExhausted {
                        attempts: attempts.transient,
                        last: failure,
                    });
                }
                Decision::Backoff {
                    delay: self.backoff(attempts.transient - 1, failure.retry_after),
                    rotate: failure.status == Some(429),
                }
            }
            FailureKind::AuthExpired if !attempts.refreshed => {
                attempts.refreshed = true;
                Decision::Refresh
            }
            FailureKind::ContextTooLarge if attempts.shrink_level < SHRINK_LEVELS => {
                attempts.shrink_level += 1;
                Decision::Shrink(attempts.shrink_level)
            }
            FailureKind::ContextTooLarge => Decision::Surface(GatewayError::ContextLimit {
                levels: SHRINK_LEVELS,
                last: failure,
            }),
            FailureKind::AuthExpired => {
                // Already refreshed once; the new token was refused too.
                let mut failure = failure;
                failure.kind = FailureKind::Fatal;
                Decision::Surface(GatewayError::Upstream(failure))
            }
            FailureKind::Fatal => Decision::Surface(GatewayError::Upstream(failure)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::from_config(&RetryConfig {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 300,
            max_retry_after_secs: 5,
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        let first = p.backoff(0, None);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        let second = p.backoff(1, None);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(220));
        let capped = p.backoff(10, None);
        assert!(capped >= Duration::from_millis(300) && capped <= Duration::from_millis(330));
    }

    #[test]
    fn test_retry_after_overrides_and_is_capped() {
        let p = policy();
        assert_eq!(p.backoff(0, Some(Duration::from_secs(2))), Duration::from_secs(2));
        assert_eq!(p.backoff(0, Some(Duration::from_secs(60))), Duration::from_secs(5));
    }

    #[test]
    fn test_transient_exhausts_after_max_attempts() {
        let p = policy();
        let mut attempts = Attempts::default();
        for _ in 0..2 {
            assert!(matches!(
                p.decide(UpstreamFailure::transient("x"), &mut attempts),
                Decision::Backoff { rotate: false, .. }
            ));
        }
        match p.decide(UpstreamFailure::transient("x"), &mut attempts) {
            Decision::Surface(GatewayError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rate_limit_rotates() {
        let p = policy();
        let mut attempts = Attempts::default();
        let failure = UpstreamFailure::from_status(429, None, "slow down");
        assert!(matches!(
            p.decide(failure, &mut attempts),
            Decision::Backoff { rotate: true, .. }
        ));
    }

    #[test]
    fn test_auth_refresh_once() {
        let p = policy();
        let mut attempts = Attempts::default();
        let expired = || UpstreamFailure::new(FailureKind::AuthExpired, "expired");
        assert!(matches!(p.decide(expired(), &mut attempts), Decision::Refresh));
        match p.decide(expired(), &mut attempts) {
            Decision::Surface(GatewayError::Upstream(failure)) => {
                assert_eq!(failure.kind, FailureKind::Fatal);
                assert_eq!(failure.message, "expired");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_shrink_ladder_terminates() {
        let p = policy();
        let mut attempts = Attempts::default();
        let big = || UpstreamFailure::new(FailureKind::ContextTooLarge, "too long");
        for level in 1..=SHRINK_LEVELS {
            match p.decide(big(), &mut attempts) {
                Decision::Shrink(l) => assert_eq!(l, level),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(matches!(
            p.decide(big(), &mut attempts),
            Decision::Surface(GatewayError::ContextLimit { levels: 4, .. })
        ));
    }

    #[test]
    fn test_fatal_surfaces_immediately() {
        let p = policy();
        let mut attempts = Attempts::default();
        assert!(matches!(
            p.decide(UpstreamFailure::fatal("bad"), &mut attempts),
            Decision::Surface(GatewayError::Upstream(_))
        ));
    }
}
