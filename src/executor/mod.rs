//! Retry, credential refresh and context shrinking around one backend.
//!
//! An attempt is committed once its first non-`MessageStart` event arrives.
//! Before that every failure is handled by [`RetryPolicy`]; afterwards the
//! stream is handed to the caller and a failure becomes its final item.

mod policy;
pub mod shrink;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};

use crate::adapter::{BackendAdapter, CanonicalStream};
use crate::credentials::{Credential, CredentialProvider};
use crate::error::{FailureKind, GatewayError, UpstreamFailure};
use crate::protocol::canonical::CanonicalEvent;
use crate::protocol::request::UnifiedRequest;

use policy::{Attempts, Decision};
pub use policy::RetryPolicy;
pub use shrink::{shrink, ShrinkLevel, SHRINK_LEVELS};

/// Canonical events as seen by the caller.
pub type GatewayStream =
    Pin<Box<dyn Stream<Item = Result<CanonicalEvent, GatewayError>> + Send + 'static>>;

/// Opens one upstream attempt.
#[async_trait]
pub trait UpstreamOpen: Send + Sync {
    async fn open(
        &self,
        credential: &Credential,
        request: &UnifiedRequest,
        session_id: &str,
    ) -> Result<CanonicalStream, UpstreamFailure>;
}

#[async_trait]
impl UpstreamOpen for BackendAdapter {
    async fn open(
        &self,
        credential: &Credential,
        request: &UnifiedRequest,
        session_id: &str,
    ) -> Result<CanonicalStream, UpstreamFailure> {
        BackendAdapter::open(self, credential, request, session_id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Idle,
    Sending,
    Streaming,
    Retrying,
    Refreshing,
    Shrinking,
    Terminal,
}

impl ExecState {
    fn as_str(self) -> &'static str {
        match self {
            ExecState::Idle => "idle",
            ExecState::Sending => "sending",
            ExecState::Streaming => "streaming",
            ExecState::Retrying => "retrying",
            ExecState::Refreshing => "refreshing",
            ExecState::Shrinking => "shrinking",
            ExecState::Terminal => "terminal",
        }
    }
}

pub struct RequestExecutor {
    backend: String,
    upstream: Arc<dyn UpstreamOpen>,
    credentials: Arc<dyn CredentialProvider>,
    policy: RetryPolicy,
}

impl RequestExecutor {
    #[must_use]
    pub fn new(
        backend: impl Into<String>,
        upstream: Arc<dyn UpstreamOpen>,
        credentials: Arc<dyn CredentialProvider>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            backend: backend.into(),
            upstream,
            credentials,
            policy,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    fn transition(&self, from: ExecState, to: ExecState, attempt: u32) -> ExecState {
        tracing::debug!(
            backend = %self.backend,
            from = from.as_str(),
            to = to.as_str(),
            attempt,
            "executor state"
        );
        to
    }

    async fn pick_credential(&self, excluded: &[String]) -> Result<Credential, GatewayError> {
        if let Some(credential) = self.credentials.select_active(excluded).await {
            return Ok(credential);
        }
        // Every account was rotated away from; start over rather than fail.
        if !excluded.is_empty() {
            if let Some(credential) = self.credentials.select_active(&[]).await {
                return Ok(credential);
            }
        }
        Err(GatewayError::NoCredential(self.backend.clone()))
    }

    /// Run `request` until a stream commits or the policy gives up.
    ///
    /// # Errors
    ///
    /// Returns the caller-facing error for a failure that happened before any
    /// content reached the caller.
    pub async fn execute(
        &self,
        request: &UnifiedRequest,
        session_id: &str,
    ) -> Result<GatewayStream, GatewayError> {
        let mut attempts = Attempts::default();
        let mut excluded: Vec<String> = Vec::new();
        let mut pinned: Option<Credential> = None;
        let mut shrunk: Option<UnifiedRequest> = None;
        let mut state = ExecState::Idle;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let credential = match pinned.take() {
                Some(credential) => credential,
                None => self.pick_credential(&excluded).await?,
            };
            state = self.transition(state, ExecState::Sending, attempt);
            let current = shrunk.as_ref().unwrap_or(request);

            let failure = match self.upstream.open(&credential, current, session_id).await {
                Ok(upstream) => {
                    self.credentials.record_success(&credential.id);
                    match commit(upstream).await {
                        Ok(committed) => {
                            self.transition(state, ExecState::Streaming, attempt);
                            return Ok(committed);
                        }
                        Err(failure) => failure,
                    }
                }
                Err(failure) => failure,
            };

            tracing::warn!(
                backend = %self.backend,
                credential = %credential.id,
                attempt,
                kind = failure.kind.as_str(),
                status = ?failure.status,
                error = %failure.message,
                "upstream attempt failed"
            );
            if matches!(failure.kind, FailureKind::AuthExpired | FailureKind::Fatal) {
                self.credentials.record_error(&credential.id, &failure.message);
            }

            match self.policy.decide(failure, &mut attempts) {
                Decision::Backoff { delay, rotate } => {
                    state = self.transition(state, ExecState::Retrying, attempt);
                    if rotate {
                        excluded.push(credential.id.clone());
                    } else {
                        pinned = Some(credential);
                    }
                    tokio::time::sleep(delay).await;
                }
                Decision::Refresh => {
                    state = self.transition(state, ExecState::Refreshing, attempt);
                    match self.credentials.refresh(&credential).await {
                        Ok(refreshed) => pinned = Some(refreshed),
                        Err(err) => {
                            self.transition(state, ExecState::Terminal, attempt);
                            return Err(err);
                        }
                    }
                }
                Decision::Shrink(level) => {
                    state = self.transition(state, ExecState::Shrinking, attempt);
                    shrunk = Some(shrink(request, level));
                    pinned = Some(credential);
                }
                Decision::Surface(err) => {
                    self.transition(state, ExecState::Terminal, attempt);
                    return Err(err);
                }
            }
        }
    }
}

/// Wait for the first content event, holding back `MessageStart`.
async fn commit(mut upstream: CanonicalStream) -> Result<GatewayStream, UpstreamFailure> {
    let mut held: Option<CanonicalEvent> = None;
    loop {
        match upstream.next().await {
            Some(Ok(event)) if event.is_message_start() => held = Some(event),
            Some(Ok(event)) => {
                let prefix: Vec<Result<CanonicalEvent, GatewayError>> =
                    held.into_iter().chain(Some(event)).map(Ok).collect();
                let rest = upstream.map(|item| item.map_err(GatewayError::Upstream));
                return Ok(Box::pin(stream::iter(prefix).chain(rest)));
            }
            Some(Err(failure)) => return Err(failure),
            None => {
                return Err(UpstreamFailure::transient(
                    "upstream closed before producing any event",
                ))
            }
        }
    }
}
