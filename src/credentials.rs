//! Upstream credentials and the in-memory reference provider.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use crate::config::{BackendConfig, CredentialConfig};
use crate::error::{GatewayError, UpstreamFailure};
use crate::transport::HttpTransport;

/// Consecutive errors after which an account is only used as a last resort.
const UNHEALTHY_AFTER_ERRORS: u32 = 3;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

impl From<&CredentialConfig> for Credential {
    fn from(config: &CredentialConfig) -> Self {
        Self {
            id: config.id.clone(),
            access_token: config.access_token.clone(),
            refresh_token: config.refresh_token.clone(),
        }
    }
}

/// Source of upstream accounts for one backend.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// An active account not listed in `excluding`.
    async fn select_active(&self, excluding: &[String]) -> Option<Credential>;

    fn record_success(&self, id: &str);

    fn record_error(&self, id: &str, message: &str);

    /// Exchange a stale credential for a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AuthRefresh`] when the account cannot be refreshed.
    async fn refresh(&self, credential: &Credential) -> Result<Credential, GatewayError>;
}

#[derive(Debug)]
struct PoolEntry {
    credential: RwLock<Credential>,
    consecutive_errors: AtomicU32,
    successes: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Round-robin pool built from the backend's configured credentials.
pub struct CredentialPool {
    backend: String,
    entries: Vec<PoolEntry>,
    cursor: AtomicUsize,
    refresh_url: Option<String>,
    transport: Option<HttpTransport>,
}

impl CredentialPool {
    #[must_use]
    pub fn new(backend: &str, credentials: Vec<Credential>) -> Self {
        Self {
            backend: backend.to_string(),
            entries: credentials
                .into_iter()
                .map(|credential| PoolEntry {
                    credential: RwLock::new(credential),
                    consecutive_errors: AtomicU32::new(0),
                    successes: AtomicU64::new(0),
                    last_error: Mutex::new(None),
                })
                .collect(),
            cursor: AtomicUsize::new(0),
            refresh_url: None,
            transport: None,
        }
    }

    #[must_use]
    pub fn from_config(config: &BackendConfig, transport: HttpTransport) -> Self {
        let mut pool = Self::new(
            &config.name,
            config.credentials.iter().map(Credential::from).collect(),
        );
        pool.refresh_url.clone_from(&config.refresh_url);
        pool.transport = Some(transport);
        pool
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(id, consecutive_errors, successes)` per account.
    #[must_use]
    pub fn health(&self) -> Vec<(String, u32, u64)> {
        self.entries
            .iter()
            .map(|entry| {
                (
                    entry.credential.read().id.clone(),
                    entry.consecutive_errors.load(Ordering::Relaxed),
                    entry.successes.load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    #[must_use]
    pub fn last_error(&self, id: &str) -> Option<String> {
        self.entry(id).and_then(|entry| entry.last_error.lock().clone())
    }

    fn entry(&self, id: &str) -> Option<&PoolEntry> {
        self.entries
            .iter()
            .find(|entry| entry.credential.read().id == id)
    }

    fn pick(&self, excluding: &[String]) -> Option<Credential> {
        let len = self.entries.len();
        if len == 0 {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let mut fallback: Option<(u32, &PoolEntry)> = None;
        for offset in 0..len {
            let entry = &self.entries[(start + offset) % len];
            let credential = entry.credential.read();
            if excluding.iter().any(|id| *id == credential.id) {
                continue;
            }
            let errors = entry.consecutive_errors.load(Ordering::Relaxed);
            if errors < UNHEALTHY_AFTER_ERRORS {
                return Some(credential.clone());
            }
            if fallback.map_or(true, |(best, _)| errors < best) {
                fallback = Some((errors, entry));
            }
        }
        fallback.map(|(_, entry)| entry.credential.read().clone())
    }

    async fn exchange(&self, credential: &Credential) -> Result<Credential, GatewayError> {
        let refresh_failed = |message: String, last: Option<UpstreamFailure>| {
            GatewayError::AuthRefresh { message, last }
        };
        let Some(url) = self.refresh_url.as_deref() else {
            return Err(refresh_failed(
                format!("backend '{}' has no refresh endpoint", self.backend),
                None,
            ));
        };
        let Some(refresh_token) = credential.refresh_token.as_deref() else {
            return Err(refresh_failed(
                format!("credential '{}' has no refresh token", credential.id),
                None,
            ));
        };
        let Some(transport) = self.transport.as_ref() else {
            return Err(refresh_failed("no HTTP transport configured".into(), None));
        };

        let response = transport
            .post_json(
                url,
                http::HeaderMap::new(),
                &json!({ "refreshToken": refresh_token }),
            )
            .await
            .map_err(|failure| refresh_failed(failure.message.clone(), Some(failure)))?;

        let access_token = string_field(&response, &["accessToken", "access_token"])
            .ok_or_else(|| refresh_failed("refresh response carries no access token".into(), None))?;
        let refresh_token = string_field(&response, &["refreshToken", "refresh_token"])
            .or_else(|| credential.refresh_token.clone());

        Ok(Credential {
            id: credential.id.clone(),
            access_token,
            refresh_token,
        })
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

#[async_trait]
impl CredentialProvider for CredentialPool {
    async fn select_active(&self, excluding: &[String]) -> Option<Credential> {
        self.pick(excluding)
    }

    fn record_success(&self, id: &str) {
        if let Some(entry) = self.entry(id) {
            entry.consecutive_errors.store(0, Ordering::Relaxed);
            entry.successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_error(&self, id: &str, message: &str) {
        if let Some(entry) = self.entry(id) {
            let errors = entry.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
            *entry.last_error.lock() = Some(message.to_string());
            tracing::warn!(
                backend = %self.backend,
                credential = id,
                consecutive_errors = errors,
                error = message,
                "upstream credential error"
            );
        }
    }

    async fn refresh(&self, credential: &Credential) -> Result<Credential, GatewayError> {
        let refreshed = self.exchange(credential).await?;
        if let Some(entry) = self.entry(&credential.id) {
            *entry.credential.write() = refreshed.clone();
        }
        tracing::info!(backend = %self.backend, credential = %credential.id, "credential refreshed");
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(id: &str) -> Credential {
        Credential {
            id: id.into(),
            access_token: format!("tok-{id}"),
            refresh_token: None,
        }
    }

    #[tokio::test]
    async fn test_round_robin_and_exclusion() {
        let pool = CredentialPool::new("b", vec![cred("a"), cred("b")]);
        let first = pool.select_active(&[]).await.unwrap();
        let second = pool.select_active(&[]).await.unwrap();
        assert_ne!(first.id, second.id);
        let only = pool.select_active(&["a".to_string()]).await.unwrap();
        assert_eq!(only.id, "b");
        assert!(pool
            .select_active(&["a".to_string(), "b".to_string()])
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_unhealthy_account_is_last_resort() {
        let pool = CredentialPool::new("b", vec![cred("a"), cred("b")]);
        for _ in 0..UNHEALTHY_AFTER_ERRORS {
            pool.record_error("a", "boom");
        }
        for _ in 0..4 {
            assert_eq!(pool.select_active(&[]).await.unwrap().id, "b");
        }
        assert_eq!(
            pool.select_active(&["b".to_string()]).await.unwrap().id,
            "a"
        );
        pool.record_success("a");
        assert_eq!(pool.health()[0].1, 0);
        assert_eq!(pool.last_error("a").as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_refresh_without_endpoint_fails() {
        let pool = CredentialPool::new("b", vec![cred("a")]);
        let err = pool.refresh(&cred("a")).await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthRefresh { .. }));
    }

    #[test]
    fn test_debug_redacts_token() {
        let rendered = format!("{:?}", cred("a"));
        assert!(!rendered.contains("tok-a"));
    }
}
