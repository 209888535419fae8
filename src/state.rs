pub mod session_cache;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::adapter::BackendAdapter;
use crate::config::{AppConfig, BackendConfig};
use crate::credentials::CredentialPool;
use crate::error::GatewayError;
use crate::executor::{RequestExecutor, RetryPolicy};
use crate::routing::{ModelRouter, RouteTarget};
use crate::transport::HttpTransport;
use crate::util::format_request_seq_hex;

pub use session_cache::SessionCache;

/// One configured backend with its executor and account pool.
pub struct BackendRuntime {
    pub config: BackendConfig,
    pub credentials: Arc<CredentialPool>,
    pub executor: RequestExecutor,
}

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
    pub model_router: ModelRouter,
    pub backends: Vec<BackendRuntime>,
    pub sessions: SessionCache,
    request_seq: AtomicU64,
}

impl AppState {
    /// Build every backend runtime from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when the HTTP client cannot be built.
    pub fn new(config: AppConfig) -> Result<Self, GatewayError> {
        let transport = HttpTransport::new(&config.server)?;
        let model_router = ModelRouter::new(&config);
        let policy = RetryPolicy::from_config(&config.retry);
        let backends = config
            .backends
            .iter()
            .map(|backend| {
                let credentials = Arc::new(CredentialPool::from_config(backend, transport.clone()));
                let adapter = BackendAdapter::from_config(backend, &config.server, &transport);
                BackendRuntime {
                    config: backend.clone(),
                    credentials: Arc::clone(&credentials),
                    executor: RequestExecutor::new(
                        backend.name.clone(),
                        Arc::new(adapter),
                        credentials,
                        policy.clone(),
                    ),
                }
            })
            .collect();
        let sessions = SessionCache::from_config(&config.session);

        Ok(Self {
            config,
            transport,
            model_router,
            backends,
            sessions,
            request_seq: AtomicU64::new(1),
        })
    }

    /// Next request id, `req_` + 16 hex digits.
    pub fn next_request_id(&self) -> String {
        format_request_seq_hex("req_", self.request_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Resolve a model to its backend runtime and upstream model name.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NoRoute`] when no backend serves `model`.
    pub fn route<'a>(&'a self, model: &'a str) -> Result<(&'a BackendRuntime, RouteTarget<'a>), GatewayError> {
        let target = self.model_router.resolve(model)?;
        let backend = self
            .backends
            .get(target.backend_index)
            .ok_or_else(|| GatewayError::Internal(format!("backend index {} out of range", target.backend_index)))?;
        Ok((backend, target))
    }
}
