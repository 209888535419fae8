pub mod dispatch;

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::config::AppConfig;
use crate::error::GatewayError;

/// The resolved target for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTarget<'a> {
    pub backend_index: usize,
    /// Model name to send upstream.
    pub actual_model: &'a str,
}

#[derive(Debug, Clone)]
struct Candidate {
    backend_index: usize,
    model: Arc<str>,
}

/// Pre-built index of every backend model and alias.
///
/// Model entries are either an exact name or `alias:real_model`. The first
/// backend listing a name wins. Unknown models go to the default backend,
/// unchanged.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    model_index: FxHashMap<String, Candidate>,
    default_backend: Option<usize>,
}

impl ModelRouter {
    #[must_use]
    pub fn new(config: &AppConfig) -> Self {
        let mut model_index: FxHashMap<String, Candidate> = FxHashMap::default();
        for (idx, backend) in config.backends.iter().enumerate() {
            for entry in &backend.models {
                let (name, real_model) = match entry.split_once(':') {
                    Some((alias, real)) => (alias, real),
                    None => (entry.as_str(), entry.as_str()),
                };
                model_index.entry(name.to_string()).or_insert_with(|| Candidate {
                    backend_index: idx,
                    model: Arc::from(real_model),
                });
            }
        }
        let default_backend = config.backends.iter().position(|backend| backend.is_default);
        Self {
            model_index,
            default_backend,
        }
    }

    #[must_use]
    pub fn known_model_count(&self) -> usize {
        self.model_index.len()
    }

    /// Names (and aliases) callers may request, sorted.
    #[must_use]
    pub fn model_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.model_index.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a requested model.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NoRoute`] when nothing matches and no backend is
    /// marked default.
    pub fn resolve<'a>(&'a self, model: &'a str) -> Result<RouteTarget<'a>, GatewayError> {
        if let Some(candidate) = self.model_index.get(model) {
            return Ok(RouteTarget {
                backend_index: candidate.backend_index,
                actual_model: &candidate.model,
            });
        }
        match self.default_backend {
            Some(backend_index) => Ok(RouteTarget {
                backend_index,
                actual_model: model,
            }),
            None => Err(GatewayError::NoRoute(model.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BackendConfig, BackendKind, CredentialConfig, FeaturesConfig, RetryConfig, ServerConfig,
        SessionConfig,
    };

    fn backend(name: &str, models: &[&str], is_default: bool) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            kind: BackendKind::TypedSse,
            base_url: format!("https://{name}.example.com"),
            models: models.iter().map(ToString::to_string).collect(),
            description: String::new(),
            is_default,
            tool_name_limit: 64,
            context_window: 128_000,
            credentials: vec![CredentialConfig {
                id: "c".into(),
                access_token: "t".into(),
                refresh_token: None,
            }],
            refresh_url: None,
        }
    }

    fn config(backends: Vec<BackendConfig>) -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            backends,
            retry: RetryConfig::default(),
            session: SessionConfig::default(),
            features: FeaturesConfig::default(),
        }
    }

    #[test]
    fn test_exact_and_alias() {
        let router = ModelRouter::new(&config(vec![
            backend("a", &["gpt-5", "fast:gpt-5-mini"], false),
            backend("b", &["claude-sonnet-4"], false),
        ]));
        assert_eq!(
            router.resolve("gpt-5").unwrap(),
            RouteTarget {
                backend_index: 0,
                actual_model: "gpt-5"
            }
        );
        assert_eq!(router.resolve("fast").unwrap().actual_model, "gpt-5-mini");
        assert_eq!(router.resolve("claude-sonnet-4").unwrap().backend_index, 1);
        assert!(matches!(router.resolve("nope"), Err(GatewayError::NoRoute(_))));
        assert_eq!(router.model_names(), vec!["claude-sonnet-4", "fast", "gpt-5"]);
    }

    #[test]
    fn test_first_backend_wins_and_default_fallback() {
        let router = ModelRouter::new(&config(vec![
            backend("a", &["shared"], false),
            backend("b", &["shared"], true),
        ]));
        assert_eq!(router.resolve("shared").unwrap().backend_index, 0);
        let fallback = router.resolve("unlisted").unwrap();
        assert_eq!(fallback.backend_index, 1);
        assert_eq!(fallback.actual_model, "unlisted");
    }
}
