use std::collections::HashSet;

use super::{AppConfig, BackendConfig, BackendKind, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_backends(config)?;
    validate_retry_config(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if server.connect_timeout_secs == 0 || server.idle_timeout_secs == 0 {
        return Err(validation_err(
            "server.connect_timeout_secs and server.idle_timeout_secs must be greater than 0",
        ));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    if !server.base_path.is_empty() && !server.base_path.starts_with('/') {
        return Err(validation_err("server.base_path must start with '/'"));
    }
    Ok(())
}

fn validate_backends(config: &AppConfig) -> Result<(), ConfigError> {
    if config.backends.is_empty() {
        return Err(validation_err("backends cannot be empty"));
    }

    let mut names = HashSet::new();
    for backend in &config.backends {
        if backend.name.trim().is_empty() {
            return Err(validation_err("backend name cannot be empty"));
        }
        if !names.insert(backend.name.as_str()) {
            return Err(validation_err(format!(
                "duplicate backend name '{}'",
                backend.name
            )));
        }
        validate_base_url(backend)?;
        validate_credentials(backend)?;
        // room for a prefix plus the `_xxxxxxxx` hash suffix
        if backend.tool_name_limit < 16 {
            return Err(validation_err(format!(
                "Backend '{}': tool_name_limit must be at least 16",
                backend.name
            )));
        }
        if backend.context_window == 0 {
            return Err(validation_err(format!(
                "Backend '{}': context_window must be greater than 0",
                backend.name
            )));
        }
        if let Some(refresh_url) = backend.refresh_url.as_deref() {
            validate_http_url(&backend.name, "refresh_url", refresh_url)?;
        }
        validate_models(backend)?;
    }

    Ok(())
}

fn validate_base_url(backend: &BackendConfig) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(&backend.base_url).map_err(|err| {
        validation_err(format!(
            "Backend '{}': base_url is not a valid URL: {err}",
            backend.name
        ))
    })?;
    let allowed: &[&str] = match backend.kind {
        BackendKind::Socket => &["ws", "wss", "http", "https"],
        BackendKind::EventStream | BackendKind::TypedSse => &["http", "https"],
    };
    if !allowed.contains(&parsed.scheme()) {
        return Err(validation_err(format!(
            "Backend '{}': base_url scheme must be one of {}",
            backend.name,
            allowed.join(", ")
        )));
    }
    Ok(())
}

fn validate_credentials(backend: &BackendConfig) -> Result<(), ConfigError> {
    if backend.credentials.is_empty() {
        return Err(validation_err(format!(
            "Backend '{}' must have at least one credential",
            backend.name
        )));
    }
    let mut ids = HashSet::new();
    for cred in &backend.credentials {
        if cred.id.trim().is_empty() || cred.access_token.trim().is_empty() {
            return Err(validation_err(format!(
                "Backend '{}': credential id and access_token cannot be empty",
                backend.name
            )));
        }
        if !ids.insert(cred.id.as_str()) {
            return Err(validation_err(format!(
                "Backend '{}': duplicate credential id '{}'",
                backend.name, cred.id
            )));
        }
    }
    Ok(())
}

fn validate_models(backend: &BackendConfig) -> Result<(), ConfigError> {
    if backend.models.is_empty() {
        return Err(validation_err(format!(
            "Backend '{}' must have at least one model",
            backend.name
        )));
    }
    let mut entries = HashSet::new();
    for model in &backend.models {
        if model.trim().is_empty() {
            return Err(validation_err(format!(
                "Backend '{}': model name cannot be empty",
                backend.name
            )));
        }
        if !entries.insert(model.as_str()) {
            return Err(validation_err(format!(
                "Backend '{}': duplicate model entry '{model}'",
                backend.name
            )));
        }
        if let Some((alias, real_model)) = model.split_once(':') {
            if alias.trim().is_empty() || real_model.trim().is_empty() {
                return Err(validation_err(format!(
                    "Invalid alias format in '{model}'. Both parts must not be empty."
                )));
            }
        }
    }
    Ok(())
}

fn validate_http_url(backend: &str, field_name: &str, value: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(value.trim()).map_err(|err| {
        validation_err(format!(
            "Backend '{backend}': {field_name} is not a valid URL: {err}"
        ))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "Backend '{backend}': {field_name} must use http:// or https://"
        )));
    }
    Ok(())
}

fn validate_retry_config(config: &AppConfig) -> Result<(), ConfigError> {
    let retry = &config.retry;
    if retry.max_attempts == 0 {
        return Err(validation_err("retry.max_attempts must be greater than 0"));
    }
    if retry.base_backoff_ms > retry.max_backoff_ms {
        return Err(validation_err(
            "retry.base_backoff_ms cannot exceed retry.max_backoff_ms",
        ));
    }
    if config.session.ttl_secs == 0 {
        return Err(validation_err("session.ttl_secs must be greater than 0"));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;

    fn make_valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            backends: vec![BackendConfig {
                name: "codex".to_string(),
                kind: BackendKind::TypedSse,
                base_url: "https://api.example.com/v1".to_string(),
                models: vec!["gpt-5-codex".to_string()],
                description: String::new(),
                is_default: true,
                tool_name_limit: 64,
                context_window: 200_000,
                credentials: vec![CredentialConfig {
                    id: "acct-1".to_string(),
                    access_token: "tok".to_string(),
                    refresh_token: None,
                }],
                refresh_url: None,
            }],
            retry: RetryConfig::default(),
            session: SessionConfig::default(),
            features: FeaturesConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&make_valid_config()).is_ok());
    }

    #[test]
    fn test_empty_backends() {
        let mut config = make_valid_config();
        config.backends.clear();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_backend_name() {
        let mut config = make_valid_config();
        let second = config.backends[0].clone();
        config.backends.push(second);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_same_model_across_backends_is_allowed() {
        let mut config = make_valid_config();
        let mut second = config.backends[0].clone();
        second.name = "second".to_string();
        second.is_default = false;
        config.backends.push(second);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_duplicate_model_within_backend() {
        let mut config = make_valid_config();
        config.backends[0].models.push("gpt-5-codex".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_alias() {
        let mut config = make_valid_config();
        config.backends[0].models.push(":gpt-5".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_base_url_scheme() {
        let mut config = make_valid_config();
        config.backends[0].base_url = "ftp://bad.url".to_string();
        assert!(validate_config(&config).is_err());
        config.backends[0].base_url = "wss://socket.example.com".to_string();
        assert!(validate_config(&config).is_err());
        config.backends[0].kind = BackendKind::Socket;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_missing_credentials() {
        let mut config = make_valid_config();
        config.backends[0].credentials.clear();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_empty_access_token() {
        let mut config = make_valid_config();
        config.backends[0].credentials[0].access_token = "  ".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_tool_name_limit_too_small() {
        let mut config = make_valid_config();
        config.backends[0].tool_name_limit = 8;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_refresh_url() {
        let mut config = make_valid_config();
        config.backends[0].refresh_url = Some("not a url".to_string());
        assert!(validate_config(&config).is_err());
        config.backends[0].refresh_url = Some("https://auth.example.com/refresh".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = make_valid_config();
        config.features.log_level = "VERBOSE".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_retry() {
        let mut config = make_valid_config();
        config.retry.max_attempts = 0;
        assert!(validate_config(&config).is_err());
        let mut config = make_valid_config();
        config.retry.base_backoff_ms = 10_000;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_base_path() {
        let mut config = make_valid_config();
        config.server.base_path = "gateway".to_string();
        assert!(validate_config(&config).is_err());
    }
}
