use std::sync::Arc;

use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status, backend summary and credential health.
pub fn health_handler(state: &Arc<AppState>) -> Json<Value> {
    let backends: Vec<Value> = state
        .backends
        .iter()
        .map(|backend| {
            let accounts: Vec<Value> = backend
                .credentials
                .health()
                .into_iter()
                .map(|(id, consecutive_errors, successes)| {
                    json!({
                        "id": id,
                        "consecutive_errors": consecutive_errors,
                        "successes": successes,
                    })
                })
                .collect();
            json!({
                "name": backend.config.name,
                "kind": backend.config.kind.to_string(),
                "models": backend.config.models,
                "is_default": backend.config.is_default,
                "credentials": accounts,
            })
        })
        .collect();

    Json(json!({
        "status": "chatgate is running",
        "backends": backends,
        "known_models": state.model_router.model_names(),
        "active_sessions": state.sessions.len(),
        "features": {
            "log_level": state.config.features.log_level,
            "merge_adjacent_messages": state.config.features.merge_adjacent_messages,
        }
    }))
}
