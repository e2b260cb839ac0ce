use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::config::ConfigStatus;
use crate::state::AppState;

/// GET /health
/// Returns a simple status object with service version.
pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": env!("CARGO_PKG_NAME")
    }))
}

/// GET /api/v1/config/status
/// Credential validation results. Only a prefix of the API key is shown.
pub async fn config_status_handler(State(state): State<AppState>) -> Json<ConfigStatus> {
    Json(ConfigStatus::from_config(&state.config))
}
