use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;

use crate::chat::controller::SessionList;
use crate::errors::AppError;
use crate::models::ChatSession;
use crate::state::AppState;

/// GET /api/v1/sessions
pub async fn handle_list_sessions(State(state): State<AppState>) -> Json<SessionList> {
    Json(state.chat.sessions().await)
}

/// POST /api/v1/sessions
/// Returns the current session instead when it has no messages yet.
pub async fn handle_new_chat(State(state): State<AppState>) -> Json<ChatSession> {
    Json(state.chat.new_chat().await)
}

/// GET /api/v1/sessions/:id
/// Selects the session and returns it with its messages.
pub async fn handle_select_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChatSession>, AppError> {
    Ok(Json(state.chat.select_session(&id).await?))
}

/// DELETE /api/v1/sessions/:id
pub async fn handle_delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.chat.delete_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/sessions/:id/history
/// Raw Dify message history for the session's conversation.
pub async fn handle_session_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(state.chat.history(&id).await?))
}
