use std::convert::Infallible;

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::chat::controller::{ComposerState, TurnEvent};
use crate::chat::messages::welcome_message;
use crate::errors::AppError;
use crate::models::UploadedFile;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub text: String,
}

#[derive(Deserialize)]
pub struct LinkedinRequest {
    pub url: String,
}

/// GET /api/v1/welcome
pub async fn handle_welcome(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "message": welcome_message(state.config.welcome_message.as_deref())
    }))
}

/// GET /api/v1/composer
pub async fn handle_composer(State(state): State<AppState>) -> Json<ComposerState> {
    Json(state.chat.composer().await)
}

/// POST /api/v1/composer/file
/// Multipart with a single `file` part.
pub async fn handle_stage_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadedFile>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| AppError::Validation("file part has no file name".to_string()))?;
        let content = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(e.to_string()))?;
        let uploaded = state.chat.stage_file(&file_name, content).await?;
        return Ok(Json(uploaded));
    }
    Err(AppError::Validation("missing multipart field `file`".to_string()))
}

/// DELETE /api/v1/composer/file
pub async fn handle_unstage_file(State(state): State<AppState>) -> StatusCode {
    state.chat.unstage_file().await;
    StatusCode::NO_CONTENT
}

/// PUT /api/v1/composer/linkedin
pub async fn handle_stage_linkedin(
    State(state): State<AppState>,
    Json(req): Json<LinkedinRequest>,
) -> Result<Json<ComposerState>, AppError> {
    state.chat.stage_linkedin(&req.url).await?;
    Ok(Json(state.chat.composer().await))
}

/// DELETE /api/v1/composer/linkedin
pub async fn handle_unstage_linkedin(State(state): State<AppState>) -> StatusCode {
    state.chat.unstage_linkedin().await;
    StatusCode::NO_CONTENT
}

/// POST /api/v1/chat/send
/// Streams the turn's events as SSE; the stream closes after `idle`.
/// The turn keeps running if the client disconnects.
///
/// `delta` events carry a `kind`: append `append` text, and set the held
/// text to the payload for both `restart` and `replace` (after `clear`).
/// Appending a `restart` payload would duplicate the answer.
pub async fn handle_send(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let mut turn = state.chat.send(&req.text).await?;
    info!("Streaming turn events for session {}", turn.session_id);

    let stream = async_stream::stream! {
        while let Some(event) = turn.events.recv().await {
            yield Ok::<_, Infallible>(to_sse(&event));
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// POST /api/v1/chat/abort
pub async fn handle_abort(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "aborted": state.chat.abort().await }))
}

fn to_sse(event: &TurnEvent) -> Event {
    let sse = Event::default().event(event.name());
    match serde_json::to_string(event) {
        Ok(data) => sse.data(data),
        Err(e) => {
            warn!("Failed to encode turn event: {e}");
            sse.data("{}")
        }
    }
}
