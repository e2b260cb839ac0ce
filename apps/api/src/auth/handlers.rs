use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::auth::AuthEvent;
use crate::models::AuthResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Deserialize)]
pub struct ResetRequest {
    pub email: String,
}

/// POST /api/v1/auth/sign-in
pub async fn handle_sign_in(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> Json<AuthResult> {
    let result = state.auth.sign_in(req.email.trim(), &req.password).await;
    if result.success {
        open_workspace(&state).await;
    }
    Json(result)
}

/// POST /api/v1/auth/sign-up
pub async fn handle_sign_up(
    State(state): State<AppState>,
    Json(req): Json<SignUpRequest>,
) -> Json<AuthResult> {
    let result = state
        .auth
        .sign_up(req.email.trim(), &req.password, req.full_name.as_deref())
        .await;
    if result.success {
        open_workspace(&state).await;
    }
    Json(result)
}

/// POST /api/v1/auth/sign-out
/// Local chat state is cleared before the provider is told.
pub async fn handle_sign_out(State(state): State<AppState>) -> Json<AuthResult> {
    state.chat.on_signed_out().await;
    let result = state.auth.sign_out().await;
    if !result.success {
        warn!(
            "Logout completed locally despite provider error: {:?}",
            result.error
        );
    }
    Json(result)
}

/// POST /api/v1/auth/reset-password
pub async fn handle_reset_password(
    State(state): State<AppState>,
    Json(req): Json<ResetRequest>,
) -> Json<AuthResult> {
    Json(state.auth.reset_password(req.email.trim()).await)
}

/// GET /api/v1/auth/session
pub async fn handle_session(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "user": state.auth.current_user().await }))
}

/// GET /api/v1/auth/events
/// Starts with the current state, then relays every change.
pub async fn handle_auth_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut events = state.auth.subscribe();
    let initial = AuthEvent::InitialSession {
        user: state.auth.current_user().await,
    };

    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(to_sse(&initial));
        loop {
            match events.recv().await {
                Ok(event) => {
                    yield Ok::<_, Infallible>(to_sse(&event));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Auth event feed lagged; skipped {skipped} events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Hands a freshly signed-in user to the chat workspace.
async fn open_workspace(state: &AppState) {
    if let Some(user) = state.auth.current_user().await {
        state.chat.on_signed_in(user).await;
    }
}

fn to_sse(event: &AuthEvent) -> Event {
    let sse = Event::default().event(event.name());
    match serde_json::to_string(event) {
        Ok(data) => sse.data(data),
        Err(e) => {
            warn!("Failed to encode auth event: {e}");
            sse.data("{}")
        }
    }
}
