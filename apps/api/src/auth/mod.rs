// Identity: email/password auth delegated to the external provider.
// The rest of the app only ever sees `User` and `AuthResult`.

pub mod handlers;
pub mod supabase;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::models::{AuthResult, User};
use crate::storage::{read_json, remove_json, write_json_atomic};

/// File name of the persisted provider tokens inside the data directory.
pub const AUTH_KEY: &str = "ycmind_auth.json";
const EVENT_CAPACITY: usize = 16;

/// Provider error messages that mean "already signed out server-side".
const STALE_SESSION_MARKERS: [&str; 2] = ["session_not_found", "Session from session_id claim"];

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unexpected identity provider response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Provider tokens plus the mapped user they belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user: User,
}

/// Sign-up may or may not start a session (email confirmation).
#[derive(Debug, Clone)]
pub struct SignUpOutcome {
    pub user: User,
    pub session: Option<AuthSession>,
}

/// Auth state-change notifications, newest state last.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuthEvent {
    InitialSession { user: Option<User> },
    SignedIn { user: User },
    SignedOut,
}

impl AuthEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuthEvent::InitialSession { .. } => "initial_session",
            AuthEvent::SignedIn { .. } => "signed_in",
            AuthEvent::SignedOut => "signed_out",
        }
    }
}

/// The external identity provider. Swap implementations without touching
/// the handlers.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AuthError>;
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: Option<&str>,
    ) -> Result<SignUpOutcome, AuthError>;
    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError>;
    async fn reset_password(&self, email: &str) -> Result<(), AuthError>;
    async fn get_user(&self, access_token: &str) -> Result<User, AuthError>;
    async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AuthError>;
}

/// Owns the provider session, persists its tokens, and broadcasts
/// state changes.
pub struct AuthService {
    provider: Arc<dyn IdentityProvider>,
    token_path: PathBuf,
    session: Mutex<Option<AuthSession>>,
    events: broadcast::Sender<AuthEvent>,
}

impl AuthService {
    pub fn new(provider: Arc<dyn IdentityProvider>, data_dir: &Path) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            provider,
            token_path: data_dir.join(AUTH_KEY),
            session: Mutex::new(None),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub async fn current_user(&self) -> Option<User> {
        self.session.lock().await.as_ref().map(|s| s.user.clone())
    }

    /// Restores the persisted session at startup: validate the access
    /// token, fall back to a refresh, and forget the tokens only when the
    /// provider rejects both.
    pub async fn restore(&self) -> Option<User> {
        let stored: Option<AuthSession> = match read_json(&self.token_path).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Ignoring unreadable auth tokens: {e}");
                None
            }
        };

        let restored = match stored {
            Some(stored) => self.revalidate(stored).await,
            None => None,
        };

        if restored.is_none() {
            if let Err(e) = remove_json(&self.token_path).await {
                warn!("Failed to remove stale auth tokens: {e}");
            }
        }

        let user = restored.as_ref().map(|s| s.user.clone());
        *self.session.lock().await = restored;
        info!("Initial auth session: {}", user.as_ref().map_or("guest", |u| u.email.as_str()));
        self.notify(AuthEvent::InitialSession { user: user.clone() });
        user
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> AuthResult {
        match self.provider.sign_in(email, password).await {
            Ok(session) => self.start_session(session).await,
            Err(e) => {
                warn!("Sign-in failed for {email}: {e}");
                AuthResult::failed(e.to_string())
            }
        }
    }

    pub async fn sign_up(&self, email: &str, password: &str, full_name: Option<&str>) -> AuthResult {
        match self.provider.sign_up(email, password, full_name).await {
            Ok(SignUpOutcome {
                session: Some(session),
                ..
            }) => self.start_session(session).await,
            Ok(SignUpOutcome { user, session: None }) => {
                info!("Sign-up for {email} awaits email confirmation");
                AuthResult::ok(Some(user))
            }
            Err(e) => {
                warn!("Sign-up failed for {email}: {e}");
                AuthResult::failed(e.to_string())
            }
        }
    }

    /// Local state is always cleared first. Server-side failures only fail
    /// the result when they are not stale-session or transport errors.
    pub async fn sign_out(&self) -> AuthResult {
        let previous = self.session.lock().await.take();
        if let Err(e) = remove_json(&self.token_path).await {
            warn!("Failed to remove auth tokens: {e}");
        }
        self.notify(AuthEvent::SignedOut);

        let Some(previous) = previous else {
            return AuthResult::ok(None);
        };
        match self.provider.sign_out(&previous.access_token).await {
            Ok(()) => AuthResult::ok(None),
            Err(AuthError::Rejected { message, .. })
                if !STALE_SESSION_MARKERS.iter().any(|m| message.contains(m)) =>
            {
                warn!("Provider sign-out warning: {message}");
                AuthResult::failed(message)
            }
            Err(e) => {
                warn!("Sign-out completed locally despite: {e}");
                AuthResult::ok(None)
            }
        }
    }

    pub async fn reset_password(&self, email: &str) -> AuthResult {
        match self.provider.reset_password(email).await {
            Ok(()) => AuthResult::ok(None),
            Err(e) => AuthResult::failed(e.to_string()),
        }
    }

    async fn start_session(&self, session: AuthSession) -> AuthResult {
        if let Err(e) = write_json_atomic(&self.token_path, &session).await {
            warn!("Signed in but failed to persist auth tokens: {e}");
        }
        let user = session.user.clone();
        *self.session.lock().await = Some(session);
        info!("Signed in as {}", user.email);
        self.notify(AuthEvent::SignedIn { user: user.clone() });
        AuthResult::ok(Some(user))
    }

    /// Only a provider rejection drops the stored tokens. When the provider
    /// cannot be reached the stored session is kept as-is.
    async fn revalidate(&self, stored: AuthSession) -> Option<AuthSession> {
        match self.provider.get_user(&stored.access_token).await {
            Ok(user) => return Some(AuthSession { user, ..stored }),
            Err(AuthError::Rejected { message, .. }) => {
                info!("Stored access token rejected ({message}), trying refresh")
            }
            Err(e) => {
                warn!("Could not verify stored session ({e}); keeping it");
                return Some(stored);
            }
        }
        let Some(refresh_token) = stored.refresh_token.as_deref() else {
            return None;
        };
        match self.provider.refresh(refresh_token).await {
            Ok(session) => {
                if let Err(e) = write_json_atomic(&self.token_path, &session).await {
                    warn!("Failed to persist refreshed auth tokens: {e}");
                }
                Some(session)
            }
            Err(AuthError::Rejected { message, .. }) => {
                info!("Refresh rejected ({message}); starting as guest");
                None
            }
            Err(e) => {
                warn!("Could not refresh stored session ({e}); keeping it");
                Some(stored)
            }
        }
    }

    fn notify(&self, event: AuthEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
