use std::sync::Arc;

use crate::auth::AuthService;
use crate::chat::controller::ChatController;
use crate::config::Config;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Identity provider session, token persistence and auth events.
    pub auth: Arc<AuthService>,
    /// Owner of all chat state; cheap to clone.
    pub chat: ChatController,
}
