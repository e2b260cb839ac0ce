mod auth;
mod chat;
mod config;
mod dify;
mod errors;
mod models;
mod routes;
mod sessions;
mod state;
mod storage;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::supabase::SupabaseAuth;
use crate::auth::AuthService;
use crate::chat::controller::ChatController;
use crate::config::Config;
use crate::dify::DifyClient;
use crate::routes::build_router;
use crate::sessions::persistence::JsonSnapshotStore;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first; credentials are validated at use
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting YC Mind companion v{}", env!("CARGO_PKG_VERSION"));

    match config.dify.validate() {
        Ok(()) => info!(
            "Dify configured: base_url={}, key={}, mode={}",
            config.dify.base_url,
            config.dify.api_key_prefix(),
            config.dify.response_mode.as_str()
        ),
        Err(e) => warn!("Dify not usable until fixed: {e}"),
    }
    if let Err(e) = config.supabase.validate() {
        warn!("Identity provider not usable until fixed: {e}");
    }

    // Dify client and chat workspace
    let dify = DifyClient::new(config.dify.clone())?;
    let snapshots = Arc::new(JsonSnapshotStore::new(&config.data_dir));
    info!("Session snapshots at {}", snapshots.path().display());
    let chat = ChatController::new(dify, snapshots);

    // Identity provider; a stored session reopens the user's workspace
    let provider = Arc::new(SupabaseAuth::new(config.supabase.clone())?);
    let auth = Arc::new(AuthService::new(provider, &config.data_dir));
    if let Some(user) = auth.restore().await {
        chat.on_signed_in(user).await;
    }

    // Build app state
    let state = AppState {
        config: Arc::new(config.clone()),
        auth,
        chat,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("127.0.0.1:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
