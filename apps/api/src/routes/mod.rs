pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};

use crate::auth::handlers as auth;
use crate::chat::handlers as chat;
use crate::sessions::handlers as sessions;
use crate::state::AppState;

/// Résumé uploads are capped well above typical PDF sizes.
const MAX_UPLOAD_BYTES: usize = 15 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/v1/config/status", get(health::config_status_handler))
        .route("/api/v1/welcome", get(chat::handle_welcome))
        // Auth
        .route("/api/v1/auth/sign-in", post(auth::handle_sign_in))
        .route("/api/v1/auth/sign-up", post(auth::handle_sign_up))
        .route("/api/v1/auth/sign-out", post(auth::handle_sign_out))
        .route(
            "/api/v1/auth/reset-password",
            post(auth::handle_reset_password),
        )
        .route("/api/v1/auth/session", get(auth::handle_session))
        .route("/api/v1/auth/events", get(auth::handle_auth_events))
        // Sessions
        .route(
            "/api/v1/sessions",
            get(sessions::handle_list_sessions).post(sessions::handle_new_chat),
        )
        .route(
            "/api/v1/sessions/:id",
            get(sessions::handle_select_session).delete(sessions::handle_delete_session),
        )
        .route(
            "/api/v1/sessions/:id/history",
            get(sessions::handle_session_history),
        )
        // Composer
        .route("/api/v1/composer", get(chat::handle_composer))
        .route(
            "/api/v1/composer/file",
            post(chat::handle_stage_file)
                .delete(chat::handle_unstage_file)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route(
            "/api/v1/composer/linkedin",
            put(chat::handle_stage_linkedin).delete(chat::handle_unstage_linkedin),
        )
        // Chat
        .route("/api/v1/chat/send", post(chat::handle_send))
        .route("/api/v1/chat/abort", post(chat::handle_abort))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::auth::fake::FakeProvider;
    use crate::auth::AuthService;
    use crate::chat::controller::ChatController;
    use crate::config::{test_dify_settings, Config, SupabaseSettings};
    use crate::dify::DifyClient;
    use crate::sessions::persistence::JsonSnapshotStore;

    fn test_state(dify_url: &str, data_dir: &Path) -> AppState {
        let config = Config {
            dify: test_dify_settings(dify_url),
            supabase: SupabaseSettings {
                url: "https://project.supabase.co".to_string(),
                anon_key: "anon-key-0123456789".to_string(),
            },
            data_dir: data_dir.to_path_buf(),
            welcome_message: Some("Hello!\\nAsk me anything.".to_string()),
            port: 0,
            rust_log: "info".to_string(),
        };
        let chat = ChatController::new(
            DifyClient::new(config.dify.clone()).unwrap(),
            Arc::new(JsonSnapshotStore::new(data_dir)),
        );
        AppState {
            auth: Arc::new(AuthService::new(Arc::new(FakeProvider::default()), data_dir)),
            chat,
            config: Arc::new(config),
        }
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn sign_in(router: &Router) {
        let (status, body) = call(
            router,
            Method::POST,
            "/api/v1/auth/sign-in",
            Some(json!({"email": "ada@example.com", "password": "correct horse"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn test_health_reports_service_name() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state("https://api.dify.ai/v1", dir.path()));
        let (status, body) = call(&router, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "ycmind");
    }

    #[tokio::test]
    async fn test_config_status_shows_only_key_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state("https://api.dify.ai/v1", dir.path()));
        let (_, body) = call(&router, Method::GET, "/api/v1/config/status", None).await;
        assert_eq!(body["api_key_prefix"], "app-test-key-12...");
        assert_eq!(body["is_valid_format"], true);
        assert!(body["dify_error"].is_null());
    }

    #[tokio::test]
    async fn test_welcome_unescapes_newlines() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state("https://api.dify.ai/v1", dir.path()));
        let (_, body) = call(&router, Method::GET, "/api/v1/welcome", None).await;
        assert_eq!(body["message"], "Hello!\nAsk me anything.");
    }

    #[tokio::test]
    async fn test_guest_send_requires_login() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state("https://api.dify.ai/v1", dir.path()));
        let (status, body) = call(
            &router,
            Method::POST,
            "/api/v1/chat/send",
            Some(json!({"text": "Hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "LOGIN_REQUIRED");
    }

    #[tokio::test]
    async fn test_signed_in_empty_send_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state("https://api.dify.ai/v1", dir.path()));
        sign_in(&router).await;
        let (status, body) = call(
            &router,
            Method::POST,
            "/api/v1/chat/send",
            Some(json!({"text": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_send_streams_turn_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"event\":\"message\",\"answer\":\"Hi there\",\"conversation_id\":\"c-1\"}\n\ndata: [DONE]\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state(&server.uri(), dir.path()));
        sign_in(&router).await;

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/chat/send")
            .header("content-type", "application/json")
            .body(Body::from(json!({"text": "Hello"}).to_string()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("event: user_messages"));
        assert!(text.contains("event: delta"));
        assert!(text.contains("event: stream_ended"));
        assert!(text.contains("event: idle"));

        let (_, sessions) = call(&router, Method::GET, "/api/v1/sessions", None).await;
        let messages = sessions["sessions"][0]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["content"], "Hi there");
        assert_eq!(sessions["sessions"][0]["conversationId"], "c-1");
    }

    #[tokio::test]
    async fn test_session_lifecycle_routes() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state("https://api.dify.ai/v1", dir.path()));
        sign_in(&router).await;

        let (_, created) = call(&router, Method::POST, "/api/v1/sessions", None).await;
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["title"], "New Chat");

        let (status, selected) =
            call(&router, Method::GET, &format!("/api/v1/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(selected["id"], id.as_str());

        let (status, _) =
            call(&router, Method::GET, &format!("/api/v1/sessions/{id}/history"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            call(&router, Method::DELETE, &format!("/api/v1/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) =
            call(&router, Method::DELETE, &format!("/api/v1/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_linkedin_staging_route_validates_url() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state("https://api.dify.ai/v1", dir.path()));
        sign_in(&router).await;

        let (status, _) = call(
            &router,
            Method::PUT,
            "/api/v1/composer/linkedin",
            Some(json!({"url": "https://example.com/ada"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, composer) = call(
            &router,
            Method::PUT,
            "/api/v1/composer/linkedin",
            Some(json!({"url": "https://linkedin.com/in/ada"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(composer["staged_linkedin"], "https://linkedin.com/in/ada");
        assert_eq!(composer["phase"], "idle");
    }

    #[tokio::test]
    async fn test_sign_out_clears_session_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state("https://api.dify.ai/v1", dir.path()));
        sign_in(&router).await;
        call(&router, Method::POST, "/api/v1/sessions", None).await;

        let (_, result) = call(&router, Method::POST, "/api/v1/auth/sign-out", None).await;
        assert_eq!(result["success"], true);

        let (_, session) = call(&router, Method::GET, "/api/v1/auth/session", None).await;
        assert!(session["user"].is_null());
        let (_, sessions) = call(&router, Method::GET, "/api/v1/sessions", None).await;
        assert_eq!(sessions["sessions"].as_array().unwrap().len(), 0);
        assert!(!dir
            .path()
            .join(crate::sessions::persistence::SESSIONS_KEY)
            .exists());
    }
}
