//! Supabase GoTrue implementation of `IdentityProvider`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{AuthError, AuthSession, IdentityProvider, SignUpOutcome};
use crate::config::SupabaseSettings;
use crate::models::User;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const FALLBACK_NAME: &str = "User";

pub struct SupabaseAuth {
    client: Client,
    settings: SupabaseSettings,
}

/// Raw GoTrue user record; only the fields we map.
#[derive(Debug, Deserialize)]
struct GoTrueUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: Value,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    user: GoTrueUser,
}

impl GoTrueUser {
    /// Display name: full_name, then name, then the email local part.
    fn into_user(self) -> User {
        let metadata = |key: &str| {
            self.user_metadata
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
        };
        let email = self.email.clone().unwrap_or_default();
        let name = metadata("full_name")
            .or_else(|| metadata("name"))
            .or_else(|| {
                email
                    .split('@')
                    .next()
                    .filter(|local| !local.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| FALLBACK_NAME.to_string());
        let avatar = metadata("avatar_url");
        User {
            id: self.id,
            name,
            email,
            avatar,
        }
    }
}

impl From<TokenResponse> for AuthSession {
    fn from(token: TokenResponse) -> Self {
        AuthSession {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            user: token.user.into_user(),
        }
    }
}

impl SupabaseAuth {
    pub fn new(settings: SupabaseSettings) -> Result<Self, AuthError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, settings })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<RequestBuilder, AuthError> {
        self.settings.validate()?;
        Ok(self
            .client
            .request(method, self.settings.endpoint(path))
            .header("apikey", &self.settings.anon_key))
    }

    async fn post_token(&self, grant_type: &str, body: Value) -> Result<AuthSession, AuthError> {
        let response = self
            .request(reqwest::Method::POST, "token")?
            .query(&[("grant_type", grant_type)])
            .json(&body)
            .send()
            .await?;
        let token: TokenResponse = check_status(response).await?.json().await?;
        Ok(token.into())
    }
}

#[async_trait]
impl IdentityProvider for SupabaseAuth {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        info!("Signing in {email}");
        self.post_token("password", json!({"email": email, "password": password}))
            .await
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: Option<&str>,
    ) -> Result<SignUpOutcome, AuthError> {
        let mut data = serde_json::Map::new();
        if let Some(full_name) = full_name.filter(|n| !n.trim().is_empty()) {
            data.insert("full_name".to_string(), json!(full_name));
        }
        let response = self
            .request(reqwest::Method::POST, "signup")?
            .json(&json!({"email": email, "password": password, "data": data}))
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;

        // With auto-confirm the response is a full session; otherwise it is
        // the bare user awaiting email confirmation.
        if body.get("access_token").is_some() {
            let session: AuthSession = serde_json::from_value::<TokenResponse>(body)?.into();
            return Ok(SignUpOutcome {
                user: session.user.clone(),
                session: Some(session),
            });
        }
        let user = serde_json::from_value::<GoTrueUser>(body)?.into_user();
        Ok(SignUpOutcome {
            user,
            session: None,
        })
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
        let response = self
            .request(reqwest::Method::POST, "logout")?
            .bearer_auth(access_token)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn reset_password(&self, email: &str) -> Result<(), AuthError> {
        info!("Requesting password reset for {email}");
        let response = self
            .request(reqwest::Method::POST, "recover")?
            .json(&json!({"email": email}))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn get_user(&self, access_token: &str) -> Result<User, AuthError> {
        let response = self
            .request(reqwest::Method::GET, "user")?
            .bearer_auth(access_token)
            .send()
            .await?;
        let user: GoTrueUser = check_status(response).await?.json().await?;
        Ok(user.into_user())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AuthError> {
        debug!("Refreshing auth session");
        self.post_token("refresh_token", json!({"refresh_token": refresh_token}))
            .await
    }
}

/// Non-2xx becomes `Rejected` carrying the provider's human message.
async fn check_status(response: Response) -> Result<Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AuthError::Rejected {
        status: status.as_u16(),
        message: error_message(&body),
    })
}

/// GoTrue has used `msg`, `error_description`, `message` and `error`.
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    ["msg", "error_description", "message", "error_code", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}
