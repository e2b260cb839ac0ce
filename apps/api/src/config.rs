use std::path::PathBuf;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::Serialize;
use thiserror::Error;

/// Required prefix of every Dify app API key.
pub const DIFY_KEY_PREFIX: &str = "app-";
const DIFY_KEY_PLACEHOLDER: &str = "app-your-api-key-here";
const DEFAULT_DIFY_BASE_URL: &str = "https://api.dify.ai/v1";

const SUPABASE_URL_PLACEHOLDERS: [&str; 2] = ["your-supabase-url-here", "placeholder"];
const SUPABASE_KEY_PLACEHOLDERS: [&str; 2] = ["your-supabase-anon-key-here", "placeholder-key"];

/// Raised before any network call when credentials are missing or still
/// carry the sample values from `.env.example`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Dify API key is not configured (set DIFY_API_KEY)")]
    MissingApiKey,

    #[error("Dify API key is still the placeholder value (set DIFY_API_KEY)")]
    PlaceholderApiKey,

    #[error("Dify API key must start with \"app-\"")]
    InvalidApiKeyFormat,

    #[error("Dify base URL is not configured (set DIFY_BASE_URL)")]
    MissingBaseUrl,

    #[error("Identity provider URL is missing or invalid (set SUPABASE_URL)")]
    InvalidIdentityUrl,

    #[error("Identity provider key is missing or invalid (set SUPABASE_ANON_KEY)")]
    InvalidIdentityKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Streaming,
    Blocking,
}

impl ResponseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseMode::Streaming => "streaming",
            ResponseMode::Blocking => "blocking",
        }
    }
}

/// Dify chat API settings. Values are kept raw and validated at use so a
/// misconfigured key surfaces as a chat error instead of a startup crash.
#[derive(Debug, Clone)]
pub struct DifySettings {
    pub api_key: String,
    pub base_url: String,
    pub app_id: Option<String>,
    pub response_mode: ResponseMode,
    /// End-user identifier sent with every request.
    pub user: String,
}

impl DifySettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let key = self.api_key.trim();
        if key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if key == DIFY_KEY_PLACEHOLDER {
            return Err(ConfigError::PlaceholderApiKey);
        }
        if !key.starts_with(DIFY_KEY_PREFIX) {
            return Err(ConfigError::InvalidApiKeyFormat);
        }
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::MissingBaseUrl);
        }
        Ok(())
    }

    /// First 15 characters of the key; the full key is never logged.
    pub fn api_key_prefix(&self) -> String {
        let prefix: String = self.api_key.chars().take(15).collect();
        format!("{prefix}...")
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Clone)]
pub struct SupabaseSettings {
    pub url: String,
    pub anon_key: String,
}

impl SupabaseSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url_ok = Url::parse(&self.url).is_ok()
            && !SUPABASE_URL_PLACEHOLDERS
                .iter()
                .any(|p| self.url.contains(p));
        if !url_ok {
            return Err(ConfigError::InvalidIdentityUrl);
        }
        if SUPABASE_KEY_PLACEHOLDERS.contains(&self.anon_key.as_str()) || self.anon_key.len() <= 10
        {
            return Err(ConfigError::InvalidIdentityKey);
        }
        Ok(())
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.url.trim_end_matches('/'), path)
    }
}

/// Application configuration loaded from environment variables.
/// Only PORT parsing can fail at startup; credentials are checked lazily.
#[derive(Debug, Clone)]
pub struct Config {
    pub dify: DifySettings,
    pub supabase: SupabaseSettings,
    pub data_dir: PathBuf,
    pub welcome_message: Option<String>,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let response_mode = match optional_env("DIFY_RESPONSE_MODE").as_deref() {
            Some("blocking") => ResponseMode::Blocking,
            _ => ResponseMode::Streaming,
        };

        Ok(Config {
            dify: DifySettings {
                api_key: optional_env("DIFY_API_KEY").unwrap_or_default(),
                base_url: optional_env("DIFY_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_DIFY_BASE_URL.to_string()),
                app_id: optional_env("DIFY_APP_ID"),
                response_mode,
                user: optional_env("DIFY_USER").unwrap_or_else(|| "user".to_string()),
            },
            supabase: SupabaseSettings {
                url: optional_env("SUPABASE_URL").unwrap_or_default(),
                anon_key: optional_env("SUPABASE_ANON_KEY").unwrap_or_default(),
            },
            data_dir: optional_env("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            welcome_message: optional_env("WELCOME_MESSAGE"),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Snapshot of configuration health, safe to show in the browser.
#[derive(Debug, Serialize)]
pub struct ConfigStatus {
    pub api_key_prefix: String,
    pub base_url: String,
    pub app_id: Option<String>,
    pub is_valid_format: bool,
    pub response_mode: ResponseMode,
    pub dify_error: Option<String>,
    pub identity_error: Option<String>,
}

impl ConfigStatus {
    pub fn from_config(config: &Config) -> Self {
        ConfigStatus {
            api_key_prefix: config.dify.api_key_prefix(),
            base_url: config.dify.base_url.clone(),
            app_id: config.dify.app_id.clone(),
            is_valid_format: config.dify.api_key.starts_with(DIFY_KEY_PREFIX),
            response_mode: config.dify.response_mode,
            dify_error: config.dify.validate().err().map(|e| e.to_string()),
            identity_error: config.supabase.validate().err().map(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_dify_settings(base_url: &str) -> DifySettings {
    DifySettings {
        api_key: "app-test-key-123456".to_string(),
        base_url: base_url.to_string(),
        app_id: None,
        response_mode: ResponseMode::Streaming,
        user: "user".to_string(),
    }
}
