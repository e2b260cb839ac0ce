//! Dify client: the single point of entry for chat, upload and history calls.
//!
//! Every request validates configuration first, honours a cancellation
//! token while in flight, and maps non-2xx statuses onto `DifyError`.
//! 403 gets its own variant so callers can show key-remediation text.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, DifySettings, ResponseMode};
use crate::models::UploadedFile;

pub mod events;
pub mod reconciler;
pub mod sse;
pub mod stream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const BLOCKING_TIMEOUT: Duration = Duration::from_secs(120);
const HISTORY_LIMIT: u32 = 100;
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum DifyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("API key rejected (403): {body}")]
    Auth { body: String },

    #[error("Dify API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request aborted")]
    Aborted,

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Upload validation failed: {0}")]
    UploadValidation(String),
}

impl DifyError {
    /// User-initiated cancellation is not an error from the user's view.
    pub fn is_aborted(&self) -> bool {
        matches!(self, DifyError::Aborted)
    }

    /// Failures the user fixes by correcting credentials.
    pub fn needs_config_fix(&self) -> bool {
        matches!(self, DifyError::Config(_) | DifyError::Auth { .. })
    }
}

/// Response body delivered chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, DifyError>> + Send>>;

/// One outgoing chat turn.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub query: String,
    pub conversation_id: Option<String>,
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Serialize)]
struct ChatMessagesBody<'a> {
    inputs: serde_json::Map<String, Value>,
    query: &'a str,
    response_mode: &'static str,
    conversation_id: Option<&'a str>,
    user: &'a str,
    files: Vec<FileReference<'a>>,
}

#[derive(Debug, Serialize)]
struct FileReference<'a> {
    #[serde(rename = "type")]
    file_type: &'static str,
    transfer_method: &'static str,
    upload_file_id: &'a str,
    name: &'a str,
}

/// Blocking-mode answer.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub answer: String,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Clone)]
pub struct DifyClient {
    client: Client,
    settings: DifySettings,
    retry_base_delay: Duration,
}

impl DifyClient {
    pub fn new(settings: DifySettings) -> Result<Self, DifyError> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            settings,
            retry_base_delay: Duration::from_millis(1000),
        })
    }

    pub fn settings(&self) -> &DifySettings {
        &self.settings
    }

    #[cfg(test)]
    pub(crate) fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// `POST /chat-messages` in blocking mode.
    pub async fn chat_blocking(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, DifyError> {
        let builder = self
            .chat_builder(request, ResponseMode::Blocking)?
            .timeout(BLOCKING_TIMEOUT);
        let response = self.send(builder, cancel).await?;
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DifyError::Aborted),
            body = response.text() => body?,
        };
        let completion: ChatCompletion = serde_json::from_str(&body)?;
        debug!(
            "Blocking answer received: {} chars, conversation={:?}",
            completion.answer.len(),
            completion.conversation_id
        );
        Ok(completion)
    }

    /// `POST /chat-messages` in streaming mode; returns the raw SSE body.
    pub async fn chat_stream(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, DifyError> {
        let builder = self.chat_builder(request, ResponseMode::Streaming)?;
        let response = self.send(builder, cancel).await?;
        Ok(Box::pin(response.bytes_stream().map_err(DifyError::from)))
    }

    /// `POST /files/upload`. The returned handle is validated: an upload
    /// that succeeds over HTTP but yields no usable id is still a failure.
    pub async fn upload_file(
        &self,
        file_name: &str,
        content: Bytes,
        cancel: &CancellationToken,
    ) -> Result<UploadedFile, DifyError> {
        self.settings.validate()?;
        let local_size = content.len() as u64;
        info!("Uploading {file_name} ({local_size} bytes) to Dify");

        let part = Part::bytes(content.to_vec())
            .file_name(file_name.to_string())
            .mime_str("application/pdf")?;
        let form = Form::new()
            .part("file", part)
            .text("user", self.settings.user.clone())
            .text("purpose", "retrieval");

        let builder = self
            .client
            .post(self.settings.endpoint("files/upload"))
            .bearer_auth(&self.settings.api_key)
            .multipart(form)
            .timeout(BLOCKING_TIMEOUT);
        let response = self.send(builder, cancel).await?;
        let body: Value = serde_json::from_str(&response.text().await?)?;
        resolve_uploaded_file(&body, file_name, local_size)
    }

    /// `GET /messages` for a remote conversation. Idempotent, so 429/5xx
    /// and transport failures are retried with exponential backoff.
    pub async fn conversation_messages(&self, conversation_id: &str) -> Result<Value, DifyError> {
        self.settings.validate()?;
        let limit = HISTORY_LIMIT.to_string();
        let mut last_error: Option<DifyError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = self.retry_base_delay * (1 << (attempt - 1));
                warn!(
                    "History fetch attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = self
                .client
                .get(self.settings.endpoint("messages"))
                .bearer_auth(&self.settings.api_key)
                .query(&[
                    ("conversation_id", conversation_id),
                    ("user", self.settings.user.as_str()),
                    ("limit", limit.as_str()),
                ])
                .timeout(BLOCKING_TIMEOUT)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(DifyError::Network(e));
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                warn!("Dify history returned {}: {}", status, body);
                last_error = Some(DifyError::Api {
                    status: status.as_u16(),
                    body,
                });
                continue;
            }

            let response = check_status(response).await?;
            return Ok(serde_json::from_str(&response.text().await?)?);
        }

        Err(last_error.unwrap_or(DifyError::Api {
            status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            body: format!("gave up after {MAX_RETRIES} attempts"),
        }))
    }

    fn chat_builder(
        &self,
        request: &ChatRequest,
        mode: ResponseMode,
    ) -> Result<RequestBuilder, DifyError> {
        self.settings.validate()?;

        let files = request
            .files
            .iter()
            .map(|file| {
                validate_file_id(&file.id)?;
                Ok(FileReference {
                    file_type: "document",
                    transfer_method: "local_file",
                    upload_file_id: &file.id,
                    name: &file.name,
                })
            })
            .collect::<Result<Vec<_>, DifyError>>()?;

        let body = ChatMessagesBody {
            inputs: serde_json::Map::new(),
            query: &request.query,
            response_mode: mode.as_str(),
            conversation_id: request.conversation_id.as_deref(),
            user: &self.settings.user,
            files,
        };

        info!(
            "Sending chat turn: mode={}, files={}, conversation={:?}, key={}",
            mode.as_str(),
            body.files.len(),
            body.conversation_id,
            self.settings.api_key_prefix()
        );

        Ok(self
            .client
            .post(self.settings.endpoint("chat-messages"))
            .bearer_auth(&self.settings.api_key)
            .json(&body))
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<Response, DifyError> {
        if cancel.is_cancelled() {
            return Err(DifyError::Aborted);
        }
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DifyError::Aborted),
            result = builder.send() => result?,
        };
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response, DifyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!("Dify API returned {}: {}", status, body);
    if status == StatusCode::FORBIDDEN {
        return Err(DifyError::Auth { body });
    }
    Err(DifyError::Api {
        status: status.as_u16(),
        body,
    })
}

fn validate_file_id(id: &str) -> Result<(), DifyError> {
    let id = id.trim();
    if id.is_empty() || id == "undefined" || id == "null" {
        return Err(DifyError::UploadValidation(format!(
            "invalid file id: {id:?}"
        )));
    }
    Ok(())
}

/// Dify has shipped several spellings of the upload response keys.
fn resolve_uploaded_file(
    body: &Value,
    local_name: &str,
    local_size: u64,
) -> Result<UploadedFile, DifyError> {
    let id = first_string(body, &["id", "file_id", "upload_file_id"]).ok_or_else(|| {
        DifyError::UploadValidation("upload response carried no file id".to_string())
    })?;
    validate_file_id(&id)?;

    let name = first_string(body, &["name", "filename", "original_filename"])
        .unwrap_or_else(|| local_name.to_string());
    let size = ["size", "file_size"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_u64))
        .filter(|size| *size > 0)
        .unwrap_or(local_size);

    info!("Upload accepted: id={id}, name={name}, size={size}");
    Ok(UploadedFile { id, name, size })
}

fn first_string(body: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match body.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
