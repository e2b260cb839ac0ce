use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Title every session starts with until its first message arrives.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";
pub const DEFAULT_LAST_MESSAGE: &str = "Starting conversation...";
pub const LINKEDIN_SESSION_TITLE: &str = "LinkedIn Profile Analysis";

const TITLE_PREVIEW_CHARS: usize = 30;
const LAST_MESSAGE_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    File,
    Linkedin,
}

/// One chat message. Field names match the browser's persisted format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linkedin_url: Option<String>,
}

impl Message {
    pub fn user_text(content: impl Into<String>) -> Self {
        Self::new(Sender::User, MessageKind::Text, content)
    }

    pub fn user_file(content: impl Into<String>, file_name: impl Into<String>) -> Self {
        Message {
            file_name: Some(file_name.into()),
            ..Self::new(Sender::User, MessageKind::File, content)
        }
    }

    pub fn user_linkedin(content: impl Into<String>, url: impl Into<String>) -> Self {
        Message {
            linkedin_url: Some(url.into()),
            ..Self::new(Sender::User, MessageKind::Linkedin, content)
        }
    }

    pub fn ai_text(content: impl Into<String>) -> Self {
        Self::new(Sender::Ai, MessageKind::Text, content)
    }

    /// The in-flight AI message: empty content under a synthetic id.
    pub fn streaming_placeholder() -> Self {
        Message {
            id: format!("streaming-{}", Utc::now().timestamp_millis()),
            ..Self::ai_text("")
        }
    }

    fn new(sender: Sender, kind: MessageKind, content: impl Into<String>) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            sender,
            timestamp: Utc::now(),
            kind,
            file_name: None,
            linkedin_url: None,
        }
    }

    /// Session title derived from this message when it opens a session.
    pub fn derived_title(&self) -> String {
        match self.kind {
            MessageKind::File => {
                format!("Resume: {}", self.file_name.as_deref().unwrap_or_default())
            }
            MessageKind::Linkedin => LINKEDIN_SESSION_TITLE.to_string(),
            MessageKind::Text => format!("{}...", preview(&self.content, TITLE_PREVIEW_CHARS)),
        }
    }

    pub fn last_message_preview(&self) -> String {
        format!("{}...", preview(&self.content, LAST_MESSAGE_PREVIEW_CHARS))
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub last_message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Remote conversation identity, bound after the first exchange.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl ChatSession {
    pub fn new() -> Self {
        ChatSession {
            id: Uuid::new_v4().to_string(),
            title: DEFAULT_SESSION_TITLE.to_string(),
            last_message: DEFAULT_LAST_MESSAGE.to_string(),
            timestamp: Utc::now(),
            messages: Vec::new(),
            conversation_id: None,
        }
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a file already uploaded to Dify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    pub name: String,
    pub size: u64,
}
