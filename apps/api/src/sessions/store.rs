use thiserror::Error;

use crate::models::chat::DEFAULT_SESSION_TITLE;
use crate::models::{ChatSession, Message};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session {0} not found")]
    NotFound(String),
}

/// Ordered session collection (newest first) plus the current selection.
/// Pure in-memory state; persistence is the caller's job.
#[derive(Debug, Default, Clone)]
pub struct SessionStore {
    sessions: Vec<ChatSession>,
    current: Option<String>,
}

impl SessionStore {
    pub fn from_sessions(sessions: Vec<ChatSession>) -> Self {
        SessionStore {
            sessions,
            current: None,
        }
    }

    pub fn sessions(&self) -> &[ChatSession] {
        &self.sessions
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current(&self) -> Option<&ChatSession> {
        self.current.as_deref().and_then(|id| self.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// Creates an empty session at the top of the list and selects it.
    pub fn create_session(&mut self) -> &ChatSession {
        let session = ChatSession::new();
        self.current = Some(session.id.clone());
        self.sessions.insert(0, session);
        &self.sessions[0]
    }

    pub fn select_session(&mut self, id: &str) -> Result<&ChatSession, SessionError> {
        let index = self.index_of(id)?;
        self.current = Some(id.to_string());
        Ok(&self.sessions[index])
    }

    /// Current session id, creating and selecting a session if none is.
    pub fn ensure_current(&mut self) -> String {
        if let Some(id) = self.current().map(|s| s.id.clone()) {
            return id;
        }
        self.create_session().id.clone()
    }

    /// Appends messages in order, refreshes the preview and timestamp, and
    /// derives the title if this batch opened the session.
    pub fn append_messages(
        &mut self,
        id: &str,
        messages: Vec<Message>,
    ) -> Result<&ChatSession, SessionError> {
        let index = self.index_of(id)?;
        if let Some(last) = messages.last() {
            let session = &mut self.sessions[index];
            session.last_message = last.last_message_preview();
            session.timestamp = last.timestamp;
            session.messages.extend(messages);
            self.rename_from_first_message(id)?;
        }
        Ok(&self.sessions[index])
    }

    /// Sets the title from the first message, once. Returns whether the
    /// title changed.
    pub fn rename_from_first_message(&mut self, id: &str) -> Result<bool, SessionError> {
        let index = self.index_of(id)?;
        let session = &mut self.sessions[index];
        if session.title != DEFAULT_SESSION_TITLE {
            return Ok(false);
        }
        match session.messages.first() {
            Some(first) => {
                session.title = first.derived_title();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Binds the remote conversation id the first time one is returned.
    pub fn bind_conversation(
        &mut self,
        id: &str,
        conversation_id: &str,
    ) -> Result<bool, SessionError> {
        let index = self.index_of(id)?;
        let session = &mut self.sessions[index];
        if session.conversation_id.is_some() || conversation_id.is_empty() {
            return Ok(false);
        }
        session.conversation_id = Some(conversation_id.to_string());
        Ok(true)
    }

    pub fn delete_session(&mut self, id: &str) -> Result<ChatSession, SessionError> {
        let index = self.index_of(id)?;
        if self.current.as_deref() == Some(id) {
            self.current = None;
        }
        Ok(self.sessions.remove(index))
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
        self.current = None;
    }

    fn index_of(&self, id: &str) -> Result<usize, SessionError> {
        self.sessions
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }
}
