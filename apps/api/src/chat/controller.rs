//! Turn orchestration: the only code that mutates chat state.
//!
//! `ChatController` owns the `Workspace` behind one async mutex. A turn
//! runs in its own task and reports progress as `TurnEvent`s over an
//! unbounded channel, so no event is ever sent while waiting on the
//! consumer. Cancellation is checked before every state mutation; an
//! aborted turn leaves no AI message behind.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::messages;
use crate::config::ResponseMode;
use crate::dify::reconciler::Delta;
use crate::dify::stream::AnswerStream;
use crate::dify::{ChatRequest, DifyClient, DifyError};
use crate::models::{ChatSession, Message, UploadedFile, User};
use crate::sessions::persistence::SnapshotStore;
use crate::sessions::store::{SessionError, SessionStore};

/// Longest composer text accepted, in characters.
pub const MAX_INPUT_CHARS: usize = 2000;
const LINKEDIN_HOST: &str = "linkedin.com";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Sign in to start chatting")]
    LoginRequired,

    #[error("Type a message or attach a resume first")]
    NothingToSend,

    #[error("A reply is still in progress")]
    Busy,

    #[error("Only PDF resumes are supported: {0}")]
    UnsupportedFile(String),

    #[error("Not a LinkedIn profile URL: {0}")]
    InvalidLinkedinUrl(String),

    #[error("Session {0} has no remote conversation yet")]
    NoConversation(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Dify(#[from] DifyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    #[default]
    Idle,
    Sending,
    Streaming,
    BlockingWait,
}

/// What the user is asking about; picks the failure text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnKind {
    Text,
    File,
    Linkedin,
}

/// Progress of one turn, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    UserMessages {
        session_id: String,
        messages: Vec<Message>,
    },
    StreamStarted {
        message: Message,
    },
    Delta {
        message_id: String,
        delta: Delta,
    },
    /// `None` when the answer came back blank and nothing was stored.
    StreamEnded {
        message: Option<Message>,
    },
    AnswerReady {
        message: Option<Message>,
    },
    ErrorMessage {
        message: Message,
    },
    Aborted,
    Idle,
}

impl TurnEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::UserMessages { .. } => "user_messages",
            TurnEvent::StreamStarted { .. } => "stream_started",
            TurnEvent::Delta { .. } => "delta",
            TurnEvent::StreamEnded { .. } => "stream_ended",
            TurnEvent::AnswerReady { .. } => "answer_ready",
            TurnEvent::ErrorMessage { .. } => "error_message",
            TurnEvent::Aborted => "aborted",
            TurnEvent::Idle => "idle",
        }
    }
}

/// A running turn. Events end with `Idle`.
pub struct TurnHandle {
    pub session_id: String,
    pub events: mpsc::UnboundedReceiver<TurnEvent>,
    pub task: JoinHandle<()>,
}

#[derive(Debug, Serialize)]
pub struct ComposerState {
    pub phase: TurnPhase,
    pub signed_in: bool,
    pub staged_file: Option<UploadedFile>,
    pub staged_linkedin: Option<String>,
    pub can_send: bool,
    /// Content of the in-flight AI message while streaming.
    pub streaming_message: Option<Message>,
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub current_id: Option<String>,
    pub sessions: Vec<ChatSession>,
}

struct InFlight {
    turn: u64,
    session_id: String,
    cancel: CancellationToken,
    streaming: Option<Message>,
}

/// All mutable chat state for the signed-in user.
#[derive(Default)]
struct Workspace {
    user: Option<User>,
    sessions: SessionStore,
    staged_file: Option<UploadedFile>,
    staged_linkedin: Option<String>,
    phase: TurnPhase,
    in_flight: Option<InFlight>,
    turns_started: u64,
}

impl Workspace {
    fn ensure_idle(&self) -> Result<(), ChatError> {
        match self.phase {
            TurnPhase::Idle => Ok(()),
            _ => Err(ChatError::Busy),
        }
    }

    /// True while `turn` is still the in-flight turn and not cancelled.
    fn owns(&self, turn: u64) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|f| f.turn == turn && !f.cancel.is_cancelled())
    }

    fn reset_turn(&mut self) {
        self.phase = TurnPhase::Idle;
        self.in_flight = None;
        self.staged_file = None;
        self.staged_linkedin = None;
    }
}

/// Messages and query for one turn, built from composer input.
struct TurnPlan {
    kind: TurnKind,
    messages: Vec<Message>,
    query: String,
    files: Vec<UploadedFile>,
}

fn plan_turn(
    text: &str,
    file: Option<&UploadedFile>,
    linkedin: Option<&str>,
) -> Result<TurnPlan, ChatError> {
    let text: String = text.trim().chars().take(MAX_INPUT_CHARS).collect();

    if let Some(url) = linkedin {
        let content = if text.is_empty() {
            messages::LINKEDIN_DEFAULT_MESSAGE.to_string()
        } else {
            text
        };
        return Ok(TurnPlan {
            kind: TurnKind::Linkedin,
            query: format!("{content}\n\nLinkedIn Profile URL: {url}"),
            messages: vec![Message::user_linkedin(content, url)],
            files: vec![],
        });
    }

    let mut plan = TurnPlan {
        kind: TurnKind::Text,
        messages: Vec::new(),
        query: String::new(),
        files: Vec::new(),
    };
    if let Some(file) = file {
        plan.kind = TurnKind::File;
        plan.messages
            .push(Message::user_file(messages::FILE_MESSAGE, file.name.clone()));
        plan.query.push_str(messages::FILE_QUERY_PREFIX);
        plan.files.push(file.clone());
    }
    if !text.is_empty() {
        plan.query.push_str(&text);
        plan.messages.push(Message::user_text(text));
    } else if file.is_some() {
        plan.query.push_str(messages::FILE_ONLY_QUERY);
    }

    if plan.messages.is_empty() {
        return Err(ChatError::NothingToSend);
    }
    Ok(plan)
}

fn failure_text(error: &DifyError, kind: TurnKind) -> &'static str {
    if error.needs_config_fix() {
        return messages::API_CONFIG_ERROR;
    }
    match kind {
        TurnKind::File => messages::FILE_ANALYSIS_ERROR,
        TurnKind::Linkedin => messages::LINKEDIN_ANALYSIS_ERROR,
        TurnKind::Text => messages::GENERIC_ERROR,
    }
}

fn is_pdf(file_name: &str) -> bool {
    std::path::Path::new(file_name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// Everything a spawned turn needs besides the controller.
struct TurnContext {
    turn: u64,
    kind: TurnKind,
    session_id: String,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<TurnEvent>,
}

impl TurnContext {
    fn emit(&self, event: TurnEvent) {
        if self.events.send(event).is_err() {
            debug!("Turn {} has no listener; continuing in background", self.turn);
        }
    }
}

#[derive(Clone)]
pub struct ChatController {
    workspace: Arc<Mutex<Workspace>>,
    dify: DifyClient,
    snapshots: Arc<dyn SnapshotStore>,
}

impl ChatController {
    pub fn new(dify: DifyClient, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self {
            workspace: Arc::new(Mutex::new(Workspace::default())),
            dify,
            snapshots,
        }
    }

    // ── Auth hooks ───────────────────────────────────────────────────────────

    /// Adopts the signed-in user and their persisted sessions. In-memory
    /// sessions are kept (and persisted) when there is no snapshot yet.
    pub async fn on_signed_in(&self, user: User) {
        let loaded = match self.snapshots.load().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("Ignoring unreadable session snapshot: {e}");
                Vec::new()
            }
        };

        let mut ws = self.workspace.lock().await;
        info!("Chat workspace opened for {}", user.email);
        ws.user = Some(user);
        if !loaded.is_empty() {
            ws.sessions = SessionStore::from_sessions(loaded);
        } else {
            self.persist(&ws).await;
        }
    }

    /// Local logout: cancels any turn, drops all state, deletes the snapshot.
    pub async fn on_signed_out(&self) {
        let mut ws = self.workspace.lock().await;
        if let Some(in_flight) = &ws.in_flight {
            in_flight.cancel.cancel();
        }
        ws.reset_turn();
        ws.sessions.clear();
        ws.user = None;
        if let Err(e) = self.snapshots.delete().await {
            warn!("Failed to delete session snapshot: {e}");
        }
        info!("Chat workspace cleared");
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub async fn sessions(&self) -> SessionList {
        let ws = self.workspace.lock().await;
        SessionList {
            current_id: ws.sessions.current_id().map(str::to_string),
            sessions: ws.sessions.sessions().to_vec(),
        }
    }

    /// Starts a fresh session unless the current one is still empty.
    pub async fn new_chat(&self) -> ChatSession {
        let mut ws = self.workspace.lock().await;
        if let Some(current) = ws.sessions.current() {
            if current.messages.is_empty() {
                return current.clone();
            }
        }
        let session = ws.sessions.create_session().clone();
        self.persist(&ws).await;
        session
    }

    pub async fn select_session(&self, id: &str) -> Result<ChatSession, ChatError> {
        let mut ws = self.workspace.lock().await;
        Ok(ws.sessions.select_session(id)?.clone())
    }

    /// The session a turn is writing into cannot be deleted.
    pub async fn delete_session(&self, id: &str) -> Result<(), ChatError> {
        let mut ws = self.workspace.lock().await;
        if ws.in_flight.as_ref().is_some_and(|f| f.session_id == id) {
            return Err(ChatError::Busy);
        }
        ws.sessions.delete_session(id)?;
        info!("Deleted session {id}");
        self.persist(&ws).await;
        Ok(())
    }

    /// Remote message history of a session's conversation.
    pub async fn history(&self, id: &str) -> Result<Value, ChatError> {
        let conversation_id = {
            let ws = self.workspace.lock().await;
            let session = ws
                .sessions
                .get(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            session
                .conversation_id
                .clone()
                .ok_or_else(|| ChatError::NoConversation(id.to_string()))?
        };
        Ok(self.dify.conversation_messages(&conversation_id).await?)
    }

    // ── Composer ─────────────────────────────────────────────────────────────

    pub async fn composer(&self) -> ComposerState {
        let ws = self.workspace.lock().await;
        ComposerState {
            phase: ws.phase,
            signed_in: ws.user.is_some(),
            staged_file: ws.staged_file.clone(),
            staged_linkedin: ws.staged_linkedin.clone(),
            can_send: ws.user.is_some() && ws.phase == TurnPhase::Idle,
            streaming_message: ws.in_flight.as_ref().and_then(|f| f.streaming.clone()),
        }
    }

    /// Uploads a résumé and stages it for the next turn. Replaces any
    /// staged LinkedIn URL; a failed upload stages nothing.
    pub async fn stage_file(&self, file_name: &str, content: Bytes) -> Result<UploadedFile, ChatError> {
        {
            let ws = self.workspace.lock().await;
            if ws.user.is_none() {
                return Err(ChatError::LoginRequired);
            }
            ws.ensure_idle()?;
        }
        if !is_pdf(file_name) {
            return Err(ChatError::UnsupportedFile(file_name.to_string()));
        }

        let uploaded = self
            .dify
            .upload_file(file_name, content, &CancellationToken::new())
            .await?;

        let mut ws = self.workspace.lock().await;
        if ws.user.is_none() {
            return Err(ChatError::LoginRequired);
        }
        // A turn may have started while the upload was in flight.
        ws.ensure_idle()?;
        ws.staged_file = Some(uploaded.clone());
        ws.staged_linkedin = None;
        Ok(uploaded)
    }

    pub async fn unstage_file(&self) {
        self.workspace.lock().await.staged_file = None;
    }

    /// Stages a LinkedIn profile URL for the next turn, replacing any file.
    pub async fn stage_linkedin(&self, url: &str) -> Result<String, ChatError> {
        let url = url.trim();
        if !url.contains(LINKEDIN_HOST) {
            return Err(ChatError::InvalidLinkedinUrl(url.to_string()));
        }
        let mut ws = self.workspace.lock().await;
        if ws.user.is_none() {
            return Err(ChatError::LoginRequired);
        }
        ws.ensure_idle()?;
        ws.staged_linkedin = Some(url.to_string());
        ws.staged_file = None;
        Ok(url.to_string())
    }

    pub async fn unstage_linkedin(&self) {
        self.workspace.lock().await.staged_linkedin = None;
    }

    // ── Turns ────────────────────────────────────────────────────────────────

    /// Starts a turn. User messages are stored and persisted before the
    /// remote call; the rest of the turn runs in a spawned task.
    pub async fn send(&self, text: &str) -> Result<TurnHandle, ChatError> {
        let mut ws = self.workspace.lock().await;
        if ws.user.is_none() {
            return Err(ChatError::LoginRequired);
        }
        ws.ensure_idle()?;

        let plan = plan_turn(text, ws.staged_file.as_ref(), ws.staged_linkedin.as_deref())?;
        let session_id = ws.sessions.ensure_current();
        let conversation_id = ws
            .sessions
            .append_messages(&session_id, plan.messages.clone())?
            .conversation_id
            .clone();
        self.persist(&ws).await;

        ws.turns_started += 1;
        let turn = ws.turns_started;
        let cancel = CancellationToken::new();
        ws.phase = TurnPhase::Sending;
        ws.in_flight = Some(InFlight {
            turn,
            session_id: session_id.clone(),
            cancel: cancel.clone(),
            streaming: None,
        });
        drop(ws);

        info!(
            "Turn {turn} started in session {session_id} ({:?}, conversation={:?})",
            plan.kind, conversation_id
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = TurnContext {
            turn,
            kind: plan.kind,
            session_id: session_id.clone(),
            cancel,
            events: tx,
        };
        ctx.emit(TurnEvent::UserMessages {
            session_id: session_id.clone(),
            messages: plan.messages,
        });

        let request = ChatRequest {
            query: plan.query,
            conversation_id,
            files: plan.files,
        };
        let controller = self.clone();
        let task = tokio::spawn(async move { controller.run_turn(ctx, request).await });

        Ok(TurnHandle {
            session_id,
            events: rx,
            task,
        })
    }

    /// Cancels the in-flight turn and returns to idle at once. Returns
    /// whether there was anything to cancel.
    pub async fn abort(&self) -> bool {
        let mut ws = self.workspace.lock().await;
        let Some(in_flight) = &ws.in_flight else {
            return false;
        };
        info!("Aborting turn {}", in_flight.turn);
        in_flight.cancel.cancel();
        ws.reset_turn();
        true
    }

    async fn run_turn(self, ctx: TurnContext, request: ChatRequest) {
        let result = match self.dify.settings().response_mode {
            ResponseMode::Streaming => self.stream_turn(&ctx, &request).await,
            ResponseMode::Blocking => self.blocking_turn(&ctx, &request).await,
        };

        let mut ws = self.workspace.lock().await;
        if !ws.owns(ctx.turn) {
            // Aborted or superseded: no error message, no persistence.
            info!("Turn {} aborted", ctx.turn);
            ctx.emit(TurnEvent::Aborted);
            ctx.emit(TurnEvent::Idle);
            return;
        }

        match result {
            Ok(()) => info!("Turn {} completed", ctx.turn),
            Err(e) if e.is_aborted() => {
                info!("Turn {} aborted", ctx.turn);
                ctx.emit(TurnEvent::Aborted);
            }
            Err(e) => {
                warn!("Turn {} failed: {e}", ctx.turn);
                let message = Message::ai_text(failure_text(&e, ctx.kind));
                match ws.sessions.append_messages(&ctx.session_id, vec![message.clone()]) {
                    Ok(_) => self.persist(&ws).await,
                    Err(e) => warn!("Could not record failure message: {e}"),
                }
                ctx.emit(TurnEvent::ErrorMessage { message });
            }
        }
        ws.reset_turn();
        ctx.emit(TurnEvent::Idle);
    }

    async fn stream_turn(&self, ctx: &TurnContext, request: &ChatRequest) -> Result<(), DifyError> {
        let body = self.dify.chat_stream(request, &ctx.cancel).await?;

        let placeholder = Message::streaming_placeholder();
        {
            let mut ws = self.workspace.lock().await;
            if !ws.owns(ctx.turn) {
                return Err(DifyError::Aborted);
            }
            ws.phase = TurnPhase::Streaming;
            if let Some(in_flight) = ws.in_flight.as_mut() {
                in_flight.streaming = Some(placeholder.clone());
            }
        }
        ctx.emit(TurnEvent::StreamStarted {
            message: placeholder.clone(),
        });

        let mut stream = AnswerStream::new(body, ctx.cancel.clone());
        while let Some(delta) = stream.next_delta().await? {
            let mut ws = self.workspace.lock().await;
            if !ws.owns(ctx.turn) {
                return Err(DifyError::Aborted);
            }
            if let Some(streaming) = ws.in_flight.as_mut().and_then(|f| f.streaming.as_mut()) {
                delta.apply_to(&mut streaming.content);
            }
            // Emitted under the lock so an abort cannot slip in between.
            ctx.emit(TurnEvent::Delta {
                message_id: placeholder.id.clone(),
                delta,
            });
        }

        let outcome = stream.finish();
        let mut ws = self.workspace.lock().await;
        if !ws.owns(ctx.turn) {
            return Err(DifyError::Aborted);
        }
        let message = self
            .record_answer(&mut ws, &ctx.session_id, outcome.answer, outcome.conversation_id.as_deref())
            .await;
        if let Some(in_flight) = ws.in_flight.as_mut() {
            in_flight.streaming = None;
        }
        ctx.emit(TurnEvent::StreamEnded { message });
        Ok(())
    }

    async fn blocking_turn(&self, ctx: &TurnContext, request: &ChatRequest) -> Result<(), DifyError> {
        {
            let mut ws = self.workspace.lock().await;
            if !ws.owns(ctx.turn) {
                return Err(DifyError::Aborted);
            }
            ws.phase = TurnPhase::BlockingWait;
        }

        let completion = self.dify.chat_blocking(request, &ctx.cancel).await?;

        let mut ws = self.workspace.lock().await;
        if !ws.owns(ctx.turn) {
            return Err(DifyError::Aborted);
        }
        let message = self
            .record_answer(&mut ws, &ctx.session_id, completion.answer, completion.conversation_id.as_deref())
            .await;
        ctx.emit(TurnEvent::AnswerReady { message });
        Ok(())
    }

    /// Binds the conversation id and stores the finalised AI message.
    /// Blank answers are not stored.
    async fn record_answer(
        &self,
        ws: &mut Workspace,
        session_id: &str,
        answer: String,
        conversation_id: Option<&str>,
    ) -> Option<Message> {
        if let Some(conversation_id) = conversation_id {
            match ws.sessions.bind_conversation(session_id, conversation_id) {
                Ok(true) => info!("Session {session_id} bound to conversation {conversation_id}"),
                Ok(false) => {}
                Err(e) => warn!("Could not bind conversation: {e}"),
            }
        }

        let message = if answer.trim().is_empty() {
            warn!("Answer for session {session_id} was blank; not stored");
            None
        } else {
            let message = Message::ai_text(answer);
            match ws.sessions.append_messages(session_id, vec![message.clone()]) {
                Ok(_) => Some(message),
                Err(e) => {
                    warn!("Could not store answer: {e}");
                    None
                }
            }
        };
        self.persist(ws).await;
        message
    }

    /// Full snapshot write; skipped for guests.
    async fn persist(&self, ws: &Workspace) {
        if ws.user.is_none() {
            return;
        }
        if let Err(e) = self.snapshots.save(ws.sessions.sessions()).await {
            warn!("Failed to persist sessions: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::fake::test_user;
    use crate::config::test_dify_settings;
    use crate::models::{MessageKind, Sender};
    use crate::sessions::persistence::JsonSnapshotStore;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        controller: ChatController,
        snapshots: Arc<JsonSnapshotStore>,
        _dir: tempfile::TempDir,
    }

    async fn harness(server: &MockServer, mode: ResponseMode) -> Harness {
        harness_at(&server.uri(), mode).await
    }

    async fn harness_at(base_url: &str, mode: ResponseMode) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = Arc::new(JsonSnapshotStore::new(dir.path()));
        let mut settings = test_dify_settings(base_url);
        settings.response_mode = mode;
        let controller = ChatController::new(DifyClient::new(settings).unwrap(), snapshots.clone());
        controller.on_signed_in(test_user()).await;
        Harness {
            controller,
            snapshots,
            _dir: dir,
        }
    }

    fn sse(frames: &[&str]) -> ResponseTemplate {
        let body: String = frames.iter().map(|f| format!("data: {f}\n\n")).collect();
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
    }

    async fn collect(mut handle: TurnHandle) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        handle.task.await.unwrap();
        events
    }

    #[test]
    fn test_plan_file_only_turn() {
        let file = UploadedFile {
            id: "f-1".into(),
            name: "cv.pdf".into(),
            size: 10,
        };
        let plan = plan_turn("   ", Some(&file), None).unwrap();
        assert_eq!(plan.kind, TurnKind::File);
        assert_eq!(
            plan.query,
            "I have attached my resume for analysis. Please analyze my resume and provide feedback."
        );
        assert_eq!(plan.messages.len(), 1);
        assert_eq!(plan.messages[0].kind, MessageKind::File);
        assert_eq!(plan.files, vec![file]);
    }

    #[test]
    fn test_plan_linkedin_turn_uses_default_text() {
        let plan = plan_turn("", None, Some("https://www.linkedin.com/in/ada")).unwrap();
        assert_eq!(plan.kind, TurnKind::Linkedin);
        assert_eq!(
            plan.query,
            "Please analyze my LinkedIn profile\n\nLinkedIn Profile URL: https://www.linkedin.com/in/ada"
        );
        assert_eq!(
            plan.messages[0].linkedin_url.as_deref(),
            Some("https://www.linkedin.com/in/ada")
        );
    }

    #[test]
    fn test_plan_caps_text_and_rejects_empty() {
        let long = "é".repeat(MAX_INPUT_CHARS + 10);
        let plan = plan_turn(&long, None, None).unwrap();
        assert_eq!(plan.query.chars().count(), MAX_INPUT_CHARS);
        assert!(matches!(plan_turn("  \n", None, None), Err(ChatError::NothingToSend)));
    }

    #[test]
    fn test_failure_text_prefers_config_remediation() {
        let forbidden = DifyError::Auth { body: "{}".into() };
        assert_eq!(failure_text(&forbidden, TurnKind::File), messages::API_CONFIG_ERROR);
        let api = DifyError::Api {
            status: 500,
            body: String::new(),
        };
        assert_eq!(failure_text(&api, TurnKind::File), messages::FILE_ANALYSIS_ERROR);
        assert_eq!(failure_text(&api, TurnKind::Linkedin), messages::LINKEDIN_ANALYSIS_ERROR);
        assert_eq!(failure_text(&api, TurnKind::Text), messages::GENERIC_ERROR);
    }

    #[tokio::test]
    async fn test_hello_turn_streams_and_persists_final_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .and(body_partial_json(json!({"query": "Hello", "response_mode": "streaming"})))
            .respond_with(sse(&[
                r#"{"event":"message","answer":"Hi","conversation_id":"conv-1"}"#,
                r#"{"event":"message","answer":"Hi there"}"#,
                "[DONE]",
            ]))
            .expect(1)
            .mount(&server)
            .await;
        let h = harness(&server, ResponseMode::Streaming).await;

        let handle = h.controller.send("Hello").await.unwrap();
        let session_id = handle.session_id.clone();
        let events = collect(handle).await;

        assert!(matches!(events[0], TurnEvent::UserMessages { .. }));
        assert!(matches!(events[1], TurnEvent::StreamStarted { .. }));
        let mut streamed = String::new();
        for event in &events {
            if let TurnEvent::Delta { delta, .. } = event {
                delta.apply_to(&mut streamed);
            }
        }
        assert_eq!(streamed, "Hi there");
        assert_eq!(events.last(), Some(&TurnEvent::Idle));

        let saved = h.snapshots.load().await.unwrap();
        let session = saved.iter().find(|s| s.id == session_id).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].content, "Hello");
        assert_eq!(session.messages[1].sender, Sender::Ai);
        assert_eq!(session.messages[1].content, "Hi there");
        assert!(!session.messages[1].id.starts_with("streaming-"));
        assert_eq!(session.last_message, "Hi there...");
        assert_eq!(session.conversation_id.as_deref(), Some("conv-1"));

        let composer = h.controller.composer().await;
        assert_eq!(composer.phase, TurnPhase::Idle);
        assert!(composer.can_send);
        assert!(composer.streaming_message.is_none());
    }

    #[tokio::test]
    async fn test_second_turn_reuses_bound_conversation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .and(body_partial_json(json!({"conversation_id": "conv-1"})))
            .respond_with(sse(&[r#"{"event":"message","answer":"Again"}"#, "[DONE]"]))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .respond_with(sse(&[
                r#"{"event":"message","answer":"First","conversation_id":"conv-1"}"#,
                "[DONE]",
            ]))
            .mount(&server)
            .await;
        let h = harness(&server, ResponseMode::Streaming).await;

        collect(h.controller.send("one").await.unwrap()).await;
        collect(h.controller.send("two").await.unwrap()).await;

        let list = h.controller.sessions().await;
        assert_eq!(list.sessions.len(), 1);
        assert_eq!(list.sessions[0].messages.len(), 4);
        assert_eq!(list.sessions[0].messages[3].content, "Again");
    }

    #[tokio::test]
    async fn test_forbidden_appends_single_remediation_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .respond_with(ResponseTemplate::new(403).set_body_string("{\"code\":\"unauthorized\"}"))
            .expect(1)
            .mount(&server)
            .await;
        let h = harness(&server, ResponseMode::Streaming).await;

        let events = collect(h.controller.send("Hello").await.unwrap()).await;
        let errors: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::ErrorMessage { .. }))
            .collect();
        assert_eq!(errors.len(), 1);

        let list = h.controller.sessions().await;
        let messages = &list.sessions[0].messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, messages::API_CONFIG_ERROR);
        assert_eq!(h.controller.composer().await.phase, TurnPhase::Idle);
    }

    #[tokio::test]
    async fn test_blocking_mode_records_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .and(body_partial_json(json!({"response_mode": "blocking"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"answer": "Blocking hi", "conversation_id": "conv-9", "message_id": "m-1"}),
            ))
            .mount(&server)
            .await;
        let h = harness(&server, ResponseMode::Blocking).await;

        let events = collect(h.controller.send("Hello").await.unwrap()).await;
        assert!(events.iter().any(|e| matches!(
            e,
            TurnEvent::AnswerReady { message: Some(m) } if m.content == "Blocking hi"
        )));
        let list = h.controller.sessions().await;
        assert_eq!(list.sessions[0].conversation_id.as_deref(), Some("conv-9"));
    }

    #[tokio::test]
    async fn test_abort_leaves_no_answer_and_returns_to_idle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .respond_with(
                sse(&[r#"{"event":"message","answer":"late"}"#, "[DONE]"])
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;
        let h = harness(&server, ResponseMode::Streaming).await;

        let handle = h.controller.send("Hello").await.unwrap();
        assert_eq!(h.controller.composer().await.phase, TurnPhase::Sending);
        assert!(h.controller.abort().await);
        assert_eq!(h.controller.composer().await.phase, TurnPhase::Idle);

        let events = collect(handle).await;
        assert!(events.contains(&TurnEvent::Aborted));
        assert!(!events
            .iter()
            .any(|e| matches!(e, TurnEvent::StreamEnded { .. } | TurnEvent::ErrorMessage { .. })));

        let saved = h.snapshots.load().await.unwrap();
        assert_eq!(saved[0].messages.len(), 1);
        assert!(!h.controller.abort().await);
    }

    /// Serves one SSE frame and then holds the connection open.
    async fn stalling_sse_server(frame: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();
            socket
                .write_all(format!("data: {frame}\n\n").as_bytes())
                .await
                .unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_abort_mid_stream_stops_deltas_and_stores_nothing() {
        let base_url =
            stalling_sse_server(r#"{"event":"message","answer":"Hel","conversation_id":"c-1"}"#).await;
        let h = harness_at(&base_url, ResponseMode::Streaming).await;

        let mut handle = h.controller.send("Hello").await.unwrap();
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            let is_delta = matches!(event, TurnEvent::Delta { .. });
            events.push(event);
            if is_delta {
                break;
            }
        }
        let composer = h.controller.composer().await;
        assert_eq!(composer.phase, TurnPhase::Streaming);
        assert_eq!(composer.streaming_message.unwrap().content, "Hel");

        assert!(h.controller.abort().await);
        events.extend(collect(handle).await);
        let names: Vec<&str> = events.iter().map(TurnEvent::name).collect();
        assert_eq!(
            names,
            ["user_messages", "stream_started", "delta", "aborted", "idle"]
        );

        let composer = h.controller.composer().await;
        assert_eq!(composer.phase, TurnPhase::Idle);
        assert!(composer.streaming_message.is_none());
        let saved = h.snapshots.load().await.unwrap();
        assert_eq!(saved[0].messages.len(), 1);
        assert!(saved[0].conversation_id.is_none());
    }

    #[tokio::test]
    async fn test_upload_finishing_during_turn_is_not_staged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files/upload"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"id": "file-1", "name": "cv.pdf", "size": 8}))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .respond_with(
                sse(&[r#"{"event":"message","answer":"ok"}"#, "[DONE]"])
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;
        let h = harness(&server, ResponseMode::Streaming).await;

        let stager = h.controller.clone();
        let upload = tokio::spawn(async move {
            stager
                .stage_file("cv.pdf", Bytes::from_static(b"%PDF-1.4"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let handle = h.controller.send("Hello").await.unwrap();

        assert!(matches!(upload.await.unwrap(), Err(ChatError::Busy)));
        collect(handle).await;
        assert!(h.controller.composer().await.staged_file.is_none());
    }

    #[tokio::test]
    async fn test_busy_turn_rejects_second_send() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .respond_with(sse(&["[DONE]"]).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;
        let h = harness(&server, ResponseMode::Streaming).await;

        let handle = h.controller.send("one").await.unwrap();
        assert!(matches!(h.controller.send("two").await, Err(ChatError::Busy)));
        let events = collect(handle).await;
        // Blank answer: nothing stored, still ends idle.
        assert!(events.contains(&TurnEvent::StreamEnded { message: None }));
        assert_eq!(events.last(), Some(&TurnEvent::Idle));
    }

    #[tokio::test]
    async fn test_guest_cannot_send_or_stage() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let controller = ChatController::new(
            DifyClient::new(test_dify_settings(&server.uri())).unwrap(),
            Arc::new(JsonSnapshotStore::new(dir.path())),
        );
        assert!(matches!(controller.send("Hello").await, Err(ChatError::LoginRequired)));
        assert!(matches!(
            controller.stage_file("cv.pdf", Bytes::from_static(b"%PDF")).await,
            Err(ChatError::LoginRequired)
        ));
        assert!(!controller.composer().await.can_send);

        // Guest sessions stay in memory only.
        controller.new_chat().await;
        assert!(!dir.path().join(crate::sessions::persistence::SESSIONS_KEY).exists());
    }

    #[tokio::test]
    async fn test_upload_with_undefined_id_stages_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "undefined"})))
            .mount(&server)
            .await;
        let h = harness(&server, ResponseMode::Streaming).await;

        let err = h
            .controller
            .stage_file("cv.pdf", Bytes::from_static(b"%PDF-1.4"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Dify(DifyError::UploadValidation(_))));
        assert!(h.controller.composer().await.staged_file.is_none());
    }

    #[tokio::test]
    async fn test_file_turn_sends_upload_reference_and_clears_staging() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files/upload"))
            .respond_with(ResponseTemplate::new(201).set_body_json(
                json!({"id": "file-1", "name": "cv.pdf", "size": 8}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .and(body_partial_json(json!({"files": [{"upload_file_id": "file-1"}]})))
            .respond_with(sse(&[r#"{"event":"message","answer":"Nice resume"}"#, "[DONE]"]))
            .expect(1)
            .mount(&server)
            .await;
        let h = harness(&server, ResponseMode::Streaming).await;

        assert!(matches!(
            h.controller.stage_file("notes.txt", Bytes::new()).await,
            Err(ChatError::UnsupportedFile(_))
        ));
        h.controller
            .stage_file("cv.pdf", Bytes::from_static(b"%PDF-1.4"))
            .await
            .unwrap();
        collect(h.controller.send("").await.unwrap()).await;

        let list = h.controller.sessions().await;
        assert_eq!(list.sessions[0].title, "Resume: cv.pdf");
        assert!(h.controller.composer().await.staged_file.is_none());
    }

    #[tokio::test]
    async fn test_linkedin_staging_validates_and_replaces_file() {
        let server = MockServer::start().await;
        let h = harness(&server, ResponseMode::Streaming).await;

        assert!(matches!(
            h.controller.stage_linkedin("https://example.com/me").await,
            Err(ChatError::InvalidLinkedinUrl(_))
        ));
        h.controller
            .stage_linkedin(" https://www.linkedin.com/in/ada ")
            .await
            .unwrap();
        let composer = h.controller.composer().await;
        assert_eq!(
            composer.staged_linkedin.as_deref(),
            Some("https://www.linkedin.com/in/ada")
        );
        h.controller.unstage_linkedin().await;
        assert!(h.controller.composer().await.staged_linkedin.is_none());
    }

    #[tokio::test]
    async fn test_new_chat_is_noop_for_empty_session() {
        let server = MockServer::start().await;
        let h = harness(&server, ResponseMode::Streaming).await;
        let first = h.controller.new_chat().await;
        let again = h.controller.new_chat().await;
        assert_eq!(first.id, again.id);
        assert_eq!(h.controller.sessions().await.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_sign_out_deletes_snapshot_and_clears_state() {
        let server = MockServer::start().await;
        let h = harness(&server, ResponseMode::Streaming).await;
        h.controller.new_chat().await;
        assert!(h.snapshots.path().exists());

        h.controller.on_signed_out().await;
        assert!(!h.snapshots.path().exists());
        assert!(h.controller.sessions().await.sessions.is_empty());
        assert!(!h.controller.composer().await.signed_in);
    }

    #[tokio::test]
    async fn test_history_requires_bound_conversation() {
        let server = MockServer::start().await;
        let h = harness(&server, ResponseMode::Streaming).await;
        let session = h.controller.new_chat().await;
        assert!(matches!(
            h.controller.history(&session.id).await,
            Err(ChatError::NoConversation(_))
        ));
        assert!(matches!(
            h.controller.history("missing").await,
            Err(ChatError::Session(SessionError::NotFound(_)))
        ));
    }
}
