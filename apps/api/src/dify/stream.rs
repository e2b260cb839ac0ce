use std::collections::VecDeque;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dify::events::DifyEvent;
use crate::dify::reconciler::{Delta, Reconciler};
use crate::dify::sse::EventStream;
use crate::dify::{ByteStream, DifyError};

/// Terminal result of a stream that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    /// Authoritative full answer text.
    pub answer: String,
    pub conversation_id: Option<String>,
}

/// Pumps SSE frames through the event model and the reconciler, handing
/// out one delta at a time.
pub struct AnswerStream {
    events: EventStream,
    reconciler: Reconciler,
    queued: VecDeque<Delta>,
    cancel: CancellationToken,
}

impl AnswerStream {
    pub fn new(body: ByteStream, cancel: CancellationToken) -> Self {
        Self {
            events: EventStream::new(body, cancel.clone()),
            reconciler: Reconciler::new(),
            queued: VecDeque::new(),
            cancel,
        }
    }

    /// Next delta, or `Ok(None)` once the stream has ended.
    pub async fn next_delta(&mut self) -> Result<Option<Delta>, DifyError> {
        loop {
            if self.cancel.is_cancelled() {
                self.queued.clear();
                return Err(DifyError::Aborted);
            }
            if let Some(delta) = self.queued.pop_front() {
                return Ok(Some(delta));
            }
            let Some(frame) = self.events.next_frame().await? else {
                return Ok(None);
            };
            let event = DifyEvent::decode(&frame);
            debug!("Stream event: {}", frame.event);
            if let Some(candidate) = event.candidate_text() {
                self.queued.extend(self.reconciler.apply(candidate));
            }
        }
    }

    /// Consumes the stream once `next_delta` has returned `None`.
    pub fn finish(self) -> StreamOutcome {
        StreamOutcome {
            conversation_id: self.events.conversation_id().map(str::to_string),
            answer: self.reconciler.into_answer(),
        }
    }
}
