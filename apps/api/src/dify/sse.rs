//! SSE decoder: turns the Dify response body into parsed `data:` frames.
//!
//! The decoder is lazy: it performs one body read per pull, and only when no
//! already-parsed frame is waiting. Cancellation is checked before and after
//! every read. The body is dropped as soon as the stream finishes, fails or
//! is aborted.
//!
//! Lossy edge: a `[DONE]` sentinel ends decoding immediately, discarding any
//! frames after it in the same chunk and any partial line still buffered.

use std::collections::VecDeque;

use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dify::{ByteStream, DifyError};

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";
const DEFAULT_EVENT: &str = "message";

/// One decoded frame: the event name plus the whole JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: Value,
}

/// Result of interpreting a single complete line.
#[derive(Debug, PartialEq)]
enum LineOutcome {
    Frame(SseFrame),
    Done,
    Malformed,
    Ignored,
}

/// Byte buffer that yields complete lines and holds back the trailing
/// partial one. Lines are split on raw `\n` bytes before UTF-8 decoding so
/// a multi-byte character split across reads is reassembled intact.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
    /// Bytes of `pending` already known to hold no `\n`.
    scanned: usize,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.pending[from..].iter().position(|&b| b == b'\n') {
            let end = from + offset;
            lines.push(String::from_utf8_lossy(&self.pending[start..end]).into_owned());
            start = end + 1;
            from = start;
        }
        self.pending.drain(..start);
        self.scanned = self.pending.len();
        lines
    }

    fn take_remainder(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

fn parse_line(line: &str) -> LineOutcome {
    let line = line.trim();
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return LineOutcome::Ignored;
    };
    if payload == DONE_SENTINEL {
        return LineOutcome::Done;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(data) if data.is_object() => {
            let event = data
                .get("event")
                .and_then(Value::as_str)
                .filter(|e| !e.is_empty())
                .unwrap_or(DEFAULT_EVENT)
                .to_string();
            LineOutcome::Frame(SseFrame { event, data })
        }
        Ok(_) => {
            warn!("Dropping non-object SSE payload: {payload}");
            LineOutcome::Malformed
        }
        Err(e) => {
            warn!("Dropping malformed SSE frame ({e}): {payload}");
            LineOutcome::Malformed
        }
    }
}

/// Pull-based frame stream over a Dify response body.
pub struct EventStream {
    body: Option<ByteStream>,
    lines: LineBuffer,
    ready: VecDeque<SseFrame>,
    cancel: CancellationToken,
    finished: bool,
    chunks_read: usize,
    malformed_frames: usize,
    conversation_id: Option<String>,
}

impl EventStream {
    pub fn new(body: ByteStream, cancel: CancellationToken) -> Self {
        Self {
            body: Some(body),
            lines: LineBuffer::default(),
            ready: VecDeque::new(),
            cancel,
            finished: false,
            chunks_read: 0,
            malformed_frames: 0,
            conversation_id: None,
        }
    }

    /// Next frame in delivery order; `Ok(None)` once the stream is done.
    pub async fn next_frame(&mut self) -> Result<Option<SseFrame>, DifyError> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            if self.finished {
                return Ok(None);
            }
            if self.cancel.is_cancelled() {
                return Err(self.abort());
            }

            let Some(body) = self.body.as_mut() else {
                self.finished = true;
                return Ok(None);
            };
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                chunk = body.next() => Some(chunk),
            };
            if self.cancel.is_cancelled() {
                return Err(self.abort());
            }

            match read {
                None => return Err(self.abort()),
                Some(None) => {
                    debug!("SSE body closed after {} chunks", self.chunks_read);
                    if let Some(rest) = self.lines.take_remainder() {
                        self.accept_line(&rest);
                    }
                    self.finish();
                }
                Some(Some(Err(e))) => {
                    self.finish();
                    return Err(e);
                }
                Some(Some(Ok(chunk))) => {
                    self.chunks_read += 1;
                    for line in self.lines.push(&chunk) {
                        if !self.accept_line(&line) {
                            debug!("SSE [DONE] after {} chunks", self.chunks_read);
                            self.finish();
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Most recent `conversation_id` carried by any frame so far.
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn malformed_frames(&self) -> usize {
        self.malformed_frames
    }

    pub fn is_released(&self) -> bool {
        self.body.is_none()
    }

    /// Returns false when the line was the `[DONE]` sentinel.
    fn accept_line(&mut self, line: &str) -> bool {
        match parse_line(line) {
            LineOutcome::Frame(frame) => {
                if let Some(id) = frame
                    .data
                    .get("conversation_id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                {
                    self.conversation_id = Some(id.to_string());
                }
                self.ready.push_back(frame);
                true
            }
            LineOutcome::Done => false,
            LineOutcome::Malformed => {
                self.malformed_frames += 1;
                true
            }
            LineOutcome::Ignored => true,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.body = None;
    }

    fn abort(&mut self) -> DifyError {
        debug!("SSE stream aborted after {} chunks", self.chunks_read);
        self.finish();
        self.ready.clear();
        DifyError::Aborted
    }
}

#[cfg(test)]
pub(crate) fn body_from_chunks(chunks: Vec<&'static str>) -> ByteStream {
    let items: Vec<Result<bytes::Bytes, DifyError>> = chunks
        .into_iter()
        .map(|c| Ok(bytes::Bytes::from_static(c.as_bytes())))
        .collect();
    Box::pin(futures_util::stream::iter(items))
}
