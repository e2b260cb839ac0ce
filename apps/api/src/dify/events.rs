//! Typed view of the Dify stream events that can carry answer text.
//!
//! Every frame decodes into exactly one variant. Frames of a known event
//! type that lack the field that event normally carries fall through to
//! `Other`, which reads the generic `answer | text | content` keys.

use serde_json::Value;

use crate::dify::sse::SseFrame;

#[derive(Debug, Clone, PartialEq)]
pub enum DifyEvent {
    /// `message` with a non-empty `answer`.
    Message { answer: String },
    /// `node_finished` with `data.outputs.answer`.
    NodeFinished { answer: String },
    /// `workflow_finished` with an `outputs` object; the first non-empty of
    /// `answer | text | result`, if any.
    WorkflowFinished { answer: Option<String> },
    /// `message_end`: metadata only, never text.
    MessageEnd { metadata: Value },
    /// Anything else, with the generic fallback text if present.
    Other { event: String, text: Option<String> },
}

impl DifyEvent {
    pub fn decode(frame: &SseFrame) -> Self {
        let data = &frame.data;
        match frame.event.as_str() {
            "message" => {
                if let Some(answer) = non_empty_str(data.get("answer")) {
                    return DifyEvent::Message { answer };
                }
            }
            "node_finished" => {
                let answer = data
                    .get("data")
                    .and_then(|d| d.get("outputs"))
                    .and_then(|o| o.get("answer"));
                if let Some(answer) = non_empty_str(answer) {
                    return DifyEvent::NodeFinished { answer };
                }
            }
            "workflow_finished" => {
                if let Some(outputs) = data.get("outputs").filter(|o| !o.is_null()) {
                    let answer = ["answer", "text", "result"]
                        .iter()
                        .find_map(|key| non_empty_str(outputs.get(*key)));
                    return DifyEvent::WorkflowFinished { answer };
                }
            }
            "message_end" => {
                if let Some(metadata) = data.get("metadata").filter(|m| !m.is_null()) {
                    return DifyEvent::MessageEnd {
                        metadata: metadata.clone(),
                    };
                }
            }
            _ => {}
        }

        let text = ["answer", "text", "content"]
            .iter()
            .find_map(|key| non_empty_str(data.get(*key)));
        DifyEvent::Other {
            event: frame.event.clone(),
            text,
        }
    }

    /// The candidate full answer text this event proposes, if any.
    pub fn candidate_text(&self) -> Option<&str> {
        match self {
            DifyEvent::Message { answer } | DifyEvent::NodeFinished { answer } => Some(answer),
            DifyEvent::WorkflowFinished { answer } => answer.as_deref(),
            DifyEvent::MessageEnd { .. } => None,
            DifyEvent::Other { text, .. } => text.as_deref(),
        }
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
