//! Fragment reconciler. Converts full-text snapshots into deltas.
//!
//! The backend sometimes sends growing prefixes, sometimes restarts, and
//! sometimes replaces the whole answer. Consumers apply the deltas
//! verbatim and never diff on their own; after every `apply`, a consumer
//! that followed `Delta::apply_to` holds exactly `accumulated()`.
//!
//! Classification of a candidate against the accumulated text:
//! - extends it (strict prefix growth)      → `Append(suffix)`
//! - nothing accumulated yet                → `Append(candidate)`
//! - strictly shorter, not an extension     → `Restart(candidate)`
//! - anything else                          → `Clear`, then `Replace(candidate)`
//!
//! The last rule also catches an identical repeat and an equal-length
//! rewrite. Both trigger a clear and resend even though nothing grew.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum Delta {
    /// New text to add after what the consumer already holds.
    Append(String),
    /// The server restarted the answer; the text is the whole new answer.
    Restart(String),
    /// First phase of a full replacement: drop held content.
    Clear,
    /// Second phase of a full replacement.
    Replace(String),
}

impl Delta {
    pub fn apply_to(&self, buffer: &mut String) {
        match self {
            Delta::Append(text) => buffer.push_str(text),
            Delta::Clear => buffer.clear(),
            Delta::Restart(text) | Delta::Replace(text) => {
                buffer.clear();
                buffer.push_str(text);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Reconciler {
    accumulated: String,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Reconciles one candidate full text. Empty candidates carry nothing.
    pub fn apply(&mut self, candidate: &str) -> Vec<Delta> {
        if candidate.is_empty() {
            return Vec::new();
        }

        if self.accumulated.is_empty() {
            self.accumulated.push_str(candidate);
            return vec![Delta::Append(candidate.to_string())];
        }

        if let Some(suffix) = candidate.strip_prefix(self.accumulated.as_str()) {
            if !suffix.is_empty() {
                let delta = Delta::Append(suffix.to_string());
                self.accumulated.push_str(suffix);
                return vec![delta];
            }
        }

        if candidate.chars().count() < self.accumulated.chars().count() {
            self.accumulated = candidate.to_string();
            return vec![Delta::Restart(candidate.to_string())];
        }

        self.accumulated = candidate.to_string();
        vec![Delta::Clear, Delta::Replace(candidate.to_string())]
    }

    pub fn into_answer(self) -> String {
        self.accumulated
    }
}
