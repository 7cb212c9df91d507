//! Events emitted while processing a chat request.
//!
//! These flow from the reflection loop to the HTTP layer via a channel, one
//! request at a time, and are encoded as SSE frames by [`crate::stream`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token accounting reported by the engine after a hop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

impl UsageReport {
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost: None,
            total_cost: None,
        }
    }
}

/// A yes/no question the engine wants answered before it continues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[cfg(test)]
impl ConfirmRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            subject: None,
            group: None,
        }
    }

    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Events emitted by the reflection loop for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A text fragment from the engine.
    Data { chunk: String },
    /// Usage statistics for the hop that just finished.
    Usage(UsageReport),
    /// Every file the engine wrote during the chain, path to content.
    FileWrites(BTreeMap<String, String>),
    /// The engine asked itself a follow-up.
    Reflected { message: String },
    /// Informational or warning text for the client.
    Log { message: String },
    /// The engine is waiting for a yes/no answer.
    ConfirmAsk(ConfirmRequest),
    /// The architect's editor pass started.
    EditorStart,
    /// The architect's editor pass finished.
    EditorEnd,
    /// Processing failed; only `End` may follow.
    Error { error: String },
    /// Terminal event, exactly once per request.
    End,
}

impl ChatEvent {
    pub fn data(chunk: impl Into<String>) -> Self {
        ChatEvent::Data {
            chunk: chunk.into(),
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        ChatEvent::Log {
            message: message.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        ChatEvent::Error {
            error: error.into(),
        }
    }

    /// Wire name used as the SSE `event:` field.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Data { .. } => "data",
            ChatEvent::Usage(_) => "usage",
            ChatEvent::FileWrites(_) => "write",
            ChatEvent::Reflected { .. } => "reflected",
            ChatEvent::Log { .. } => "log",
            ChatEvent::ConfirmAsk(_) => "confirm-ask",
            ChatEvent::EditorStart => "editor-start",
            ChatEvent::EditorEnd => "editor-end",
            ChatEvent::Error { .. } => "error",
            ChatEvent::End => "end",
        }
    }

    /// JSON payload, `None` for events that carry no data.
    pub fn payload(&self) -> Result<Option<Value>, serde_json::Error> {
        let value = match self {
            ChatEvent::Data { chunk } => serde_json::json!({ "chunk": chunk }),
            ChatEvent::Usage(usage) => serde_json::to_value(usage)?,
            ChatEvent::FileWrites(files) => serde_json::json!({ "write": files }),
            ChatEvent::Reflected { message } | ChatEvent::Log { message } => {
                serde_json::json!({ "message": message })
            }
            ChatEvent::ConfirmAsk(request) => serde_json::to_value(request)?,
            ChatEvent::Error { error } => serde_json::json!({ "error": error }),
            ChatEvent::EditorStart | ChatEvent::EditorEnd | ChatEvent::End => return Ok(None),
        };
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn payloads_match_wire_shapes() {
        assert_eq!(
            ChatEvent::data("hi").payload().unwrap(),
            Some(json!({ "chunk": "hi" }))
        );
        assert_eq!(
            ChatEvent::Usage(UsageReport::new(3, 4)).payload().unwrap(),
            Some(json!({ "prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7 }))
        );
        let mut files = BTreeMap::new();
        files.insert("a.txt".to_string(), "x".to_string());
        assert_eq!(
            ChatEvent::FileWrites(files).payload().unwrap(),
            Some(json!({ "write": { "a.txt": "x" } }))
        );
        assert_eq!(
            ChatEvent::ConfirmAsk(ConfirmRequest::new("Create new file a.txt?").with_subject("a.txt"))
                .payload()
                .unwrap(),
            Some(json!({ "question": "Create new file a.txt?", "subject": "a.txt" }))
        );
        assert_eq!(ChatEvent::End.payload().unwrap(), None);
        assert_eq!(ChatEvent::EditorStart.payload().unwrap(), None);
    }

    #[test]
    fn names_are_stable() {
        assert_eq!(ChatEvent::FileWrites(BTreeMap::new()).name(), "write");
        assert_eq!(ChatEvent::error("x").name(), "error");
        assert_eq!(ChatEvent::log("x").name(), "log");
        assert_eq!(ChatEvent::End.name(), "end");
    }
}
