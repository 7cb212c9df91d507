//! Engine contract.
//!
//! The bridge drives an opaque conversational engine through [`Engine`]. An
//! engine turns one message into a lazy stream of [`Fragment`]s, reports usage
//! afterwards, and may hand itself a follow-up ("reflected") message. All of its
//! I/O goes through the [`CaptureIo`](crate::core::capture::CaptureIo) handle it
//! was built with.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::capture::{CaptureError, CaptureIo};
use crate::core::confirm::ConfirmError;
use crate::core::events::UsageReport;
use crate::core::session::{ChatMode, DiffFormat};
use crate::providers::Credentials;

/// One piece of engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Text(String),
    /// The architect hands its plan to the editor model.
    EditorStart,
    EditorEnd,
}

impl Fragment {
    pub fn text(text: impl Into<String>) -> Self {
        Fragment::Text(text.into())
    }
}

pub type FragmentStream<'a> =
    Pin<Box<dyn Stream<Item = Result<Fragment, EngineError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Confirm(#[from] ConfirmError),
    #[error("{0}")]
    Runtime(String),
}

impl EngineError {
    pub fn runtime(message: impl Into<String>) -> Self {
        EngineError::Runtime(message.into())
    }
}

/// How the engine is told to express edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditFormat {
    Ask,
    Diff,
    SearchReplace,
    /// Plan with the main model, then apply with `editor` format.
    Architect { editor: DiffFormat },
}

impl EditFormat {
    #[must_use]
    pub fn for_mode(mode: ChatMode, diff_format: DiffFormat) -> Self {
        match mode {
            ChatMode::Ask => EditFormat::Ask,
            ChatMode::Architect => EditFormat::Architect {
                editor: diff_format,
            },
            ChatMode::Code => match diff_format {
                DiffFormat::Diff => EditFormat::Diff,
                DiffFormat::SearchReplace => EditFormat::SearchReplace,
            },
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EditFormat::Ask => "ask",
            EditFormat::Diff => "diff",
            EditFormat::SearchReplace => "search-replace",
            EditFormat::Architect { .. } => "architect",
        }
    }
}

/// Lint/test settings forwarded untouched to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtraConfig {
    #[serde(alias = "editorModel")]
    pub editor_model: Option<String>,
    #[serde(alias = "autoLint")]
    pub auto_lint: bool,
    #[serde(alias = "lintCmd")]
    pub lint_cmd: Option<String>,
    #[serde(alias = "autoTest")]
    pub auto_test: bool,
    #[serde(alias = "testCmd")]
    pub test_cmd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Everything needed to build an engine. Writable and read-only files are
/// disjoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSpec {
    pub model: String,
    pub edit_format: EditFormat,
    pub writable_files: Vec<PathBuf>,
    pub read_only_files: Vec<PathBuf>,
    pub credentials: Credentials,
    pub extra: Option<ExtraConfig>,
}

impl EngineSpec {
    #[cfg(test)]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            edit_format: EditFormat::SearchReplace,
            writable_files: Vec::new(),
            read_only_files: Vec::new(),
            credentials: Credentials::default(),
            extra: None,
        }
    }
}

pub trait Engine: Send {
    fn spec(&self) -> &EngineSpec;

    /// Called once per external message, before the first hop.
    fn begin_message(&mut self) {}

    fn run_stream<'a>(&'a mut self, message: &'a str) -> FragmentStream<'a>;

    fn usage_report(&self) -> Option<UsageReport>;

    fn reflected_message(&self) -> Option<&str>;

    fn clear_reflected_message(&mut self);

    fn history(&self) -> &[ChatMessage];

    fn replace_history(&mut self, history: Vec<ChatMessage>);

    fn clear_history(&mut self) {
        self.replace_history(Vec::new());
    }

    /// Build a replacement engine with `spec`, carrying this one's history.
    fn rebuild(&self, spec: EngineSpec) -> Result<Box<dyn Engine>, EngineError>;
}

/// Creates the first engine of a session.
pub trait EngineFactory: Send + Sync {
    fn create(&self, spec: EngineSpec, io: Arc<CaptureIo>) -> Result<Box<dyn Engine>, EngineError>;
}
