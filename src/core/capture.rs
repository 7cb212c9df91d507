//! Capture shim between the engine and the outside world.
//!
//! Output lines, error lines and file writes are buffered here instead of
//! reaching a terminal or the filesystem, then drained by the reflection loop.
//! Reads see buffered writes first so an engine observes its own edits.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::core::confirm::{ConfirmError, ConfirmationGate, answer_is_yes};
use crate::core::events::ConfirmRequest;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("[Errno 2] No such file or directory: '{path}'")]
    FileNotFound { path: String },
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("file path is not valid UTF-8: {0}")]
    InvalidFileData(String),
}

#[derive(Default)]
struct Buffers {
    lines: Vec<String>,
    error_lines: Vec<String>,
    write_files: BTreeMap<String, String>,
}

pub struct CaptureIo {
    buffers: Mutex<Buffers>,
    gate: Arc<ConfirmationGate>,
    workspace: Option<PathBuf>,
}

impl std::fmt::Debug for CaptureIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureIo")
            .field("workspace", &self.workspace)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl CaptureIo {
    #[must_use]
    pub fn new(gate: Arc<ConfirmationGate>) -> Self {
        Self {
            buffers: Mutex::new(Buffers::default()),
            gate,
            workspace: None,
        }
    }

    /// Resolve relative paths against `workspace` when reading real files.
    #[must_use]
    pub fn with_workspace(mut self, workspace: Option<PathBuf>) -> Self {
        self.workspace = workspace;
        self
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<ConfirmationGate> {
        &self.gate
    }

    fn buffers(&self) -> MutexGuard<'_, Buffers> {
        match self.buffers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn tool_output(&self, message: &str) {
        self.buffers().lines.push(message.to_string());
    }

    pub fn tool_warning(&self, message: &str) {
        self.tool_output(message);
    }

    pub fn tool_error(&self, message: &str) {
        self.buffers().error_lines.push(message.to_string());
    }

    pub fn drain_lines(&self) -> Vec<String> {
        std::mem::take(&mut self.buffers().lines)
    }

    pub fn drain_error_lines(&self) -> Vec<String> {
        std::mem::take(&mut self.buffers().error_lines)
    }

    /// Record a write without touching the filesystem.
    #[allow(dead_code)]
    pub fn write_text(&self, path: &Path, content: &str) -> Result<(), CaptureError> {
        let key = path_key(path)?;
        self.buffers().write_files.insert(key, content.to_string());
        Ok(())
    }

    /// Buffered content if this session wrote `path`, otherwise the real file.
    pub fn read_text(&self, path: &Path) -> Result<String, CaptureError> {
        let key = path_key(path)?;
        if let Some(content) = self.buffers().write_files.get(&key) {
            return Ok(content.clone());
        }

        let real_path = match &self.workspace {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        };
        if !real_path.exists() {
            let err = CaptureError::FileNotFound { path: key.clone() };
            self.tool_error(&format!("{key}: unable to read: {err}"));
            return Err(err);
        }
        std::fs::read_to_string(&real_path).map_err(|source| {
            self.tool_error(&format!("{key}: unable to read: {source}"));
            CaptureError::Io { path: key, source }
        })
    }

    pub fn drain_write_files(&self) -> BTreeMap<String, String> {
        std::mem::take(&mut self.buffers().write_files)
    }

    /// Ask the user a yes/no question through the confirmation gate.
    pub async fn confirm_ask(&self, request: ConfirmRequest) -> Result<bool, ConfirmError> {
        self.tool_output(&format!(
            "confirm_ask: {} ({}, {})",
            request.question,
            request.subject.as_deref().unwrap_or(""),
            request.group.as_deref().unwrap_or("")
        ));
        let answer = self.gate.ask(request).await?;
        Ok(answer_is_yes(&answer))
    }
}

fn path_key(path: &Path) -> Result<String, CaptureError> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| CaptureError::InvalidFileData(path.to_string_lossy().into_owned()))
}
