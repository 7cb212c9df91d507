//! Chat sessions.
//!
//! A session owns the engine and the configuration it was built from. Every
//! chat request is reconciled against that configuration first; when anything
//! differs the engine is rebuilt (history carried over) before the message is
//! processed. Sessions live in a [`SessionRegistry`] keyed by session id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DEFAULT_MAX_REFLECTIONS, DEFAULT_MAX_SESSIONS, DEFAULT_MODEL};
use crate::core::capture::CaptureIo;
use crate::core::confirm::{ConfirmationGate, RequestChannel};
use crate::core::engine::{
    ChatMessage, EditFormat, Engine, EngineError, EngineFactory, EngineSpec, ExtraConfig,
};
use crate::core::events::ChatEvent;
use crate::core::reflection::{EventSink, ReflectionLoop};
use crate::logging;
use crate::providers::{ConfigurationError, Credentials, ProviderSetting};

pub const DEFAULT_SESSION_ID: &str = "default";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Ask,
    Code,
    Architect,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffFormat {
    #[serde(rename = "diff", alias = "udiff")]
    Diff,
    #[default]
    #[serde(rename = "search-replace", alias = "search_replace")]
    SearchReplace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReference {
    #[serde(alias = "fsPath")]
    pub fs_path: String,
    pub readonly: bool,
}

#[cfg(test)]
impl ChatReference {
    pub fn new(fs_path: impl Into<String>, readonly: bool) -> Self {
        Self {
            fs_path: fs_path.into(),
            readonly,
        }
    }
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(alias = "chat_mode", alias = "chatMode", alias = "chatType")]
    pub chat_type: ChatMode,
    #[serde(alias = "diffFormat")]
    pub diff_format: DiffFormat,
    pub message: String,
    #[serde(alias = "referenceList")]
    pub reference_list: Vec<ChatReference>,
    #[serde(default, alias = "extraConfig")]
    pub extra_config: Option<ExtraConfig>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("reference_list[{0}].fs_path cannot be empty")]
    EmptyReferencePath(usize),
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(index) = self
            .reference_list
            .iter()
            .position(|reference| reference.fs_path.trim().is_empty())
        {
            return Err(ValidationError::EmptyReferencePath(index));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SettingError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("failed to rebuild engine: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("all {limit} sessions are busy")]
    Full { limit: usize },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Per-session knobs taken from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub default_model: String,
    pub max_reflections: u32,
    pub confirm_interactive: bool,
    pub confirm_timeout: Option<Duration>,
    pub workspace: Option<PathBuf>,
    pub max_sessions: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            max_reflections: DEFAULT_MAX_REFLECTIONS,
            confirm_interactive: false,
            confirm_timeout: None,
            workspace: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl SessionOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_model: config.default_model(),
            max_reflections: config.max_reflections(),
            confirm_interactive: config.confirm_interactive(),
            confirm_timeout: config.confirm_timeout(),
            workspace: config.workspace(),
            max_sessions: config.max_sessions(),
        }
    }
}

/// The configuration an engine is built from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SessionConfig {
    chat_mode: ChatMode,
    diff_format: DiffFormat,
    references: Vec<ChatReference>,
    extra_config: Option<ExtraConfig>,
    provider: Option<ProviderSetting>,
    credentials: Credentials,
}

impl SessionConfig {
    fn engine_spec(&self, default_model: &str) -> EngineSpec {
        let writable_files: Vec<PathBuf> = self
            .references
            .iter()
            .filter(|reference| !reference.readonly)
            .map(|reference| PathBuf::from(&reference.fs_path))
            .collect();
        let mut read_only_files: Vec<PathBuf> = Vec::new();
        for reference in self.references.iter().filter(|r| r.readonly) {
            let path = PathBuf::from(&reference.fs_path);
            if !writable_files.contains(&path) && !read_only_files.contains(&path) {
                read_only_files.push(path);
            }
        }

        let model = self
            .provider
            .as_ref()
            .map_or_else(|| default_model.to_string(), |p| p.model.trim().to_string());

        EngineSpec {
            model,
            edit_format: EditFormat::for_mode(self.chat_mode, self.diff_format),
            writable_files,
            read_only_files,
            credentials: self.credentials.clone(),
            extra: self.extra_config.clone(),
        }
    }
}

pub struct ChatSession {
    id: String,
    config: SessionConfig,
    default_model: String,
    max_reflections: u32,
    engine: Box<dyn Engine>,
    io: Arc<CaptureIo>,
}

impl ChatSession {
    pub fn new(
        id: impl Into<String>,
        factory: &dyn EngineFactory,
        options: &SessionOptions,
    ) -> Result<Self, EngineError> {
        let gate = Arc::new(ConfirmationGate::new(
            options.confirm_interactive,
            options.confirm_timeout,
        ));
        let io = Arc::new(CaptureIo::new(gate).with_workspace(options.workspace.clone()));
        let config = SessionConfig::default();
        let engine = factory.create(config.engine_spec(&options.default_model), Arc::clone(&io))?;
        Ok(Self {
            id: id.into(),
            config,
            default_model: options.default_model.clone(),
            max_reflections: options.max_reflections,
            engine,
            io,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn chat_mode(&self) -> ChatMode {
        self.config.chat_mode
    }

    #[must_use]
    pub fn diff_format(&self) -> DiffFormat {
        self.config.diff_format
    }

    #[must_use]
    pub fn references(&self) -> &[ChatReference] {
        &self.config.references
    }

    #[must_use]
    pub fn provider(&self) -> Option<&ProviderSetting> {
        self.config.provider.as_ref()
    }

    #[must_use]
    pub fn gate(&self) -> Arc<ConfirmationGate> {
        Arc::clone(self.io.gate())
    }

    /// Swap in a new engine for `config`. Nothing changes if the rebuild fails.
    fn apply_config(&mut self, config: SessionConfig) -> Result<(), EngineError> {
        let engine = self.engine.rebuild(config.engine_spec(&self.default_model))?;
        self.config = config;
        self.engine = engine;
        Ok(())
    }

    /// Bring the session in line with `request`. Returns whether the engine
    /// was rebuilt.
    pub fn reconcile(&mut self, request: &ChatRequest) -> Result<bool, EngineError> {
        let mut references = request.reference_list.clone();
        references.sort_by(|a, b| a.fs_path.cmp(&b.fs_path));

        let candidate = SessionConfig {
            chat_mode: request.chat_type,
            diff_format: request.diff_format,
            references,
            extra_config: request.extra_config.clone(),
            ..self.config.clone()
        };
        if candidate == self.config {
            return Ok(false);
        }

        self.apply_config(candidate)?;
        logging::info(format!(
            "Session '{}' reconfigured: mode={:?} format={} references={}",
            self.id,
            self.config.chat_mode,
            self.engine.spec().edit_format.as_str(),
            self.references().len()
        ));
        Ok(true)
    }

    /// Apply a provider/model setting. Returns whether the engine was rebuilt.
    pub fn apply_setting(&mut self, setting: ProviderSetting) -> Result<bool, SettingError> {
        if self.config.provider.as_ref() == Some(&setting) {
            return Ok(false);
        }
        let credentials = setting.resolve()?;
        let provider_name = credentials
            .provider()
            .map_or("unknown", |provider| provider.name);
        let candidate = SessionConfig {
            provider: Some(setting),
            credentials,
            ..self.config.clone()
        };
        self.apply_config(candidate)?;
        logging::info(format!(
            "Session '{}' now using {} via {}",
            self.id,
            self.engine.spec().model,
            provider_name
        ));
        Ok(true)
    }

    #[must_use]
    pub fn history(&self) -> &[ChatMessage] {
        self.engine.history()
    }

    pub fn replace_history(&mut self, history: Vec<ChatMessage>) {
        self.engine.replace_history(history);
    }

    pub fn clear_history(&mut self) {
        self.engine.clear_history();
    }

    /// Process one chat request, emitting its events to `events`.
    pub async fn chat(&mut self, request: ChatRequest, events: EventSink, cancel: CancellationToken) {
        if let Err(err) = self.reconcile(&request) {
            events.emit(ChatEvent::error(format!("Failed to reconfigure engine: {err}")));
            events.emit(ChatEvent::End);
            return;
        }

        let _attachment = self.io.gate().attach(RequestChannel {
            events: events.sender(),
            cancel: cancel.clone(),
        });
        ReflectionLoop::new(
            &mut *self.engine,
            &self.io,
            self.max_reflections,
            events,
            cancel,
        )
        .run(&request.message)
        .await;
    }
}

pub type SharedSession = Arc<tokio::sync::Mutex<ChatSession>>;

/// A session plus its gate, reachable without taking the session lock.
#[derive(Clone)]
pub struct SessionHandle {
    pub session: SharedSession,
    pub gate: Arc<ConfirmationGate>,
}

impl SessionHandle {
    /// Whether a request is running on this session or waiting on its gate.
    fn is_busy(&self) -> bool {
        self.session.try_lock().is_err() || self.gate.is_pending()
    }
}

struct RegistryEntry {
    handle: SessionHandle,
    last_used: u64,
}

#[derive(Default)]
struct Sessions {
    entries: HashMap<String, RegistryEntry>,
    clock: u64,
}

impl Sessions {
    fn touch(&mut self, id: &str) -> Option<SessionHandle> {
        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.get_mut(id)?;
        entry.last_used = clock;
        Some(entry.handle.clone())
    }

    /// Least recently used session with no request in flight.
    fn idle_victim(&self) -> Option<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.handle.is_busy())
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(id, _)| id.clone())
    }
}

/// Live sessions keyed by id, bounded by `max_sessions`.
pub struct SessionRegistry {
    factory: Arc<dyn EngineFactory>,
    options: SessionOptions,
    sessions: Mutex<Sessions>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn EngineFactory>, options: SessionOptions) -> Self {
        Self {
            factory,
            options,
            sessions: Mutex::new(Sessions::default()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// An existing session; never creates one.
    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions().touch(id)
    }

    /// The session for `id`, created on first use. At capacity the least
    /// recently used idle session is evicted to make room.
    pub fn get_or_create(&self, id: &str) -> Result<SessionHandle, RegistryError> {
        let mut sessions = self.sessions();
        if let Some(handle) = sessions.touch(id) {
            return Ok(handle);
        }

        let limit = self.options.max_sessions.max(1);
        if sessions.entries.len() >= limit {
            let victim = sessions.idle_victim().ok_or(RegistryError::Full { limit })?;
            sessions.entries.remove(&victim);
            logging::info(format!("Evicted idle chat session '{victim}'"));
        }

        let session = ChatSession::new(id, self.factory.as_ref(), &self.options)?;
        let handle = SessionHandle {
            gate: session.gate(),
            session: Arc::new(tokio::sync::Mutex::new(session)),
        };
        let last_used = sessions.clock;
        sessions.entries.insert(
            id.to_string(),
            RegistryEntry {
                handle: handle.clone(),
                last_used,
            },
        );
        logging::info(format!("Created chat session '{id}'"));
        Ok(handle)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions().entries.len()
    }
}
