//! Shared test-only helpers.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::mpsc;

use crate::core::capture::CaptureIo;
use crate::core::confirm::ConfirmationGate;
use crate::core::engine::{
    ChatMessage, Engine, EngineError, EngineFactory, EngineSpec, Fragment, FragmentStream,
};
use crate::core::events::{ChatEvent, ConfirmRequest, UsageReport};

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Acquire the process-wide env-var mutex.
///
/// If a prior test panicked while holding the lock, recover the guard instead
/// of cascading failures across unrelated tests.
pub(crate) fn lock_test_env() -> MutexGuard<'static, ()> {
    match env_lock().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Drain a request's event queue until every sender is gone.
pub(crate) async fn collect_events(mut rx: mpsc::UnboundedReceiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// One scripted action inside a hop.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Text(String),
    EditorStart,
    EditorEnd,
    Output(String),
    ErrorLine(String),
    Write(String, String),
    Confirm(ConfirmRequest),
    Fail(String),
    /// Never finishes; only cancellation gets past it.
    Pending,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Hop {
    steps: Vec<Step>,
    usage: Option<UsageReport>,
    reflected: Option<String>,
}

impl Hop {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn text(self, text: &str) -> Self {
        self.step(Step::Text(text.to_string()))
    }

    pub(crate) fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub(crate) fn usage(mut self, usage: UsageReport) -> Self {
        self.usage = Some(usage);
        self
    }

    pub(crate) fn reflect(mut self, message: &str) -> Self {
        self.reflected = Some(message.to_string());
        self
    }
}

#[derive(Default)]
struct ProbeState {
    script: VecDeque<Hop>,
    fallback: Option<Hop>,
    received: Vec<String>,
    histories: Vec<Vec<ChatMessage>>,
    answers: Vec<bool>,
    begun: usize,
    rebuilds: usize,
    specs: Vec<EngineSpec>,
}

/// Test-side handle on every engine built from the same script.
#[derive(Clone, Default)]
pub(crate) struct ScriptProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl ScriptProbe {
    fn state(&self) -> MutexGuard<'_, ProbeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn push(&self, hop: Hop) {
        self.state().script.push_back(hop);
    }

    /// Hop played whenever the script runs dry.
    pub(crate) fn set_fallback(&self, hop: Hop) {
        self.state().fallback = Some(hop);
    }

    pub(crate) fn received(&self) -> Vec<String> {
        self.state().received.clone()
    }

    /// History each hop started from, oldest hop first.
    pub(crate) fn histories(&self) -> Vec<Vec<ChatMessage>> {
        self.state().histories.clone()
    }

    pub(crate) fn answers(&self) -> Vec<bool> {
        self.state().answers.clone()
    }

    pub(crate) fn begun(&self) -> usize {
        self.state().begun
    }

    pub(crate) fn rebuilds(&self) -> usize {
        self.state().rebuilds
    }

    pub(crate) fn last_spec(&self) -> Option<EngineSpec> {
        self.state().specs.last().cloned()
    }

    fn record_answer(&self, answer: bool) {
        self.state().answers.push(answer);
    }

    fn next_hop(&self, message: &str, history: &[ChatMessage]) -> Hop {
        let mut state = self.state();
        state.received.push(message.to_string());
        state.histories.push(history.to_vec());
        match state.script.pop_front() {
            Some(hop) => hop,
            None => state.fallback.clone().unwrap_or_default(),
        }
    }
}

/// Engine that plays back hops queued on its [`ScriptProbe`].
pub(crate) struct ScriptedEngine {
    spec: EngineSpec,
    io: Arc<CaptureIo>,
    probe: ScriptProbe,
    history: Vec<ChatMessage>,
    usage: Option<UsageReport>,
    reflected: Option<String>,
}

impl ScriptedEngine {
    pub(crate) fn new() -> (Self, ScriptProbe) {
        Self::with_gate(Arc::new(ConfirmationGate::non_interactive()))
    }

    pub(crate) fn with_gate(gate: Arc<ConfirmationGate>) -> (Self, ScriptProbe) {
        let probe = ScriptProbe::default();
        let io = Arc::new(CaptureIo::new(gate));
        let engine = Self::from_parts(EngineSpec::new("test/model"), io, probe.clone());
        (engine, probe)
    }

    pub(crate) fn always_reflecting(message: &str) -> (Self, ScriptProbe) {
        let (engine, probe) = Self::new();
        probe.set_fallback(Hop::new().text("thinking").reflect(message));
        (engine, probe)
    }

    pub(crate) fn from_parts(spec: EngineSpec, io: Arc<CaptureIo>, probe: ScriptProbe) -> Self {
        probe.state().specs.push(spec.clone());
        Self {
            spec,
            io,
            probe,
            history: Vec::new(),
            usage: None,
            reflected: None,
        }
    }

    pub(crate) fn io(&self) -> &Arc<CaptureIo> {
        &self.io
    }
}

impl Engine for ScriptedEngine {
    fn spec(&self) -> &EngineSpec {
        &self.spec
    }

    fn begin_message(&mut self) {
        self.probe.state().begun += 1;
    }

    fn run_stream<'a>(&'a mut self, message: &'a str) -> FragmentStream<'a> {
        let hop = self.probe.next_hop(message, &self.history);
        let this = self;
        Box::pin(async_stream::stream! {
            this.usage = None;
            this.history.push(ChatMessage::new("user", message));
            let mut reply = String::new();
            for step in hop.steps {
                match step {
                    Step::Text(text) => {
                        reply.push_str(&text);
                        yield Ok(Fragment::Text(text));
                    }
                    Step::EditorStart => {
                        yield Ok(Fragment::EditorStart);
                    }
                    Step::EditorEnd => {
                        yield Ok(Fragment::EditorEnd);
                    }
                    Step::Output(line) => this.io.tool_output(&line),
                    Step::ErrorLine(line) => this.io.tool_error(&line),
                    Step::Write(path, content) => {
                        if let Err(err) = this.io.write_text(Path::new(&path), &content) {
                            yield Err(err.into());
                            return;
                        }
                    }
                    Step::Confirm(request) => match this.io.confirm_ask(request).await {
                        Ok(answer) => this.probe.record_answer(answer),
                        Err(err) => {
                            yield Err(err.into());
                            return;
                        }
                    },
                    Step::Fail(reason) => {
                        yield Err(EngineError::runtime(reason));
                        return;
                    }
                    Step::Pending => futures_util::future::pending::<()>().await,
                }
            }
            this.history.push(ChatMessage::new("assistant", reply));
            this.usage = hop.usage;
            this.reflected = hop.reflected;
        })
    }

    fn usage_report(&self) -> Option<UsageReport> {
        self.usage.clone()
    }

    fn reflected_message(&self) -> Option<&str> {
        self.reflected.as_deref()
    }

    fn clear_reflected_message(&mut self) {
        self.reflected = None;
    }

    fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    fn replace_history(&mut self, history: Vec<ChatMessage>) {
        self.history = history;
    }

    fn rebuild(&self, spec: EngineSpec) -> Result<Box<dyn Engine>, EngineError> {
        self.probe.state().rebuilds += 1;
        let mut engine = ScriptedEngine::from_parts(spec, Arc::clone(&self.io), self.probe.clone());
        engine.history = self.history.clone();
        Ok(Box::new(engine))
    }
}

pub(crate) struct ScriptedFactory {
    probe: ScriptProbe,
}

impl ScriptedFactory {
    pub(crate) fn new() -> (Self, ScriptProbe) {
        let probe = ScriptProbe::default();
        (
            Self {
                probe: probe.clone(),
            },
            probe,
        )
    }
}

impl EngineFactory for ScriptedFactory {
    fn create(&self, spec: EngineSpec, io: Arc<CaptureIo>) -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(ScriptedEngine::from_parts(
            spec,
            io,
            self.probe.clone(),
        )))
    }
}
