//! Confirmation gate.
//!
//! The engine can stop mid-stream and ask a yes/no question. While a chat
//! request is attached the question is forwarded to the client as a
//! `confirm-ask` event and the engine task suspends until `reply` delivers an
//! answer, the request is cancelled, or the configured timeout elapses. With no
//! request attached, or on a non-interactive gate, a fixed policy answers.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::core::events::{ChatEvent, ConfirmRequest};
use crate::logging;

/// Marker of the one question the default policy approves.
const CREATE_FILE_MARKER: &str = "Create new file";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfirmError {
    #[error("a confirmation is already pending")]
    AlreadyPending,
    #[error("no confirmation is pending")]
    NothingPending,
    #[error("request cancelled while awaiting confirmation")]
    Cancelled,
    #[error("timed out waiting for confirmation")]
    TimedOut,
    #[error("confirmation channel closed")]
    Disconnected,
}

/// Answer given when nobody is there to ask.
#[must_use]
pub fn default_policy(question: &str) -> bool {
    question.contains(CREATE_FILE_MARKER)
}

/// Interpret a client reply as approve/reject.
#[must_use]
pub fn answer_is_yes(answer: &Value) -> bool {
    match answer {
        Value::Bool(value) => *value,
        Value::String(text) => {
            let text = text.trim();
            text.eq_ignore_ascii_case("y") || text.eq_ignore_ascii_case("yes")
        }
        Value::Object(map) => map.get("result").is_some_and(answer_is_yes),
        _ => false,
    }
}

/// Where an attached request receives events and learns it was cancelled.
#[derive(Debug, Clone)]
pub struct RequestChannel {
    pub events: mpsc::UnboundedSender<ChatEvent>,
    pub cancel: CancellationToken,
}

struct PendingConfirm {
    request: ConfirmRequest,
    reply: oneshot::Sender<Value>,
}

#[derive(Default)]
struct GateState {
    channel: Option<RequestChannel>,
    pending: Option<PendingConfirm>,
}

pub struct ConfirmationGate {
    interactive: bool,
    timeout: Option<Duration>,
    state: Mutex<GateState>,
    resolutions: broadcast::Sender<Value>,
}

impl std::fmt::Debug for ConfirmationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationGate")
            .field("interactive", &self.interactive)
            .field("timeout", &self.timeout)
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}

impl ConfirmationGate {
    #[must_use]
    pub fn new(interactive: bool, timeout: Option<Duration>) -> Self {
        let (resolutions, _) = broadcast::channel(16);
        Self {
            interactive,
            timeout,
            state: Mutex::new(GateState::default()),
            resolutions,
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn non_interactive() -> Self {
        Self::new(false, None)
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Route questions to `channel` until the returned guard is dropped.
    pub fn attach(self: &Arc<Self>, channel: RequestChannel) -> GateAttachment {
        self.state().channel = Some(channel);
        GateAttachment {
            gate: Arc::clone(self),
        }
    }

    fn detach(&self) {
        let mut state = self.state();
        state.channel = None;
        state.pending = None;
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state().pending.is_some()
    }

    /// Ask a question and wait for the answer.
    pub async fn ask(&self, request: ConfirmRequest) -> Result<Value, ConfirmError> {
        let (rx, channel) = {
            let mut state = self.state();
            let channel = match state.channel.clone() {
                Some(channel) if self.interactive => channel,
                _ => return Ok(Value::Bool(default_policy(&request.question))),
            };
            if state.pending.is_some() {
                return Err(ConfirmError::AlreadyPending);
            }
            let (tx, rx) = oneshot::channel();
            state.pending = Some(PendingConfirm {
                request: request.clone(),
                reply: tx,
            });
            (rx, channel)
        };

        if channel.events.send(ChatEvent::ConfirmAsk(request)).is_err() {
            self.state().pending = None;
            return Err(ConfirmError::Disconnected);
        }

        let result = tokio::select! {
            _ = channel.cancel.cancelled() => Err(ConfirmError::Cancelled),
            answer = self.wait_reply(rx) => answer,
        };
        if result.is_err() {
            self.state().pending = None;
        }
        result
    }

    async fn wait_reply(&self, rx: oneshot::Receiver<Value>) -> Result<Value, ConfirmError> {
        let reply = async { rx.await.map_err(|_| ConfirmError::Disconnected) };
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, reply)
                .await
                .map_err(|_| ConfirmError::TimedOut)?,
            None => reply.await,
        }
    }

    /// Resolve the pending question with `answer`.
    pub fn reply(&self, answer: Value) -> Result<(), ConfirmError> {
        let pending = self
            .state()
            .pending
            .take()
            .ok_or(ConfirmError::NothingPending)?;
        if pending.reply.send(answer.clone()).is_err() {
            logging::warn(format!(
                "Confirmation answered after its request went away: {}",
                pending.request.question
            ));
        }
        let _ = self.resolutions.send(answer);
        Ok(())
    }

    /// Wait for the next resolution delivered through [`reply`](Self::reply).
    pub async fn wait_resolution(&self) -> Result<Value, ConfirmError> {
        let mut rx = self.resolutions.subscribe();
        let next = async {
            loop {
                match rx.recv().await {
                    Ok(value) => return Ok(value),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ConfirmError::Disconnected);
                    }
                }
            }
        };
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, next)
                .await
                .map_err(|_| ConfirmError::TimedOut)?,
            None => next.await,
        }
    }
}

/// Keeps a request attached to its gate; detaches on drop.
#[must_use]
pub struct GateAttachment {
    gate: Arc<ConfirmationGate>,
}

impl Drop for GateAttachment {
    fn drop(&mut self) {
        self.gate.detach();
    }
}
