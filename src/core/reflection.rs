//! Reflection loop.
//!
//! Drives the engine for one external message. After each hop the engine may
//! hand itself a follow-up; the loop runs it as a new hop until none is left or
//! the reflection cap is reached. Every chain ends with exactly one `end`.

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::capture::CaptureIo;
use crate::core::engine::{Engine, EngineError, Fragment};
use crate::core::events::ChatEvent;
use crate::logging;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Captured error lines with nothing left to reflect on.
    #[error("{0}")]
    Captured(String),
    #[error("request cancelled")]
    Cancelled,
}

/// Sending half of a request's event queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl EventSink {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<ChatEvent>) -> Self {
        Self { tx }
    }

    /// Queue an event. A closed receiver means the client left; cancellation
    /// takes care of stopping the chain.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<ChatEvent> {
        self.tx.clone()
    }
}

pub struct ReflectionLoop<'a> {
    engine: &'a mut dyn Engine,
    io: &'a CaptureIo,
    max_reflections: u32,
    events: EventSink,
    cancel: CancellationToken,
}

impl<'a> ReflectionLoop<'a> {
    pub fn new(
        engine: &'a mut dyn Engine,
        io: &'a CaptureIo,
        max_reflections: u32,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            io,
            max_reflections,
            events,
            cancel,
        }
    }

    /// Run the chain for `message`, then emit pending writes, any error, and `end`.
    pub async fn run(mut self, message: &str) {
        let outcome = if message.is_empty() {
            Ok(())
        } else {
            self.engine.begin_message();
            self.drive(message.to_string()).await
        };

        let writes = self.io.drain_write_files();
        if !writes.is_empty() {
            self.events.emit(ChatEvent::FileWrites(writes));
        }
        if let Err(err) = outcome {
            logging::warn(format!("Chat chain failed: {err}"));
            self.events.emit(ChatEvent::error(err.to_string()));
        }
        self.flush_captured_output();
        self.events.emit(ChatEvent::End);
    }

    async fn drive(&mut self, mut message: String) -> Result<(), ChainError> {
        let mut reflections: u32 = 0;
        while !message.is_empty() {
            self.run_hop(&message).await?;
            self.log_output_lines();

            let Some(reflected) = self.engine.reflected_message().map(str::to_string) else {
                break;
            };
            if reflections >= self.max_reflections {
                self.events.emit(ChatEvent::log(format!(
                    "Only {} reflections allowed, stopping.",
                    self.max_reflections
                )));
                break;
            }
            reflections += 1;
            message = reflected;
            self.events.emit(ChatEvent::Reflected {
                message: message.clone(),
            });

            let errors = self.io.drain_error_lines();
            if !errors.is_empty() {
                let joined = errors.join("\n");
                if message.is_empty() {
                    return Err(ChainError::Captured(joined));
                }
                self.events.emit(ChatEvent::log(joined));
            }
        }
        Ok(())
    }

    async fn run_hop(&mut self, message: &str) -> Result<(), ChainError> {
        self.engine.clear_reflected_message();
        {
            let events = &self.events;
            let cancel = &self.cancel;
            let mut fragments = self.engine.run_stream(message);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ChainError::Cancelled),
                    next = fragments.next() => next,
                };
                match next {
                    None => break,
                    Some(Ok(Fragment::Text(chunk))) => events.emit(ChatEvent::data(chunk)),
                    Some(Ok(Fragment::EditorStart)) => events.emit(ChatEvent::EditorStart),
                    Some(Ok(Fragment::EditorEnd)) => events.emit(ChatEvent::EditorEnd),
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        }
        if let Some(usage) = self.engine.usage_report() {
            self.events.emit(ChatEvent::Usage(usage));
        }
        Ok(())
    }

    fn log_output_lines(&self) {
        for line in self.io.drain_lines() {
            logging::debug(format!("engine: {line}"));
        }
    }

    /// Leftover lines belong to this request only.
    fn flush_captured_output(&self) {
        self.log_output_lines();
        for line in self.io.drain_error_lines() {
            logging::debug(format!("engine error: {line}"));
        }
    }
}
