//! SSE encoding of chat events.
//!
//! [`EventStreamEncoder`] turns [`ChatEvent`]s into frames and enforces the
//! stream's ordering rules: after `error` only `end` passes, `end` goes out
//! exactly once, and a stream whose producer vanished still ends with `end`.

use std::convert::Infallible;

use async_stream::stream;
use axum::response::sse::Event as SseEvent;
use futures_util::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

use crate::core::events::ChatEvent;
use crate::logging;

/// One encoded event: the `event:` name plus an optional JSON `data:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: &'static str,
    pub data: Option<String>,
}

impl Frame {
    fn end() -> Self {
        Self {
            event: "end",
            data: None,
        }
    }

    fn error(message: &str) -> Self {
        let data = serde_json::json!({ "error": message }).to_string();
        Self {
            event: "error",
            data: Some(data),
        }
    }

    #[must_use]
    pub fn into_sse_event(self) -> SseEvent {
        let event = SseEvent::default().event(self.event);
        match self.data {
            Some(data) => event.data(data),
            None => event,
        }
    }
}

#[derive(Debug, Default)]
pub struct EventStreamEncoder {
    errored: bool,
    ended: bool,
}

impl EventStreamEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `event`, or `None` if the ordering rules drop it.
    pub fn encode(&mut self, event: &ChatEvent) -> Option<Frame> {
        if self.ended {
            return None;
        }
        match event {
            ChatEvent::End => {
                self.ended = true;
                return Some(Frame::end());
            }
            _ if self.errored => {
                logging::debug(format!("Dropping '{}' event after error", event.name()));
                return None;
            }
            ChatEvent::Error { .. } => self.errored = true,
            _ => {}
        }

        Some(self.frame_for(event.name(), event.payload()))
    }

    fn frame_for(
        &mut self,
        name: &'static str,
        payload: Result<Option<Value>, serde_json::Error>,
    ) -> Frame {
        let encoded =
            payload.and_then(|payload| payload.map(|value| serde_json::to_string(&value)).transpose());
        match encoded {
            Ok(data) => Frame { event: name, data },
            Err(err) => {
                self.errored = true;
                Frame::error(&format!("failed to encode '{name}' event: {err}"))
            }
        }
    }

    /// The closing `end` frame if none has been emitted yet.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.ended {
            return None;
        }
        self.ended = true;
        Some(Frame::end())
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.ended
    }
}

/// SSE body for one request. Dropping the stream (client gone) drops `guard`,
/// which cancels the request.
pub fn encode_events(
    mut rx: mpsc::UnboundedReceiver<ChatEvent>,
    guard: DropGuard,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    stream! {
        let _guard = guard;
        let mut encoder = EventStreamEncoder::new();
        while let Some(event) = rx.recv().await {
            if let Some(frame) = encoder.encode(&event) {
                yield Ok(frame.into_sse_event());
            }
            if encoder.is_finished() {
                break;
            }
        }
        if let Some(frame) = encoder.finish() {
            yield Ok(frame.into_sse_event());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::core::events::UsageReport;

    fn encode_all(events: &[ChatEvent]) -> Vec<Frame> {
        let mut encoder = EventStreamEncoder::new();
        let mut frames: Vec<Frame> = events.iter().filter_map(|e| encoder.encode(e)).collect();
        frames.extend(encoder.finish());
        frames
    }

    fn sse_text(frame: &Frame) -> String {
        match &frame.data {
            Some(data) => format!("event: {}\ndata: {data}\n\n", frame.event),
            None => format!("event: {}\n\n", frame.event),
        }
    }

    #[test]
    fn frames_have_name_and_optional_data() {
        let frames = encode_all(&[ChatEvent::data("Hi"), ChatEvent::EditorStart, ChatEvent::End]);
        let text: Vec<String> = frames.iter().map(sse_text).collect();
        assert_eq!(
            text,
            vec![
                "event: data\ndata: {\"chunk\":\"Hi\"}\n\n".to_string(),
                "event: editor-start\n\n".to_string(),
                "event: end\n\n".to_string(),
            ]
        );
    }

    #[test]
    fn only_end_follows_error() {
        let frames = encode_all(&[
            ChatEvent::data("a"),
            ChatEvent::error("boom"),
            ChatEvent::data("late"),
            ChatEvent::Usage(UsageReport::new(1, 1)),
            ChatEvent::End,
        ]);
        let names: Vec<_> = frames.iter().map(|f| f.event).collect();
        assert_eq!(names, vec!["data", "error", "end"]);
    }

    #[test]
    fn end_is_emitted_exactly_once() {
        let frames = encode_all(&[ChatEvent::End, ChatEvent::data("x"), ChatEvent::End]);
        assert_eq!(frames, vec![Frame::end()]);
    }

    #[test]
    fn missing_end_is_synthesised() {
        let frames = encode_all(&[ChatEvent::data("x")]);
        let names: Vec<_> = frames.iter().map(|f| f.event).collect();
        assert_eq!(names, vec!["data", "end"]);
    }

    #[test]
    fn unencodable_payload_becomes_error_frame() {
        let mut encoder = EventStreamEncoder::new();
        let err = serde_json::from_str::<Value>("{").unwrap_err();
        let frame = encoder.frame_for("usage", Err(err));

        assert_eq!(frame.event, "error");
        assert!(
            frame
                .data
                .as_deref()
                .is_some_and(|d| d.contains("failed to encode 'usage' event"))
        );
        assert_eq!(encoder.encode(&ChatEvent::data("after")), None);
        assert_eq!(encoder.encode(&ChatEvent::End), Some(Frame::end()));
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_request() {
        use futures_util::StreamExt;
        use tokio_util::sync::CancellationToken;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let stream = encode_events(rx, cancel.clone().drop_guard());
        let mut stream = Box::pin(stream);

        tx.send(ChatEvent::data("one")).unwrap();
        assert!(stream.next().await.is_some());
        assert!(!cancel.is_cancelled());

        drop(stream);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn closed_channel_still_ends_the_stream() {
        use futures_util::StreamExt;
        use tokio_util::sync::CancellationToken;

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ChatEvent::data("one")).unwrap();
        drop(tx);

        let frames: Vec<_> = encode_events(rx, CancellationToken::new().drop_guard())
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
    }
}
