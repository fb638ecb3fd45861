use crate::request::{REASONING_CLOSE, REASONING_OPEN};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use voxchat_core::{ErrorClassifier, PendingToolCall, TransportError};

/// Events delivered to the listener of a completion request. Exactly one
/// of `FunctionCall`, `Finished` or `Error` ends every request.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// Incremental visible text, including reasoning markers.
    Delta(String),
    /// The model asked for these calls. Arguments are complete.
    FunctionCall(Vec<PendingToolCall>),
    /// `true` on a normal end, `false` when the caller cancelled.
    Finished(bool),
    Error(String),
}

/// Accumulated state of one streamed response.
#[derive(Debug, Default)]
pub struct StreamingAnswer {
    visible_text: String,
    reasoning_active: bool,
    pending_tool_calls: Vec<PendingToolCall>,
}

impl StreamingAnswer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visible_text(&self) -> &str {
        &self.visible_text
    }

    pub fn is_reasoning(&self) -> bool {
        self.reasoning_active
    }

    pub fn pending_tool_calls(&self) -> &[PendingToolCall] {
        &self.pending_tool_calls
    }

    /// Apply one `choices[0].delta` object and return the text pieces to
    /// emit, in order. At most one of tool call, content or reasoning is
    /// taken from a delta, in that priority.
    pub fn apply_delta(&mut self, delta: &Value) -> Vec<String> {
        let mut out = Vec::new();

        if let Some(fragment) = delta
            .get("tool_calls")
            .and_then(Value::as_array)
            .and_then(|calls| calls.first())
        {
            let function = fragment.get("function");
            let id = fragment.get("id").and_then(Value::as_str);
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str);
            if let (Some(id), Some(name)) = (id, name) {
                if !id.is_empty() && !name.is_empty() {
                    tracing::debug!(tool_id = %id, name = %name, "tool call started");
                    self.pending_tool_calls.push(PendingToolCall {
                        tool_id: id.to_string(),
                        name: name.to_string(),
                        arguments: String::new(),
                    });
                }
            }
            let arguments = function
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str);
            if let (Some(arguments), Some(current)) = (arguments, self.pending_tool_calls.last_mut()) {
                current.arguments.push_str(arguments);
            }
        } else if let Some(content) = delta.get("content").and_then(Value::as_str) {
            if self.reasoning_active {
                self.reasoning_active = false;
                out.push(REASONING_CLOSE.to_string());
            }
            if !content.is_empty() {
                out.push(content.to_string());
            }
        } else if let Some(reasoning) = delta.get("reasoning_content").and_then(Value::as_str) {
            if !self.reasoning_active {
                self.reasoning_active = true;
                out.push(REASONING_OPEN.to_string());
            }
            if !reasoning.is_empty() {
                out.push(reasoning.to_string());
            }
        }

        for piece in &out {
            self.visible_text.push_str(piece);
        }
        out
    }

    /// The terminal event for a stream that reached `[DONE]`.
    pub fn finish(&self) -> ChatEvent {
        if self.pending_tool_calls.is_empty() {
            ChatEvent::Finished(true)
        } else {
            ChatEvent::FunctionCall(self.pending_tool_calls.clone())
        }
    }
}

/// `{"error": {...}}` or `{"error": "..."}` inside a data event.
fn has_stream_error(event: &Value) -> bool {
    event.get("error").is_some_and(|e| !e.is_null())
}

/// Drive a stream of SSE data payloads to its end.
///
/// Items are the `data` field of each event or a transport failure. Deltas
/// go out on `events` as they arrive; the terminal event is returned so the
/// caller can settle its own state before publishing it. A `StreamReset`
/// item, like a `cancel` notification, ends the request with
/// `Finished(false)`.
pub async fn consume_events<S>(
    mut stream: S,
    cancel: &Notify,
    events: &mpsc::UnboundedSender<ChatEvent>,
    classifier: &ErrorClassifier,
    idle_timeout: Duration,
) -> (StreamingAnswer, ChatEvent)
where
    S: Stream<Item = Result<String, TransportError>> + Unpin,
{
    let mut answer = StreamingAnswer::new();

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.notified() => Err(TransportError::StreamReset),
            next = timeout(idle_timeout, stream.next()) => match next {
                Ok(Some(item)) => item,
                Ok(None) => Err(TransportError::Other(
                    "stream closed before response completed".to_string(),
                )),
                Err(_) => {
                    tracing::warn!("no event for {}ms", idle_timeout.as_millis());
                    Err(TransportError::Timeout)
                }
            },
        };

        let data = match item {
            Ok(data) => data,
            Err(TransportError::StreamReset) => {
                tracing::debug!("completion stream cancelled");
                return (answer, ChatEvent::Finished(false));
            }
            Err(e) => {
                tracing::error!("completion stream failed: {}", e);
                let message = classifier.classify_transport(&e).user_message();
                return (answer, ChatEvent::Error(message));
            }
        };

        tracing::trace!("SSE: {}", data);
        if data == "[DONE]" {
            let terminal = answer.finish();
            tracing::debug!(
                tool_calls = answer.pending_tool_calls().len(),
                chars = answer.visible_text().len(),
                "completion stream done"
            );
            return (answer, terminal);
        }

        let event: Value = match serde_json::from_str(&data) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!("malformed SSE payload: {}", e);
                let message = classifier
                    .classify_transport(&TransportError::Other(format!("malformed event: {}", e)))
                    .user_message();
                return (answer, ChatEvent::Error(message));
            }
        };

        if has_stream_error(&event) {
            let classification = classifier.classify(None, Some(&data), None);
            tracing::error!(category = ?classification.category, "error event in stream");
            return (answer, ChatEvent::Error(classification.user_message()));
        }

        if let Some(delta) = event.pointer("/choices/0/delta") {
            for piece in answer.apply_delta(delta) {
                let _ = events.send(ChatEvent::Delta(piece));
            }
        }
    }
}
