use crate::recognizer_trait::{RecognitionParams, Recognizer};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use voxchat_audio::FrameReceiver;
use voxchat_core::{AsrError, TranscriptEvent, TransportError};

pub const DEFAULT_URL: &str = "wss://dashscope.aliyuncs.com/api-ws/v1/inference";
pub const DEFAULT_MODEL: &str = "paraformer-realtime-v2";

#[derive(Debug, Clone, Deserialize)]
pub struct DashScopeSettings {
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_true")]
    pub punctuation_prediction: bool,

    #[serde(default = "default_true")]
    pub inverse_text_normalization: bool,

    #[serde(default)]
    pub disfluency_removal: bool,
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for DashScopeSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            model: default_model(),
            punctuation_prediction: true,
            inverse_text_normalization: true,
            disfluency_removal: false,
        }
    }
}

// ── Wire protocol ─────────────────────────────────────────────

/// An inbound message on the duplex recognition socket.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    TaskStarted,
    Sentence(TranscriptEvent),
    /// A result without usable text (heartbeat or empty sentence).
    Empty,
    TaskFinished,
    TaskFailed { code: String, message: String },
}

#[derive(Deserialize)]
struct Envelope {
    header: Header,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct Header {
    event: String,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct Sentence {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    sentence_end: bool,
    #[serde(default)]
    heartbeat: bool,
}

pub fn parse_event(text: &str) -> Result<ServerEvent, AsrError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| AsrError::Protocol(e.to_string()))?;

    match envelope.header.event.as_str() {
        "task-started" => Ok(ServerEvent::TaskStarted),
        "task-finished" => Ok(ServerEvent::TaskFinished),
        "task-failed" => Ok(ServerEvent::TaskFailed {
            code: envelope.header.error_code.unwrap_or_default(),
            message: envelope.header.error_message.unwrap_or_default(),
        }),
        "result-generated" => {
            let sentence = envelope
                .payload
                .pointer("/output/sentence")
                .cloned()
                .ok_or_else(|| AsrError::Protocol("result without sentence".to_string()))?;
            let sentence: Sentence =
                serde_json::from_value(sentence).map_err(|e| AsrError::Protocol(e.to_string()))?;
            match sentence.text {
                Some(text) if !text.is_empty() && !sentence.heartbeat => {
                    Ok(ServerEvent::Sentence(TranscriptEvent {
                        text,
                        is_final: sentence.sentence_end,
                    }))
                }
                _ => Ok(ServerEvent::Empty),
            }
        }
        other => Err(AsrError::Protocol(format!("unknown event: {}", other))),
    }
}

pub fn run_task_command(
    task_id: &str,
    settings: &DashScopeSettings,
    sample_rate: u32,
) -> Value {
    json!({
        "header": {
            "action": "run-task",
            "task_id": task_id,
            "streaming": "duplex"
        },
        "payload": {
            "task_group": "audio",
            "task": "asr",
            "function": "recognition",
            "model": settings.model,
            "parameters": {
                "format": "pcm",
                "sample_rate": sample_rate,
                "punctuation_prediction_enabled": settings.punctuation_prediction,
                "inverse_text_normalization_enabled": settings.inverse_text_normalization,
                "disfluency_removal_enabled": settings.disfluency_removal
            },
            "input": {}
        }
    })
}

pub fn finish_task_command(task_id: &str) -> Value {
    json!({
        "header": {
            "action": "finish-task",
            "task_id": task_id,
            "streaming": "duplex"
        },
        "payload": { "input": {} }
    })
}

// ── Recognizer ────────────────────────────────────────────────

/// Real-time recognition over the DashScope duplex WebSocket API.
pub struct DashScopeRecognizer {
    settings: DashScopeSettings,
}

impl DashScopeRecognizer {
    pub fn new() -> Self {
        Self {
            settings: DashScopeSettings::default(),
        }
    }

    pub fn settings(&self) -> &DashScopeSettings {
        &self.settings
    }
}

impl Default for DashScopeRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

fn transport(e: WsError) -> AsrError {
    let detail = e.to_string();
    let lower = detail.to_ascii_lowercase();
    let err = match &e {
        WsError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => TransportError::Timeout,
        _ if lower.contains("certificate") || lower.contains("tls") => TransportError::Tls(detail),
        WsError::Io(_) => TransportError::Connect(detail),
        _ => TransportError::Other(detail),
    };
    AsrError::Transport(err)
}

#[async_trait]
impl Recognizer for DashScopeRecognizer {
    fn name(&self) -> &str {
        "dashscope"
    }

    async fn initialize(&mut self, config: toml::Value) -> Result<(), AsrError> {
        self.settings = config
            .try_into()
            .map_err(|e: toml::de::Error| AsrError::InitializationFailed(e.to_string()))?;
        tracing::debug!(url = %self.settings.url, model = %self.settings.model, "dashscope recognizer configured");
        Ok(())
    }

    async fn recognize(
        &self,
        params: RecognitionParams,
        mut frames: FrameReceiver,
        events: mpsc::UnboundedSender<TranscriptEvent>,
    ) -> Result<(), AsrError> {
        let mut request = self.settings.url.as_str().into_client_request().map_err(transport)?;
        let auth = HeaderValue::from_str(&format!("bearer {}", params.api_key))
            .map_err(|_| AsrError::InitializationFailed("API key is not a valid header value".to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(transport)?;
        let (mut sink, mut stream) = ws_stream.split();

        let task_id = uuid::Uuid::new_v4().simple().to_string();
        let run_task = run_task_command(&task_id, &self.settings, params.sample_rate);
        sink.send(Message::Text(run_task.to_string()))
            .await
            .map_err(transport)?;
        tracing::debug!(task_id = %task_id, "run-task sent");

        // Audio may only flow once the task is acknowledged
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match parse_event(&text)? {
                    ServerEvent::TaskStarted => break,
                    ServerEvent::TaskFailed { code, message } => {
                        return Err(AsrError::Vendor { code, message })
                    }
                    other => tracing::trace!("ignoring {:?} before task-started", other),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(AsrError::Transport(TransportError::Other(
                        "socket closed before task started".to_string(),
                    )))
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(transport(e)),
            }
        }
        tracing::debug!(task_id = %task_id, "task started");

        let mut audio_done = false;
        loop {
            tokio::select! {
                frame = frames.recv(), if !audio_done => {
                    match frame {
                        Some(frame) => {
                            sink.send(Message::Binary(frame.bytes)).await.map_err(transport)?;
                        }
                        None => {
                            audio_done = true;
                            sink.send(Message::Text(finish_task_command(&task_id).to_string()))
                                .await
                                .map_err(transport)?;
                            tracing::debug!(task_id = %task_id, "finish-task sent");
                        }
                    }
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => match parse_event(&text)? {
                            ServerEvent::Sentence(event) => {
                                tracing::trace!(is_final = event.is_final, "sentence: {}", event.text);
                                let _ = events.send(event);
                            }
                            ServerEvent::TaskFinished => {
                                tracing::debug!(task_id = %task_id, "task finished");
                                let _ = sink.close().await;
                                return Ok(());
                            }
                            ServerEvent::TaskFailed { code, message } => {
                                tracing::error!(code = %code, "recognition task failed: {}", message);
                                return Err(AsrError::Vendor { code, message });
                            }
                            ServerEvent::TaskStarted | ServerEvent::Empty => {}
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            return if audio_done {
                                Ok(())
                            } else {
                                Err(AsrError::Transport(TransportError::Other(
                                    "socket closed by server".to_string(),
                                )))
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(transport(e)),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_intermediate_and_final_sentences() {
        let partial = r#"{"header":{"event":"result-generated","task_id":"t"},
            "payload":{"output":{"sentence":{"text":"你好","sentence_end":false}}}}"#;
        let done = r#"{"header":{"event":"result-generated","task_id":"t"},
            "payload":{"output":{"sentence":{"text":"你好世界。","sentence_end":true}}}}"#;
        assert_eq!(
            parse_event(partial).unwrap(),
            ServerEvent::Sentence(TranscriptEvent {
                text: "你好".to_string(),
                is_final: false
            })
        );
        assert_eq!(
            parse_event(done).unwrap(),
            ServerEvent::Sentence(TranscriptEvent {
                text: "你好世界。".to_string(),
                is_final: true
            })
        );
    }

    #[test]
    fn test_parse_empty_and_heartbeat_sentences() {
        let empty = r#"{"header":{"event":"result-generated"},
            "payload":{"output":{"sentence":{"text":"","sentence_end":false}}}}"#;
        let heartbeat = r#"{"header":{"event":"result-generated"},
            "payload":{"output":{"sentence":{"text":"x","heartbeat":true}}}}"#;
        assert_eq!(parse_event(empty).unwrap(), ServerEvent::Empty);
        assert_eq!(parse_event(heartbeat).unwrap(), ServerEvent::Empty);
    }

    #[test]
    fn test_parse_task_failed() {
        let failed = r#"{"header":{"event":"task-failed","error_code":"InvalidApiKey",
            "error_message":"Invalid API-key provided."},"payload":{}}"#;
        assert_eq!(
            parse_event(failed).unwrap(),
            ServerEvent::TaskFailed {
                code: "InvalidApiKey".to_string(),
                message: "Invalid API-key provided.".to_string()
            }
        );
    }

    #[test]
    fn test_parse_lifecycle_events() {
        assert_eq!(
            parse_event(r#"{"header":{"event":"task-started"},"payload":{}}"#).unwrap(),
            ServerEvent::TaskStarted
        );
        assert_eq!(
            parse_event(r#"{"header":{"event":"task-finished"},"payload":{}}"#).unwrap(),
            ServerEvent::TaskFinished
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_event("not json"), Err(AsrError::Protocol(_))));
        assert!(matches!(
            parse_event(r#"{"header":{"event":"mystery"}}"#),
            Err(AsrError::Protocol(_))
        ));
        assert!(matches!(
            parse_event(r#"{"header":{"event":"result-generated"},"payload":{}}"#),
            Err(AsrError::Protocol(_))
        ));
    }

    #[test]
    fn test_run_task_command_shape() {
        let cmd = run_task_command("abc", &DashScopeSettings::default(), 44100);
        assert_eq!(cmd["header"]["action"], "run-task");
        assert_eq!(cmd["header"]["streaming"], "duplex");
        assert_eq!(cmd["payload"]["model"], "paraformer-realtime-v2");
        let p = &cmd["payload"]["parameters"];
        assert_eq!(p["format"], "pcm");
        assert_eq!(p["sample_rate"], 44100);
        assert_eq!(p["punctuation_prediction_enabled"], true);
        assert_eq!(p["inverse_text_normalization_enabled"], true);
        assert_eq!(p["disfluency_removal_enabled"], false);
    }

    #[test]
    fn test_finish_task_command_shape() {
        let cmd = finish_task_command("abc");
        assert_eq!(cmd["header"]["action"], "finish-task");
        assert_eq!(cmd["header"]["task_id"], "abc");
    }

    #[tokio::test]
    async fn test_initialize_from_table() {
        let mut recognizer = DashScopeRecognizer::new();
        let config: toml::Value = toml::from_str(
            r#"
            model = "paraformer-realtime-8k-v2"
            disfluency_removal = true
            "#,
        )
        .unwrap();
        recognizer.initialize(config).await.unwrap();
        assert_eq!(recognizer.settings().model, "paraformer-realtime-8k-v2");
        assert!(recognizer.settings().disfluency_removal);
        assert_eq!(recognizer.settings().url, DEFAULT_URL);
    }

    #[test]
    fn test_socket_errors_map_to_transport_kinds() {
        let timed_out = WsError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(
            transport(timed_out),
            AsrError::Transport(TransportError::Timeout)
        ));

        let refused = WsError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(
            transport(refused),
            AsrError::Transport(TransportError::Connect(_))
        ));

        assert!(matches!(
            transport(WsError::ConnectionClosed),
            AsrError::Transport(TransportError::Other(_))
        ));
    }
}
