pub mod classify;
pub mod config;
pub mod error;
pub mod state;
pub mod types;

pub use classify::{classify, Classification, ErrorCategory, ErrorClassifier};
pub use config::{AppConfig, AsrConfig, CaptureSettings, ChatConfig, ChatVendor, MessagesConfig};
pub use error::{AsrError, AudioError, ChatError, ConfigError, TransportError};
pub use state::RecognitionSessionState;
pub use types::{
    Attachment, AttachmentKind, AudioFrame, CaptureConfig, ChannelLayout, ConversationTurn,
    PendingToolCall, Role, SampleEncoding, SourceKind, ToolCall, ToolSchema, TranscriptEvent,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_frame_creation() {
        let frame = AudioFrame::new(vec![0, 1, 2, 3]);
        assert_eq!(frame.len(), 4);
        assert!(!frame.is_empty());
    }

    #[test]
    fn test_transcript_event_fields() {
        let event = TranscriptEvent {
            text: "hello world".to_string(),
            is_final: true,
        };
        assert_eq!(event.text, "hello world");
        assert!(event.is_final);
    }

    #[test]
    fn test_pending_tool_call_default_is_empty() {
        let call = PendingToolCall::default();
        assert!(call.tool_id.is_empty());
        assert!(call.arguments.is_empty());
    }
}
