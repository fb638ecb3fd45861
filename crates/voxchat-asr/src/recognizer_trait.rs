use async_trait::async_trait;
use tokio::sync::mpsc;
use voxchat_audio::FrameReceiver;
use voxchat_core::{AsrError, TranscriptEvent};

/// Per-session values handed to a recognizer when streaming starts.
#[derive(Debug, Clone)]
pub struct RecognitionParams {
    pub api_key: String,
    /// Sample rate of the active capture config. Audio is always mono PCM16.
    pub sample_rate: u32,
}

#[async_trait]
pub trait Recognizer: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&mut self, config: toml::Value) -> Result<(), AsrError>;

    /// Whether `start` must refuse to run without an API key.
    fn requires_credential(&self) -> bool {
        true
    }

    /// Stream `frames` to the service and forward each recognized sentence
    /// to `events`. Returns once the frame queue has ended and the service
    /// has acknowledged the end of audio.
    async fn recognize(
        &self,
        params: RecognitionParams,
        frames: FrameReceiver,
        events: mpsc::UnboundedSender<TranscriptEvent>,
    ) -> Result<(), AsrError>;
}
