use crate::recognizer_trait::{RecognitionParams, Recognizer};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use voxchat_audio::FrameReceiver;
use voxchat_core::{AsrError, TranscriptEvent};

#[derive(Debug, Default, Deserialize)]
struct NullSettings {
    /// Transcript texts, one emitted per received frame. The last is final.
    #[serde(default)]
    transcript: Vec<String>,
}

/// Offline recognizer that plays back a fixed transcript, one event per
/// received frame. Useful without credentials and in tests.
pub struct NullRecognizer {
    script: Vec<TranscriptEvent>,
    fail_after: Option<usize>,
    fail_code: String,
    fail_message: Option<String>,
    frames_received: Arc<AtomicUsize>,
}

impl NullRecognizer {
    pub fn new() -> Self {
        Self {
            script: Vec::new(),
            fail_after: None,
            fail_code: "NullFailure".to_string(),
            fail_message: None,
            frames_received: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn scripted(script: Vec<TranscriptEvent>) -> Self {
        Self {
            script,
            ..Self::new()
        }
    }

    /// Fail with a vendor error once `n` frames have arrived.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Like [`failing_after`](Self::failing_after) with a chosen vendor code
    /// and message.
    pub fn failing_with(mut self, n: usize, code: &str, message: &str) -> Self {
        self.fail_after = Some(n);
        self.fail_code = code.to_string();
        self.fail_message = Some(message.to_string());
        self
    }

    pub fn frames_received(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.frames_received)
    }
}

impl Default for NullRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Recognizer for NullRecognizer {
    fn name(&self) -> &str {
        "null"
    }

    async fn initialize(&mut self, config: toml::Value) -> Result<(), AsrError> {
        let settings: NullSettings = config
            .try_into()
            .map_err(|e: toml::de::Error| AsrError::InitializationFailed(e.to_string()))?;
        if !settings.transcript.is_empty() {
            let last = settings.transcript.len() - 1;
            self.script = settings
                .transcript
                .into_iter()
                .enumerate()
                .map(|(i, text)| TranscriptEvent {
                    text,
                    is_final: i == last,
                })
                .collect();
        }
        Ok(())
    }

    fn requires_credential(&self) -> bool {
        false
    }

    async fn recognize(
        &self,
        params: RecognitionParams,
        mut frames: FrameReceiver,
        events: mpsc::UnboundedSender<TranscriptEvent>,
    ) -> Result<(), AsrError> {
        tracing::debug!(sample_rate = params.sample_rate, "null recognizer streaming");
        let mut script = self.script.iter();
        while let Some(frame) = frames.recv().await {
            let count = self.frames_received.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::trace!("null recognizer got frame #{count}, {} bytes", frame.len());
            if self.fail_after.is_some_and(|n| count >= n) {
                return Err(AsrError::Vendor {
                    code: self.fail_code.clone(),
                    message: self
                        .fail_message
                        .clone()
                        .unwrap_or_else(|| format!("scripted failure after {} frames", count)),
                });
            }
            if let Some(event) = script.next() {
                let _ = events.send(event.clone());
            }
        }
        Ok(())
    }
}
