use crate::recognizer_trait::{RecognitionParams, Recognizer};
use crate::registry::RecognizerRegistry;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use voxchat_audio::{frame_queue, AudioCaptureSession, FrameSender};
use voxchat_core::classify::{truncate_message, MAX_ERROR_MESSAGE_CHARS};
use voxchat_core::{
    AppConfig, AsrError, AudioError, ChannelLayout, ErrorClassifier, MessagesConfig,
    RecognitionSessionState, TranscriptEvent,
};

/// How long `stop` waits for the capture thread before detaching it.
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Events delivered to the session's listener.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    Result(TranscriptEvent),
    /// A final result arrived with auto-stop enabled. The caller should
    /// finalize the turn and call `stop`.
    AutoStop,
    Error(String),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Settings applied at the next `start`.
#[derive(Clone, Default)]
struct Pending {
    api_key: String,
    auto_stop: bool,
    callback: Option<mpsc::UnboundedSender<RecognitionEvent>>,
}

/// State shared by one session's capture thread, recognition task and `stop`.
struct SessionShared {
    state: Arc<AtomicU8>,
    callback: mpsc::UnboundedSender<RecognitionEvent>,
    classifier: Arc<ErrorClassifier>,
    auto_stop: bool,
    /// Set by `stop`. Checked under `emit_lock` before every emit.
    exiting: AtomicBool,
    /// Ends capture without silencing events, so trailing results still drain.
    capture_done: AtomicBool,
    auto_stop_fired: AtomicBool,
    failed: AtomicBool,
    emit_lock: Mutex<()>,
}

impl SessionShared {
    fn on_transcript(&self, event: TranscriptEvent) {
        let _guard = lock(&self.emit_lock);
        if self.exiting.load(Ordering::Acquire) {
            return;
        }
        let is_final = event.is_final;
        let _ = self.callback.send(RecognitionEvent::Result(event));
        if is_final && self.auto_stop && !self.auto_stop_fired.swap(true, Ordering::AcqRel) {
            tracing::debug!("final result, auto-stopping");
            let _ = self.callback.send(RecognitionEvent::AutoStop);
            self.state
                .store(RecognitionSessionState::Stopping.as_u8(), Ordering::Release);
            self.capture_done.store(true, Ordering::Release);
        }
    }

    fn on_completed(&self) {
        let _guard = lock(&self.emit_lock);
        if self.exiting.load(Ordering::Acquire) || self.failed.load(Ordering::Acquire) {
            return;
        }
        tracing::debug!("recognition completed");
        if self.auto_stop && !self.auto_stop_fired.swap(true, Ordering::AcqRel) {
            let _ = self.callback.send(RecognitionEvent::AutoStop);
        }
        self.state
            .store(RecognitionSessionState::Stopping.as_u8(), Ordering::Release);
        self.capture_done.store(true, Ordering::Release);
    }

    fn fail(&self, err: &AsrError) {
        let _guard = lock(&self.emit_lock);
        if self.exiting.load(Ordering::Acquire) || self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::error!("recognition session failed: {}", err);
        let message = user_message(&self.classifier, err);
        let _ = self.callback.send(RecognitionEvent::Error(message));
        self.state
            .store(RecognitionSessionState::Failed.as_u8(), Ordering::Release);
        self.capture_done.store(true, Ordering::Release);
    }

    fn mark_streaming(&self) {
        let _ = self.state.compare_exchange(
            RecognitionSessionState::Capturing.as_u8(),
            RecognitionSessionState::Streaming.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn should_capture(&self) -> bool {
        !self.exiting.load(Ordering::Acquire) && !self.capture_done.load(Ordering::Acquire)
    }
}

/// Text for `RecognitionEvent::Error`: classified like chat errors, with a
/// hint where one applies, and bounded in length.
fn user_message(classifier: &ErrorClassifier, err: &AsrError) -> String {
    match err {
        AsrError::Vendor { code, message } => {
            let body = json!({ "code": code, "message": message }).to_string();
            classifier.classify(None, Some(&body), None).user_message()
        }
        AsrError::Transport(transport) => classifier.classify_transport(transport).user_message(),
        AsrError::Device(e) => {
            truncate_message(&format!("audio capture failed: {}", e), MAX_ERROR_MESSAGE_CHARS)
        }
        other => truncate_message(&other.to_string(), MAX_ERROR_MESSAGE_CHARS),
    }
}

struct ActiveSession {
    shared: Arc<SessionShared>,
    worker: Option<JoinHandle<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

/// Drives one recognition session at a time: capture on a dedicated
/// thread, frames through a bounded queue, recognition on the runtime.
pub struct RecognitionStreamAdapter {
    recognizer: Arc<dyn Recognizer>,
    capture: Arc<AudioCaptureSession>,
    runtime: Handle,
    read_timeout: Duration,
    queue_capacity: usize,
    classifier: Arc<ErrorClassifier>,
    pending: Mutex<Pending>,
    state: Arc<AtomicU8>,
    session: Mutex<Option<ActiveSession>>,
}

impl RecognitionStreamAdapter {
    pub fn new(
        recognizer: Box<dyn Recognizer>,
        capture: Arc<AudioCaptureSession>,
        runtime: Handle,
    ) -> Self {
        Self {
            recognizer: Arc::from(recognizer),
            capture,
            runtime,
            read_timeout: Duration::from_millis(100),
            queue_capacity: 512,
            classifier: Arc::new(ErrorClassifier::default()),
            pending: Mutex::new(Pending::default()),
            state: Arc::new(AtomicU8::new(RecognitionSessionState::Idle.as_u8())),
            session: Mutex::new(None),
        }
    }

    /// Build the configured engine and apply `[asr]` and `[capture]` settings.
    pub async fn from_config(
        config: &AppConfig,
        registry: &RecognizerRegistry,
        capture: Arc<AudioCaptureSession>,
    ) -> Result<Self, AsrError> {
        let mut recognizer = registry.create(&config.asr.engine)?;
        recognizer.initialize(config.asr.engine_config()).await?;

        let mut adapter = Self::new(recognizer, capture, Handle::current())
            .with_messages(config.messages.clone());
        adapter.read_timeout = Duration::from_millis(config.capture.read_timeout_ms);
        adapter.queue_capacity = config.capture.queue_capacity;
        adapter.set_param("api_key", &config.asr.api_key);
        adapter.set_auto_stop(config.asr.auto_stop);
        Ok(adapter)
    }

    /// Message templates for errors reported through `RecognitionEvent::Error`.
    pub fn with_messages(mut self, messages: MessagesConfig) -> Self {
        self.classifier = Arc::new(ErrorClassifier::new(messages));
        self
    }

    pub fn recognizer_name(&self) -> &str {
        self.recognizer.name()
    }

    pub fn state(&self) -> RecognitionSessionState {
        RecognitionSessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RecognitionSessionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Recognized keys: `api_key`, `auto_stop`. Takes effect at the next start.
    pub fn set_param(&self, key: &str, value: &str) {
        let mut pending = lock(&self.pending);
        match key {
            "api_key" => pending.api_key = value.to_string(),
            "auto_stop" => pending.auto_stop = value == "true",
            other => tracing::warn!(key = %other, "ignoring unknown recognition parameter"),
        }
    }

    pub fn set_auto_stop(&self, auto_stop: bool) {
        lock(&self.pending).auto_stop = auto_stop;
    }

    pub fn set_callback(&self, callback: mpsc::UnboundedSender<RecognitionEvent>) {
        lock(&self.pending).callback = Some(callback);
    }

    /// Start a session. Fails without side effects if a session is active,
    /// the credential is missing or no listener is registered.
    pub fn start(&self) -> Result<(), AsrError> {
        let mut session = lock(&self.session);
        if self.state().is_active() {
            return Err(AsrError::SessionActive);
        }

        let pending = lock(&self.pending).clone();
        if self.recognizer.requires_credential() && pending.api_key.is_empty() {
            return Err(AsrError::CredentialMissing);
        }
        let callback = pending.callback.ok_or(AsrError::NoEventSender)?;

        // A finished session may still hold its worker
        if let Some(old) = session.take() {
            self.shutdown(old);
        }

        self.set_state(RecognitionSessionState::Initializing);
        let config = match self.capture.open() {
            Ok(config) => config,
            Err(e) => {
                self.set_state(RecognitionSessionState::Failed);
                return Err(e.into());
            }
        };

        self.set_state(RecognitionSessionState::Capturing);
        if let Err(e) = self.capture.start() {
            self.capture.close();
            self.set_state(RecognitionSessionState::Failed);
            return Err(e.into());
        }

        let shared = Arc::new(SessionShared {
            state: Arc::clone(&self.state),
            callback,
            classifier: Arc::clone(&self.classifier),
            auto_stop: pending.auto_stop,
            exiting: AtomicBool::new(false),
            capture_done: AtomicBool::new(false),
            auto_stop_fired: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            emit_lock: Mutex::new(()),
        });

        let (frames_tx, frames_rx) = frame_queue(self.queue_capacity);
        let downmix = config.channel_layout == ChannelLayout::Stereo;

        let worker = {
            let capture = Arc::clone(&self.capture);
            let shared = Arc::clone(&shared);
            let read_timeout = self.read_timeout;
            std::thread::Builder::new()
                .name("voice-capture".into())
                .spawn(move || capture_loop(capture, frames_tx, shared, downmix, read_timeout))
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                self.capture.close();
                self.set_state(RecognitionSessionState::Failed);
                return Err(AsrError::InitializationFailed(e.to_string()));
            }
        };

        let params = RecognitionParams {
            api_key: pending.api_key,
            sample_rate: config.sample_rate,
        };
        let task = {
            let recognizer = Arc::clone(&self.recognizer);
            let shared = Arc::clone(&shared);
            self.runtime.spawn(async move {
                let (sentence_tx, mut sentence_rx) = mpsc::unbounded_channel();
                let recognize = recognizer.recognize(params, frames_rx, sentence_tx);
                tokio::pin!(recognize);

                let outcome = loop {
                    tokio::select! {
                        biased;
                        Some(event) = sentence_rx.recv() => shared.on_transcript(event),
                        outcome = &mut recognize => break outcome,
                    }
                };
                while let Ok(event) = sentence_rx.try_recv() {
                    shared.on_transcript(event);
                }

                match outcome {
                    Ok(()) => shared.on_completed(),
                    Err(e) => shared.fail(&e),
                }
            })
        };

        tracing::info!(
            recognizer = self.recognizer.name(),
            sample_rate = config.sample_rate,
            auto_stop = pending.auto_stop,
            "recognition session started"
        );
        *session = Some(ActiveSession {
            shared,
            worker: Some(worker),
            task: Some(task),
        });
        Ok(())
    }

    /// End the session and release the device. A no-op when idle, and safe
    /// to call repeatedly or from any thread. Blocks for at most
    /// [`WORKER_JOIN_TIMEOUT`] waiting for the capture thread.
    pub fn stop(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            self.shutdown(session);
            self.set_state(RecognitionSessionState::Stopped);
            tracing::info!("recognition session stopped");
        }
    }

    /// Same as [`stop`](Self::stop); there is nothing to roll back.
    pub fn cancel(&self) {
        self.stop();
    }

    fn shutdown(&self, mut session: ActiveSession) {
        if self.state().is_active() {
            self.set_state(RecognitionSessionState::Stopping);
        }
        {
            let _guard = lock(&session.shared.emit_lock);
            session.shared.exiting.store(true, Ordering::Release);
        }

        if let Some(task) = session.task.take() {
            task.abort();
        }

        if let Some(worker) = session.worker.take() {
            let deadline = Instant::now() + WORKER_JOIN_TIMEOUT;
            while !worker.is_finished() && Instant::now() < deadline {
                std::thread::sleep(JOIN_POLL);
            }
            if worker.is_finished() {
                if worker.join().is_err() {
                    tracing::error!("capture thread panicked");
                }
            } else {
                tracing::warn!("capture thread did not exit in time, detaching");
            }
        }

        self.capture.close();
    }
}

impl Drop for RecognitionStreamAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    capture: Arc<AudioCaptureSession>,
    frames: FrameSender,
    shared: Arc<SessionShared>,
    downmix: bool,
    read_timeout: Duration,
) {
    tracing::debug!(downmix, "capture loop running");
    while shared.should_capture() && !frames.is_receiver_closed() {
        match capture.read_frame(read_timeout) {
            Ok(Some(frame)) => {
                let frame = if downmix {
                    frame.downmix_stereo_pcm16()
                } else {
                    frame
                };
                frames.push(frame);
                shared.mark_streaming();
            }
            Ok(None) => {}
            Err(AudioError::NotOpen) => break,
            Err(e) => {
                shared.fail(&AsrError::Device(e));
                break;
            }
        }
    }
    let dropped = frames.dropped();
    if dropped > 0 {
        tracing::warn!(dropped, "frames evicted during session");
    }
    // Dropping the sender ends the recognizer's audio
    drop(frames);
    capture.close();
    tracing::debug!("capture loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::null_recognizer::NullRecognizer;
    use voxchat_audio::{DeviceLock, SyntheticBackend};
    use voxchat_core::TransportError;

    fn adapter_with(recognizer: NullRecognizer, backend: SyntheticBackend) -> RecognitionStreamAdapter {
        let capture = Arc::new(AudioCaptureSession::new(Box::new(backend), 4096));
        RecognitionStreamAdapter::new(Box::new(recognizer), capture, Handle::current())
    }

    #[test]
    fn test_user_message_uses_configured_templates() {
        let messages = MessagesConfig {
            timeout: "recognition timed out".to_string(),
            ..MessagesConfig::default()
        };
        let classifier = ErrorClassifier::new(messages);

        let timeout = AsrError::Transport(TransportError::Timeout);
        assert!(user_message(&classifier, &timeout).starts_with("recognition timed out"));

        let device = AsrError::Device(AudioError::DeviceReadFailure("gone".to_string()));
        assert_eq!(
            user_message(&classifier, &device),
            "audio capture failed: audio read failed: gone"
        );
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let adapter = adapter_with(NullRecognizer::new(), SyntheticBackend::new());
        adapter.stop();
        adapter.stop();
        assert_eq!(adapter.state(), RecognitionSessionState::Idle);
    }

    #[tokio::test]
    async fn test_start_without_callback_fails() {
        let adapter = adapter_with(NullRecognizer::new(), SyntheticBackend::new());
        assert!(matches!(adapter.start(), Err(AsrError::NoEventSender)));
        assert_eq!(adapter.state(), RecognitionSessionState::Idle);
    }

    #[tokio::test]
    async fn test_set_param_is_buffered() {
        let adapter = adapter_with(NullRecognizer::new(), SyntheticBackend::new());
        adapter.set_param("api_key", "sk-1");
        adapter.set_param("auto_stop", "true");
        adapter.set_param("colour", "blue");
        let pending = lock(&adapter.pending).clone();
        assert_eq!(pending.api_key, "sk-1");
        assert!(pending.auto_stop);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_device_unavailable_fails_start_and_releases() {
        let lock_ = DeviceLock::new();
        let backend = SyntheticBackend::new()
            .accepting(|_| false)
            .with_lock(lock_.clone());
        let adapter = adapter_with(NullRecognizer::new(), backend);
        let (tx, _rx) = mpsc::unbounded_channel();
        adapter.set_callback(tx);

        match adapter.start() {
            Err(AsrError::Device(AudioError::DeviceUnavailable)) => {}
            other => panic!("expected DeviceUnavailable, got {:?}", other.err()),
        }
        assert_eq!(adapter.state(), RecognitionSessionState::Failed);
        assert!(!lock_.is_held());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_start_while_active_is_rejected() {
        let adapter = adapter_with(NullRecognizer::new(), SyntheticBackend::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        adapter.set_callback(tx);
        adapter.start().unwrap();
        assert!(adapter.state().is_active());
        assert!(matches!(adapter.start(), Err(AsrError::SessionActive)));
        adapter.stop();
        assert_eq!(adapter.state(), RecognitionSessionState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_reaches_streaming() {
        let backend = SyntheticBackend::new().with_frame_interval(Duration::from_millis(5));
        let adapter = adapter_with(NullRecognizer::new(), backend);
        let (tx, _rx) = mpsc::unbounded_channel();
        adapter.set_callback(tx);
        adapter.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while adapter.state() != RecognitionSessionState::Streaming && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(adapter.state(), RecognitionSessionState::Streaming);
        adapter.stop();
    }
}
