use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use voxchat_asr::{NullRecognizer, RecognitionEvent, RecognitionStreamAdapter, RecognizerRegistry};
use voxchat_audio::{AudioCaptureSession, DeviceLock, SyntheticBackend};
use voxchat_core::{AppConfig, AsrError, RecognitionSessionState, TranscriptEvent};

fn event(text: &str, is_final: bool) -> TranscriptEvent {
    TranscriptEvent {
        text: text.to_string(),
        is_final,
    }
}

fn adapter(recognizer: NullRecognizer, backend: SyntheticBackend) -> RecognitionStreamAdapter {
    let capture = Arc::new(AudioCaptureSession::new(Box::new(backend), 4096));
    RecognitionStreamAdapter::new(
        Box::new(recognizer),
        capture,
        tokio::runtime::Handle::current(),
    )
}

async fn next(rx: &mut mpsc::UnboundedReceiver<RecognitionEvent>) -> RecognitionEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auto_stop_fires_once_after_final_result() {
    let recognizer = NullRecognizer::scripted(vec![
        event("what", false),
        event("what time", false),
        event("what time is it", true),
    ]);
    let backend = SyntheticBackend::new().with_frame_interval(Duration::from_millis(5));
    let adapter = adapter(recognizer, backend);
    let (tx, mut rx) = mpsc::unbounded_channel();
    adapter.set_callback(tx);
    adapter.set_auto_stop(true);
    adapter.start().unwrap();

    assert_eq!(next(&mut rx).await, RecognitionEvent::Result(event("what", false)));
    assert_eq!(next(&mut rx).await, RecognitionEvent::Result(event("what time", false)));
    assert_eq!(
        next(&mut rx).await,
        RecognitionEvent::Result(event("what time is it", true))
    );
    assert_eq!(next(&mut rx).await, RecognitionEvent::AutoStop);

    // Capture winds down and the recognizer completes without a second AutoStop
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(adapter.state(), RecognitionSessionState::Stopping);

    adapter.stop();
    assert_eq!(adapter.state(), RecognitionSessionState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_without_auto_stop_results_flow_until_stop() {
    let recognizer = NullRecognizer::scripted(vec![event("hi", true), event("there", true)]);
    let backend = SyntheticBackend::new().with_frame_interval(Duration::from_millis(5));
    let adapter = adapter(recognizer, backend);
    let (tx, mut rx) = mpsc::unbounded_channel();
    adapter.set_callback(tx);
    adapter.start().unwrap();

    assert_eq!(next(&mut rx).await, RecognitionEvent::Result(event("hi", true)));
    assert_eq!(next(&mut rx).await, RecognitionEvent::Result(event("there", true)));
    assert!(adapter.state().is_active());

    adapter.stop();
    assert_eq!(adapter.state(), RecognitionSessionState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_twice_equals_stop_once() {
    let lock = DeviceLock::new();
    let backend = SyntheticBackend::new().with_lock(lock.clone());
    let live = backend.live_streams();
    let adapter = adapter(NullRecognizer::new(), backend);
    let (tx, mut rx) = mpsc::unbounded_channel();
    adapter.set_callback(tx);
    adapter.start().unwrap();
    assert!(lock.is_held());

    adapter.stop();
    let after_first = adapter.state();
    adapter.stop();
    assert_eq!(adapter.state(), after_first);
    assert_eq!(after_first, RecognitionSessionState::Stopped);
    assert!(!lock.is_held());
    assert_eq!(live.load(std::sync::atomic::Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_events_after_stop() {
    // One event per frame, far more than will ever be delivered
    let script = (0..1000).map(|i| event(&i.to_string(), false)).collect();
    let backend = SyntheticBackend::new().with_frame_interval(Duration::from_millis(1));
    let adapter = adapter(NullRecognizer::scripted(script), backend);
    let (tx, mut rx) = mpsc::unbounded_channel();
    adapter.set_callback(tx);
    adapter.start().unwrap();

    next(&mut rx).await;
    adapter.stop();
    while rx.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_read_failure_reports_error_and_fails() {
    let lock = DeviceLock::new();
    let backend = SyntheticBackend::new()
        .with_read_failures(u32::MAX)
        .with_lock(lock.clone());
    let adapter = adapter(NullRecognizer::new(), backend);
    let (tx, mut rx) = mpsc::unbounded_channel();
    adapter.set_callback(tx);
    adapter.start().unwrap();

    match next(&mut rx).await {
        RecognitionEvent::Error(message) => assert!(message.contains("read")),
        other => panic!("expected Error, got {:?}", other),
    }
    assert_eq!(adapter.state(), RecognitionSessionState::Failed);

    // Failed is not active, so the worker is gone and the device released
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!lock.is_held());
    adapter.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recognizer_failure_reports_error() {
    let recognizer = NullRecognizer::new().failing_after(2);
    let backend = SyntheticBackend::new().with_frame_interval(Duration::from_millis(5));
    let adapter = adapter(recognizer, backend);
    let (tx, mut rx) = mpsc::unbounded_channel();
    adapter.set_callback(tx);
    adapter.set_auto_stop(true);
    adapter.start().unwrap();

    match next(&mut rx).await {
        RecognitionEvent::Error(message) => assert!(message.contains("NullFailure")),
        other => panic!("expected Error, got {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    // A failed session never auto-stops
    assert!(rx.try_recv().is_err());
    assert_eq!(adapter.state(), RecognitionSessionState::Failed);
    adapter.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_api_key_failure_carries_hint() {
    let recognizer =
        NullRecognizer::new().failing_with(1, "InvalidApiKey", "Invalid API-key provided.");
    let backend = SyntheticBackend::new().with_frame_interval(Duration::from_millis(5));
    let adapter = adapter(recognizer, backend);
    let (tx, mut rx) = mpsc::unbounded_channel();
    adapter.set_callback(tx);
    adapter.start().unwrap();

    match next(&mut rx).await {
        RecognitionEvent::Error(message) => {
            assert!(message.contains("InvalidApiKey"));
            assert!(message.contains("hint:"));
            assert!(message.chars().count() <= 503);
        }
        other => panic!("expected Error, got {:?}", other),
    }
    assert_eq!(adapter.state(), RecognitionSessionState::Failed);
    adapter.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_long_vendor_message_is_truncated() {
    let long = "x".repeat(2000);
    let recognizer = NullRecognizer::new().failing_with(1, "InternalError", &long);
    let backend = SyntheticBackend::new().with_frame_interval(Duration::from_millis(5));
    let adapter = adapter(recognizer, backend);
    let (tx, mut rx) = mpsc::unbounded_channel();
    adapter.set_callback(tx);
    adapter.start().unwrap();

    match next(&mut rx).await {
        RecognitionEvent::Error(message) => {
            assert!(message.ends_with("..."));
            assert!(message.chars().count() <= 503);
        }
        other => panic!("expected Error, got {:?}", other),
    }
    adapter.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_after_stop() {
    let recognizer = NullRecognizer::scripted(vec![event("again", false)]);
    let backend = SyntheticBackend::new().with_frame_interval(Duration::from_millis(5));
    let adapter = adapter(recognizer, backend);
    let (tx, mut rx) = mpsc::unbounded_channel();
    adapter.set_callback(tx);

    adapter.start().unwrap();
    assert_eq!(next(&mut rx).await, RecognitionEvent::Result(event("again", false)));
    adapter.stop();

    adapter.start().unwrap();
    assert_eq!(next(&mut rx).await, RecognitionEvent::Result(event("again", false)));
    adapter.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_credential_fails_fast() {
    let config = AppConfig::from_toml_str(
        r#"
        [asr]
        engine = "dashscope"
        api_key = ""
        "#,
    )
    .unwrap();
    let capture = Arc::new(AudioCaptureSession::new(Box::new(SyntheticBackend::new()), 4096));
    let adapter = RecognitionStreamAdapter::from_config(&config, &RecognizerRegistry::new(), capture)
        .await
        .unwrap();
    assert_eq!(adapter.recognizer_name(), "dashscope");
    let (tx, _rx) = mpsc::unbounded_channel();
    adapter.set_callback(tx);

    assert!(matches!(adapter.start(), Err(AsrError::CredentialMissing)));
    assert_eq!(adapter.state(), RecognitionSessionState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_from_config_unknown_engine() {
    let config = AppConfig::from_toml_str(
        r#"
        [asr]
        engine = "whisper"
        "#,
    )
    .unwrap();
    let capture = Arc::new(AudioCaptureSession::new(Box::new(SyntheticBackend::new()), 4096));
    let result =
        RecognitionStreamAdapter::from_config(&config, &RecognizerRegistry::new(), capture).await;
    assert!(matches!(result, Err(AsrError::EngineNotFound(_))));
}
