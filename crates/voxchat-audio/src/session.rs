use crate::backend::{CaptureBackend, CaptureStream, DeviceLease};
use crate::capture::CpalBackend;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use voxchat_core::{
    AudioError, AudioFrame, CaptureConfig, CaptureSettings, ChannelLayout, SampleEncoding,
    SourceKind,
};

/// Sample rates tried when opening a device, most preferred first.
pub const SAMPLE_RATES: [u32; 4] = [16000, 44100, 22050, 8000];

/// Input sources tried for each sample rate.
pub const SOURCE_KINDS: [SourceKind; 4] = [
    SourceKind::Microphone,
    SourceKind::Default,
    SourceKind::VoiceRecognition,
    SourceKind::VoiceCommunication,
];

/// Channel layouts tried for each source.
pub const CHANNEL_LAYOUTS: [ChannelLayout; 2] = [ChannelLayout::Mono, ChannelLayout::Stereo];

pub const START_ATTEMPTS: u32 = 3;
pub const START_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const MAX_CONSECUTIVE_READ_ERRORS: u32 = 5;

/// Bytes requested from the device per read.
pub const READ_CHUNK_BYTES: usize = 1024;

const NO_DATA_POLL: Duration = Duration::from_millis(10);

/// Every (sample rate, source, layout) combination in probing order.
pub fn candidate_configs() -> impl Iterator<Item = (u32, SourceKind, ChannelLayout)> {
    SAMPLE_RATES.into_iter().flat_map(|rate| {
        SOURCE_KINDS.into_iter().flat_map(move |source| {
            CHANNEL_LAYOUTS
                .into_iter()
                .map(move |layout| (rate, source, layout))
        })
    })
}

struct Inner {
    backend: Box<dyn CaptureBackend>,
    stream: Option<Box<dyn CaptureStream>>,
    config: Option<CaptureConfig>,
    lease: Option<DeviceLease>,
    consecutive_errors: u32,
    read_buf: Vec<u8>,
}

/// Exclusive owner of an audio input for the duration of one recording.
///
/// All methods take `&self` so the session can be shared between the
/// capture thread and whoever stops it.
pub struct AudioCaptureSession {
    inner: Mutex<Inner>,
    min_buffer_bytes: usize,
}

impl AudioCaptureSession {
    pub fn new(backend: Box<dyn CaptureBackend>, min_buffer_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                backend,
                stream: None,
                config: None,
                lease: None,
                consecutive_errors: 0,
                read_buf: vec![0u8; READ_CHUNK_BYTES],
            }),
            min_buffer_bytes,
        }
    }

    /// Session on the host's audio hardware.
    pub fn with_cpal(settings: &CaptureSettings) -> Self {
        Self::new(
            Box::new(CpalBackend::new(&settings.device_name)),
            settings.min_buffer_bytes,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Probe candidate configs in priority order and keep the first one the
    /// device accepts. Opening an already open session returns its config.
    pub fn open(&self) -> Result<CaptureConfig, AudioError> {
        let mut inner = self.lock();
        if let Some(config) = inner.config {
            return Ok(config);
        }

        let lease = inner
            .backend
            .device_lock()
            .try_acquire()
            .ok_or(AudioError::DeviceBusy)?;

        if let Err(e) = inner.backend.prepare() {
            tracing::error!("capture device could not be resolved: {}", e);
            return Err(AudioError::DeviceUnavailable);
        }

        let encoding = SampleEncoding::Pcm16;
        for (sample_rate, source_kind, channel_layout) in candidate_configs() {
            let Some(min_buffer) =
                inner
                    .backend
                    .min_buffer_size(sample_rate, channel_layout, encoding)
            else {
                tracing::trace!(sample_rate, ?channel_layout, "format not supported");
                continue;
            };

            let config = CaptureConfig {
                sample_rate,
                channel_layout,
                sample_encoding: encoding,
                source_kind,
                buffer_frame_bytes: min_buffer.max(self.min_buffer_bytes),
            };

            match inner.backend.open(&config) {
                Ok(stream) => {
                    tracing::info!(
                        sample_rate,
                        ?source_kind,
                        ?channel_layout,
                        buffer_bytes = config.buffer_frame_bytes,
                        "capture device opened"
                    );
                    inner.stream = Some(stream);
                    inner.config = Some(config);
                    inner.lease = Some(lease);
                    inner.consecutive_errors = 0;
                    return Ok(config);
                }
                Err(e) => {
                    tracing::debug!(sample_rate, ?source_kind, ?channel_layout, "config rejected: {}", e);
                }
            }
        }

        drop(lease);
        tracing::error!("no capture configuration could be initialized");
        Err(AudioError::DeviceUnavailable)
    }

    /// Begin recording, retrying a rejected start a few times.
    pub fn start(&self) -> Result<(), AudioError> {
        let mut last_error = String::new();
        for attempt in 1..=START_ATTEMPTS {
            {
                let mut inner = self.lock();
                let stream = inner.stream.as_mut().ok_or(AudioError::NotOpen)?;
                if stream.is_recording() {
                    return Ok(());
                }
                match stream.start() {
                    Ok(()) if stream.is_recording() => {
                        tracing::debug!(attempt, "recording started");
                        return Ok(());
                    }
                    Ok(()) => last_error = "device did not enter recording state".to_string(),
                    Err(e) => last_error = e.to_string(),
                }
            }
            tracing::warn!(attempt, "start rejected: {}", last_error);
            if attempt < START_ATTEMPTS {
                std::thread::sleep(START_RETRY_DELAY);
            }
        }
        Err(AudioError::StartFailed(format!(
            "gave up after {} attempts: {}",
            START_ATTEMPTS, last_error
        )))
    }

    /// Block up to `timeout` for the next frame.
    ///
    /// `Ok(None)` is a transient no-data signal, including an isolated read
    /// failure. Once failures run [`MAX_CONSECUTIVE_READ_ERRORS`] in a row the
    /// read fails with `DeviceReadFailure` and the session should be closed.
    pub fn read_frame(&self, timeout: Duration) -> Result<Option<AudioFrame>, AudioError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.lock();
                let Inner {
                    stream,
                    read_buf,
                    consecutive_errors,
                    ..
                } = &mut *inner;
                let stream = stream.as_mut().ok_or(AudioError::NotOpen)?;

                match stream.read(read_buf) {
                    Ok(0) => {}
                    Ok(n) => {
                        *consecutive_errors = 0;
                        tracing::trace!(bytes = n, "frame read");
                        return Ok(Some(AudioFrame::new(read_buf[..n].to_vec())));
                    }
                    Err(e) => {
                        *consecutive_errors += 1;
                        if *consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                            tracing::error!(failures = *consecutive_errors, "giving up on device: {}", e);
                            return Err(AudioError::DeviceReadFailure(format!(
                                "{} consecutive read failures, last: {}",
                                consecutive_errors, e
                            )));
                        }
                        tracing::warn!(failures = *consecutive_errors, "read failed: {}", e);
                        return Ok(None);
                    }
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(NO_DATA_POLL);
        }
    }

    /// Stop recording and release the device. Safe to call repeatedly and
    /// from any thread.
    pub fn close(&self) {
        let mut inner = self.lock();
        if let Some(mut stream) = inner.stream.take() {
            stream.stop();
            tracing::debug!("capture session closed");
        }
        inner.config = None;
        inner.lease = None;
        inner.consecutive_errors = 0;
    }

    pub fn config(&self) -> Option<CaptureConfig> {
        self.lock().config
    }

    pub fn is_open(&self) -> bool {
        self.lock().stream.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.lock()
            .stream
            .as_ref()
            .map(|s| s.is_recording())
            .unwrap_or(false)
    }
}

impl Drop for AudioCaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}
