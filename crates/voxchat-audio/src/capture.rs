use crate::backend::{CaptureBackend, CaptureStream, DeviceLock};
use crate::device::DeviceManager;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{
    SampleFormat, SampleRate, Stream, StreamConfig, SupportedBufferSize, SupportedStreamConfigRange,
};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::{HeapCons, HeapProd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use voxchat_core::{AudioError, CaptureConfig, ChannelLayout, SampleEncoding, SourceKind};

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

/// Seconds of audio the ring buffer between the device callback and the reader can hold.
const RING_SECONDS: usize = 2;

// ── CpalBackend ───────────────────────────────────────────────

/// Hardware capture through the host's default audio API.
pub struct CpalBackend {
    device_name: String,
    lock: DeviceLock,
    /// Input formats of `device_name`, resolved by `prepare`.
    formats: Vec<SupportedStreamConfigRange>,
}

impl CpalBackend {
    pub fn new(device_name: &str) -> Self {
        Self {
            device_name: device_name.to_string(),
            lock: DeviceLock::system(),
            formats: Vec::new(),
        }
    }

    fn device_for(&self, source: SourceKind) -> Result<String, AudioError> {
        match source {
            SourceKind::Microphone => Ok(self.device_name.clone()),
            SourceKind::Default => Ok("default".to_string()),
            SourceKind::VoiceRecognition | SourceKind::VoiceCommunication => Err(
                AudioError::StreamBuild(format!("source {:?} is not available on this host", source)),
            ),
        }
    }
}

impl CaptureBackend for CpalBackend {
    fn prepare(&mut self) -> Result<(), AudioError> {
        let device = DeviceManager::new().get_input_device(&self.device_name)?;
        self.formats = device
            .supported_input_configs()
            .map_err(|e| AudioError::DeviceEnumeration(e.to_string()))?
            .collect();
        tracing::debug!(
            device = %self.device_name,
            formats = self.formats.len(),
            "input formats resolved"
        );
        Ok(())
    }

    fn min_buffer_size(
        &self,
        sample_rate: u32,
        layout: ChannelLayout,
        encoding: SampleEncoding,
    ) -> Option<usize> {
        let range = matching_format(&self.formats, sample_rate, layout)?;
        let bytes_per_frame = encoding.bytes_per_sample() * layout.channels() as usize;
        Some(match range.buffer_size() {
            SupportedBufferSize::Range { min, .. } => *min as usize * bytes_per_frame,
            SupportedBufferSize::Unknown => 0,
        })
    }

    fn open(&mut self, config: &CaptureConfig) -> Result<Box<dyn CaptureStream>, AudioError> {
        let device_name = self.device_for(config.source_kind)?;
        let node = CaptureNode::spawn(device_name, *config)?;
        Ok(Box::new(node))
    }

    fn device_lock(&self) -> DeviceLock {
        self.lock.clone()
    }
}

/// Sample formats the capture callback can convert to PCM16, best first.
const CONVERTIBLE_FORMATS: [SampleFormat; 3] =
    [SampleFormat::I16, SampleFormat::F32, SampleFormat::U16];

/// The best supported range for `sample_rate` and `layout` whose sample
/// format can be converted to PCM16.
fn matching_format(
    formats: &[SupportedStreamConfigRange],
    sample_rate: u32,
    layout: ChannelLayout,
) -> Option<&SupportedStreamConfigRange> {
    CONVERTIBLE_FORMATS.iter().find_map(|&format| {
        formats.iter().find(|c| {
            c.sample_format() == format
                && c.channels() == layout.channels()
                && c.min_sample_rate().0 <= sample_rate
                && sample_rate <= c.max_sample_rate().0
        })
    })
}

// ── CaptureNode ───────────────────────────────────────────────

enum StreamCommand {
    Play(mpsc::SyncSender<Result<(), AudioError>>),
    Close,
}

/// A cpal input stream owned by a dedicated thread. The stream handle itself
/// cannot leave that thread, so the node talks to it over a command channel
/// and reads samples out of a ring buffer.
pub struct CaptureNode {
    consumer: HeapCons<u8>,
    commands: mpsc::Sender<StreamCommand>,
    thread: Option<JoinHandle<()>>,
    recording: Arc<AtomicBool>,
    status: Arc<AtomicU8>,
    bytes_per_frame: usize,
}

impl CaptureNode {
    pub fn spawn(device_name: String, config: CaptureConfig) -> Result<Self, AudioError> {
        let bytes_per_frame = config.bytes_per_frame();
        let capacity = (config.sample_rate as usize * bytes_per_frame * RING_SECONDS)
            .max(config.buffer_frame_bytes);
        let (producer, consumer) = crate::create_ring_buffer::<u8>(capacity);

        let recording = Arc::new(AtomicBool::new(false));
        let status = Arc::new(AtomicU8::new(STATUS_OK));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (cmd_tx, cmd_rx) = mpsc::channel();

        let thread_recording = Arc::clone(&recording);
        let thread_status = Arc::clone(&status);
        let thread = std::thread::Builder::new()
            .name("capture-stream".into())
            .spawn(move || {
                run_stream(
                    &device_name,
                    &config,
                    producer,
                    thread_recording,
                    thread_status,
                    ready_tx,
                    cmd_rx,
                )
            })
            .map_err(|e| AudioError::StreamBuild(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                consumer,
                commands: cmd_tx,
                thread: Some(thread),
                recording,
                status,
                bytes_per_frame,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::StreamBuild("capture thread exited during setup".to_string()))
            }
        }
    }
}

impl CaptureStream for CaptureNode {
    fn start(&mut self) -> Result<(), AudioError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.commands
            .send(StreamCommand::Play(reply_tx))
            .map_err(|_| AudioError::StartFailed("capture thread is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| AudioError::StartFailed("capture thread is gone".to_string()))?
    }

    fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        if self.status.load(Ordering::Relaxed) == STATUS_ERROR {
            return Err(AudioError::DeviceReadFailure(
                "capture stream reported an error".to_string(),
            ));
        }
        let mut n = self.consumer.occupied_len().min(buf.len());
        n -= n % self.bytes_per_frame;
        Ok(self.consumer.pop_slice(&mut buf[..n]))
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.commands.send(StreamCommand::Close);
            if thread.join().is_err() {
                tracing::error!("capture thread panicked");
            }
        }
        self.recording.store(false, Ordering::Relaxed);
    }
}

impl Drop for CaptureNode {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_stream(
    device_name: &str,
    config: &CaptureConfig,
    producer: HeapProd<u8>,
    recording: Arc<AtomicBool>,
    status: Arc<AtomicU8>,
    ready: mpsc::SyncSender<Result<(), AudioError>>,
    commands: mpsc::Receiver<StreamCommand>,
) {
    let stream = match build_stream(device_name, config, producer, status) {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Ok(command) = commands.recv() {
        match command {
            StreamCommand::Play(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| AudioError::StartFailed(e.to_string()));
                recording.store(result.is_ok(), Ordering::Relaxed);
                let _ = reply.send(result);
            }
            StreamCommand::Close => break,
        }
    }

    if let Err(e) = stream.pause() {
        tracing::debug!("pausing capture stream failed: {}", e);
    }
    recording.store(false, Ordering::Relaxed);
}

fn build_stream(
    device_name: &str,
    config: &CaptureConfig,
    mut producer: HeapProd<u8>,
    status: Arc<AtomicU8>,
) -> Result<Stream, AudioError> {
    let device = DeviceManager::new().get_input_device(device_name)?;
    let formats: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| AudioError::DeviceEnumeration(e.to_string()))?
        .collect();
    let sample_format = matching_format(&formats, config.sample_rate, config.channel_layout)
        .map(|c| c.sample_format())
        .ok_or_else(|| {
            AudioError::StreamBuild(format!(
                "{} Hz {:?} has no PCM16-convertible sample format",
                config.sample_rate, config.channel_layout
            ))
        })?;

    // The device period is left to the host; buffer_frame_bytes sizes the ring.
    let stream_config = StreamConfig {
        channels: config.channel_layout.channels(),
        sample_rate: SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let bytes_per_frame = config.bytes_per_frame();
    let mut scratch = Vec::new();
    // Only whole frames go in; overflow is dropped
    let mut push = move |pcm: &[u8]| {
        let mut n = pcm.len().min(producer.vacant_len());
        n -= n % bytes_per_frame;
        producer.push_slice(&pcm[..n]);
    };

    let err_callback = move |err: cpal::StreamError| {
        tracing::error!("capture stream error: {}", err);
        status.store(STATUS_ERROR, Ordering::Relaxed);
    };

    tracing::debug!(?sample_format, "building input stream");
    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                i16_to_pcm16_le(data, &mut scratch);
                push(&scratch);
            },
            err_callback,
            None,
        ),
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                f32_to_pcm16_le(data, &mut scratch);
                push(&scratch);
            },
            err_callback,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                u16_to_pcm16_le(data, &mut scratch);
                push(&scratch);
            },
            err_callback,
            None,
        ),
        other => {
            return Err(AudioError::StreamBuild(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    };
    stream.map_err(|e| AudioError::StreamBuild(e.to_string()))
}

/// Convert normalized float samples to signed 16-bit little-endian PCM.
pub fn f32_to_pcm16_le(samples: &[f32], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
}

pub fn i16_to_pcm16_le(samples: &[i16], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
}

/// Offset-binary 16-bit samples: 32768 is silence.
pub fn u16_to_pcm16_le(samples: &[u16], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(samples.len() * 2);
    for &s in samples {
        let v = (s ^ 0x8000) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
}
