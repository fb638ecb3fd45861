use crate::backend::{CaptureBackend, CaptureStream, DeviceLock};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use voxchat_core::{AudioError, CaptureConfig, ChannelLayout, SampleEncoding};

/// A simulated input device. Frames are paced at a fixed interval and each
/// frame is filled with its wrapping sequence number, so ordering is visible
/// to tests. Config acceptance, start failures and read failures are scriptable.
pub struct SyntheticBackend {
    accepts: fn(&CaptureConfig) -> bool,
    start_failures: Arc<AtomicU32>,
    read_failures: Arc<AtomicU32>,
    frame_interval: Duration,
    lock: DeviceLock,
    live_streams: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
    prepared: Arc<AtomicUsize>,
}

fn accept_all(_: &CaptureConfig) -> bool {
    true
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self {
            accepts: accept_all,
            start_failures: Arc::new(AtomicU32::new(0)),
            read_failures: Arc::new(AtomicU32::new(0)),
            frame_interval: Duration::from_millis(20),
            lock: DeviceLock::new(),
            live_streams: Arc::new(AtomicUsize::new(0)),
            opened: Arc::new(AtomicUsize::new(0)),
            prepared: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Only configs matching `accepts` initialize successfully.
    pub fn accepting(mut self, accepts: fn(&CaptureConfig) -> bool) -> Self {
        self.accepts = accepts;
        self
    }

    /// The next `n` start commands are rejected.
    pub fn with_start_failures(self, n: u32) -> Self {
        self.start_failures.store(n, Ordering::Relaxed);
        self
    }

    /// The next `n` reads fail. `u32::MAX` fails every read.
    pub fn with_read_failures(self, n: u32) -> Self {
        self.read_failures.store(n, Ordering::Relaxed);
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_lock(mut self, lock: DeviceLock) -> Self {
        self.lock = lock;
        self
    }

    /// Number of streams currently holding the simulated device.
    pub fn live_streams(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live_streams)
    }

    /// Number of successful `open` calls so far.
    pub fn opened(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opened)
    }

    /// Number of device resolutions so far.
    pub fn prepared(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.prepared)
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for SyntheticBackend {
    fn prepare(&mut self) -> Result<(), AudioError> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn min_buffer_size(
        &self,
        sample_rate: u32,
        layout: ChannelLayout,
        encoding: SampleEncoding,
    ) -> Option<usize> {
        // 40ms worth of audio
        Some(sample_rate as usize / 25 * layout.channels() as usize * encoding.bytes_per_sample())
    }

    fn open(&mut self, config: &CaptureConfig) -> Result<Box<dyn CaptureStream>, AudioError> {
        if !(self.accepts)(config) {
            return Err(AudioError::StreamBuild(format!(
                "simulated device rejected {} Hz {:?} {:?}",
                config.sample_rate, config.channel_layout, config.source_kind
            )));
        }
        self.live_streams.fetch_add(1, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticStream {
            bytes_per_frame: config.bytes_per_frame(),
            start_failures: Arc::clone(&self.start_failures),
            read_failures: Arc::clone(&self.read_failures),
            frame_interval: self.frame_interval,
            live_streams: Some(Arc::clone(&self.live_streams)),
            recording: false,
            last_frame: None,
            sequence: 0,
        }))
    }

    fn device_lock(&self) -> DeviceLock {
        self.lock.clone()
    }
}

struct SyntheticStream {
    bytes_per_frame: usize,
    start_failures: Arc<AtomicU32>,
    read_failures: Arc<AtomicU32>,
    frame_interval: Duration,
    live_streams: Option<Arc<AtomicUsize>>,
    recording: bool,
    last_frame: Option<Instant>,
    sequence: u8,
}

impl CaptureStream for SyntheticStream {
    fn start(&mut self) -> Result<(), AudioError> {
        let remaining = self.start_failures.load(Ordering::Relaxed);
        if remaining > 0 {
            self.start_failures.store(remaining - 1, Ordering::Relaxed);
            return Err(AudioError::StartFailed("simulated start rejection".to_string()));
        }
        self.recording = true;
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.recording
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        let failures = self.read_failures.load(Ordering::Relaxed);
        if failures > 0 {
            if failures != u32::MAX {
                self.read_failures.store(failures - 1, Ordering::Relaxed);
            }
            return Err(AudioError::DeviceReadFailure("simulated read error".to_string()));
        }
        if !self.recording {
            return Err(AudioError::DeviceReadFailure("not recording".to_string()));
        }

        let now = Instant::now();
        if let Some(last) = self.last_frame {
            if now.duration_since(last) < self.frame_interval {
                return Ok(0);
            }
        }
        self.last_frame = Some(now);

        let n = buf.len() - buf.len() % self.bytes_per_frame;
        buf[..n].fill(self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(n)
    }

    fn stop(&mut self) {
        self.recording = false;
        if let Some(live) = self.live_streams.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxchat_core::SourceKind;

    fn config(sample_rate: u32) -> CaptureConfig {
        CaptureConfig {
            sample_rate,
            channel_layout: ChannelLayout::Mono,
            sample_encoding: SampleEncoding::Pcm16,
            source_kind: SourceKind::Microphone,
            buffer_frame_bytes: 4096,
        }
    }

    #[test]
    fn test_rejects_configs_outside_filter() {
        let mut backend = SyntheticBackend::new().accepting(|c| c.sample_rate == 8000);
        assert!(backend.open(&config(16000)).is_err());
        assert!(backend.open(&config(8000)).is_ok());
    }

    #[test]
    fn test_live_stream_count_tracks_stop_and_drop() {
        let mut backend = SyntheticBackend::new();
        let live = backend.live_streams();
        let mut a = backend.open(&config(16000)).unwrap();
        let b = backend.open(&config(16000)).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 2);
        a.stop();
        a.stop();
        assert_eq!(live.load(Ordering::SeqCst), 1);
        drop(b);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_frames_carry_sequence_numbers() {
        let mut backend = SyntheticBackend::new().with_frame_interval(Duration::ZERO);
        let mut stream = backend.open(&config(16000)).unwrap();
        stream.start().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 8);
        assert_eq!(buf, [0; 8]);
        stream.read(&mut buf).unwrap();
        assert_eq!(buf, [1; 8]);
    }

    #[test]
    fn test_pacing_returns_no_data_between_frames() {
        let mut backend = SyntheticBackend::new().with_frame_interval(Duration::from_secs(60));
        let mut stream = backend.open(&config(16000)).unwrap();
        stream.start().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 8);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_start_failures_are_consumed() {
        let mut backend = SyntheticBackend::new().with_start_failures(1);
        let mut stream = backend.open(&config(16000)).unwrap();
        assert!(stream.start().is_err());
        assert!(!stream.is_recording());
        assert!(stream.start().is_ok());
        assert!(stream.is_recording());
    }
}
