use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use voxchat_core::{AudioError, CaptureConfig, ChannelLayout, SampleEncoding};

/// A source of capture streams, typically one physical input device.
pub trait CaptureBackend: Send {
    /// Resolve the device and its supported formats. Called once at the start
    /// of every open, before any `min_buffer_size` query.
    fn prepare(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    /// Minimum buffer size in bytes for the format, or `None` if the device
    /// does not support it at all.
    fn min_buffer_size(
        &self,
        sample_rate: u32,
        layout: ChannelLayout,
        encoding: SampleEncoding,
    ) -> Option<usize>;

    /// Initialize the device with `config`. The stream is not started.
    fn open(&mut self, config: &CaptureConfig) -> Result<Box<dyn CaptureStream>, AudioError>;

    /// The lock guarding exclusive use of the underlying hardware.
    fn device_lock(&self) -> DeviceLock;
}

/// An initialized capture stream.
pub trait CaptureStream: Send {
    fn start(&mut self) -> Result<(), AudioError>;

    fn is_recording(&self) -> bool;

    /// Copy available PCM bytes into `buf`. `Ok(0)` means nothing is ready yet.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError>;

    /// Stop recording and release the device. Idempotent.
    fn stop(&mut self);
}

// ── DeviceLock ────────────────────────────────────────────────

/// Exclusive-ownership flag for an audio input.
#[derive(Clone, Default)]
pub struct DeviceLock {
    held: Arc<AtomicBool>,
}

impl DeviceLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide lock shared by all hardware-backed sessions.
    pub fn system() -> Self {
        static SYSTEM: OnceLock<DeviceLock> = OnceLock::new();
        SYSTEM.get_or_init(DeviceLock::new).clone()
    }

    /// Take the lock, or `None` if another session already holds it.
    pub fn try_acquire(&self) -> Option<DeviceLease> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DeviceLease {
                held: Arc::clone(&self.held),
            })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Held while a session owns the device; released on drop.
pub struct DeviceLease {
    held: Arc<AtomicBool>,
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}
