pub mod backend;
pub mod capture;
pub mod device;
pub mod queue;
pub mod session;
pub mod synthetic;

pub use backend::{CaptureBackend, CaptureStream, DeviceLease, DeviceLock};
pub use capture::{CaptureNode, CpalBackend};
pub use device::DeviceManager;
pub use queue::{frame_queue, FrameReceiver, FrameSender};
pub use session::AudioCaptureSession;
pub use synthetic::SyntheticBackend;

use ringbuf::traits::Split;
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Create a ring buffer split into producer and consumer halves.
pub fn create_ring_buffer<T>(capacity: usize) -> (HeapProd<T>, HeapCons<T>) {
    HeapRb::<T>::new(capacity).split()
}
