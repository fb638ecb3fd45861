use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use voxchat_core::AudioFrame;

/// Bounded frame hand-off between the blocking capture thread and the async
/// network sender.
///
/// Pushing never blocks. When the queue is full the oldest frame is evicted,
/// so a stalled consumer costs old audio rather than starving the device.
pub fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let shared = Arc::new(Shared {
        frames: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        capacity: capacity.max(1),
        notify: Notify::new(),
        sender_closed: AtomicBool::new(false),
        receiver_closed: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
    });
    (
        FrameSender {
            shared: Arc::clone(&shared),
        },
        FrameReceiver { shared },
    )
}

struct Shared {
    frames: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    notify: Notify,
    sender_closed: AtomicBool,
    receiver_closed: AtomicBool,
    dropped: AtomicU64,
}

impl Shared {
    fn frames(&self) -> MutexGuard<'_, VecDeque<AudioFrame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct FrameSender {
    shared: Arc<Shared>,
}

impl FrameSender {
    /// Enqueue a frame. Returns `false` once the receiver is gone.
    pub fn push(&self, frame: AudioFrame) -> bool {
        if self.shared.receiver_closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut frames = self.shared.frames();
            if frames.len() >= self.shared.capacity {
                frames.pop_front();
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    tracing::warn!(dropped, "frame queue full, evicting oldest frames");
                }
            }
            frames.push_back(frame);
        }
        self.shared.notify.notify_one();
        true
    }

    pub fn is_receiver_closed(&self) -> bool {
        self.shared.receiver_closed.load(Ordering::Acquire)
    }

    /// Frames evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        self.shared.sender_closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

pub struct FrameReceiver {
    shared: Arc<Shared>,
}

impl FrameReceiver {
    /// Wait for the next frame. Returns `None` after the sender is dropped
    /// and the queue has drained.
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        loop {
            if let Some(frame) = self.try_recv() {
                return Some(frame);
            }
            if self.shared.sender_closed.load(Ordering::Acquire) {
                // A push may have landed between the pop and the flag check
                return self.try_recv();
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<AudioFrame> {
        self.shared.frames().pop_front()
    }

    pub fn len(&self) -> usize {
        self.shared.frames().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.shared.receiver_closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(b: u8) -> AudioFrame {
        AudioFrame::new(vec![b; 4])
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (tx, mut rx) = frame_queue(8);
        for i in 0..3 {
            assert!(tx.push(frame(i)));
        }
        drop(tx);
        assert_eq!(rx.recv().await, Some(frame(0)));
        assert_eq!(rx.recv().await, Some(frame(1)));
        assert_eq!(rx.recv().await, Some(frame(2)));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_full_queue_evicts_oldest() {
        let (tx, mut rx) = frame_queue(2);
        tx.push(frame(1));
        tx.push(frame(2));
        tx.push(frame(3));
        assert_eq!(tx.dropped(), 1);
        assert_eq!(rx.try_recv(), Some(frame(2)));
        assert_eq!(rx.try_recv(), Some(frame(3)));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_push_after_receiver_drop_reports_closed() {
        let (tx, rx) = frame_queue(2);
        drop(rx);
        assert!(tx.is_receiver_closed());
        assert!(!tx.push(frame(1)));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push_from_thread() {
        let (tx, mut rx) = frame_queue(4);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            tx.push(frame(7));
        });
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(frame(7)));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_recv_ends_when_sender_dropped() {
        let (tx, mut rx) = frame_queue(4);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(tx);
        });
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(got.is_none());
        handle.join().unwrap();
    }
}
