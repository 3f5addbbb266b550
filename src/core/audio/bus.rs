use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::frame::{AudioFrame, FRAME_DURATION_MS};

/// Default queue capacity: 320 ms of audio, comfortably above the 200 ms
/// jitter-buffer floor the bus must hold.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Bounded, order-preserving FIFO for audio frames.
///
/// Producers never block: pushing onto a full queue evicts the oldest frame
/// and bumps the drop counter. Consumers see every surviving frame exactly
/// once, in FIFO order; a gap in `seq` is the drop signal.
pub struct FrameQueue {
    inner: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
    direction: &'static str,
}

impl FrameQueue {
    pub fn new(capacity: usize, direction: &'static str) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            direction,
        }
    }

    /// Enqueue a frame, evicting the oldest one if the queue is full.
    pub fn push(&self, frame: AudioFrame) {
        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                let evicted = queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_backpressure_drop(self.direction);
                if let Some(old) = evicted {
                    debug!(
                        direction = self.direction,
                        seq = old.seq,
                        "frame queue full, dropped oldest"
                    );
                }
            }
            queue.push_back(frame);
        }
        self.notify.notify_one();
    }

    /// Dequeue the oldest frame, if any.
    pub fn pop(&self) -> Option<AudioFrame> {
        self.inner.lock().pop_front()
    }

    /// Dequeue the oldest frame, waiting until one is available.
    pub async fn recv(&self) -> AudioFrame {
        loop {
            if let Some(frame) = self.pop() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    /// Drop everything beyond the first `keep` frames.
    ///
    /// Used by barge-in: at most 40 ms (two frames) of already-queued audio
    /// may still play out. Returns the number of frames flushed.
    pub fn keep_front(&self, keep: usize) -> usize {
        let mut queue = self.inner.lock();
        let flushed = queue.len().saturating_sub(keep);
        queue.truncate(keep);
        flushed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Total frames evicted under backpressure since creation.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue depth expressed as buffered milliseconds.
    pub fn buffered_ms(&self) -> u64 {
        self.len() as u64 * FRAME_DURATION_MS
    }
}

/// Per-session duplex pair of frame queues.
///
/// The bus belongs to exactly one call and is never shared across calls.
#[derive(Clone)]
pub struct FrameBus {
    pub inbound: Arc<FrameQueue>,
    pub outbound: Arc<FrameQueue>,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inbound: Arc::new(FrameQueue::new(capacity, "inbound")),
            outbound: Arc::new(FrameQueue::new(capacity, "outbound")),
        }
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame::silence(seq, seq * FRAME_DURATION_MS)
    }

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new(8, "inbound");
        for seq in 0..5 {
            queue.push(frame(seq));
        }
        for seq in 0..5 {
            assert_eq!(queue.pop().unwrap().seq, seq);
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let queue = FrameQueue::new(3, "inbound");
        for seq in 0..5 {
            queue.push(frame(seq));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped_frames(), 2);
        // Oldest two evicted; seq gap marks the drop
        assert_eq!(queue.pop().unwrap().seq, 2);
        assert_eq!(queue.pop().unwrap().seq, 3);
        assert_eq!(queue.pop().unwrap().seq, 4);
    }

    #[test]
    fn test_keep_front_flushes_tail() {
        let queue = FrameQueue::new(16, "outbound");
        for seq in 0..10 {
            queue.push(frame(seq));
        }
        let flushed = queue.keep_front(2);
        assert_eq!(flushed, 8);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.buffered_ms(), 40);
        assert_eq!(queue.pop().unwrap().seq, 0);
        assert_eq!(queue.pop().unwrap().seq, 1);
    }

    #[test]
    fn test_keep_front_on_short_queue_is_noop() {
        let queue = FrameQueue::new(16, "outbound");
        queue.push(frame(0));
        assert_eq!(queue.keep_front(2), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_default_capacity_covers_jitter_budget() {
        let bus = FrameBus::default();
        for seq in 0..DEFAULT_QUEUE_CAPACITY as u64 {
            bus.inbound.push(frame(seq));
        }
        assert!(bus.inbound.buffered_ms() >= 200);
        assert_eq!(bus.inbound.dropped_frames(), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(8, "inbound"));
        let consumer = Arc::clone(&queue);
        let handle = tokio::spawn(async move { consumer.recv().await });

        // Give the consumer a moment to park
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(frame(42));

        let received = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("recv should complete")
            .unwrap();
        assert_eq!(received.seq, 42);
    }
}
