//! Owned frames and the bounded handoff channel between pipeline stages.
//!
//! A `Frame` is a fully owned BGR pixel buffer. Ownership transfers to the
//! consumer on handoff; nothing downstream ever shares a mutable buffer with
//! the capture thread.
//!
//! `FrameChannel` is a bounded single-producer/single-consumer queue:
//! - `offer` never blocks; a full channel drops the new frame (recency over
//!   completeness, bounding end-to-end latency under load)
//! - `poll` blocks the consumer up to a short timeout so it can observe a
//!   stop signal promptly

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};

/// Smallest permitted channel capacity.
pub const MIN_CHANNEL_CAPACITY: usize = 1;
/// Largest permitted channel capacity. Anything deeper only adds latency.
pub const MAX_CHANNEL_CAPACITY: usize = 4;

/// One captured image: height x width x 3 bytes, BGR channel order.
#[derive(Debug)]
pub struct Frame {
    pub camera_id: String,
    pub width: u32,
    pub height: u32,
    /// BGR pixel data, row-major, `height * width * 3` bytes.
    pub data: Vec<u8>,
    pub captured_at: SystemTime,
}

impl Frame {
    pub fn new(camera_id: impl Into<String>, width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), (width as usize) * (height as usize) * 3);
        Self {
            camera_id: camera_id.into(),
            width,
            height,
            data,
            captured_at: SystemTime::now(),
        }
    }

    /// BGR triple at pixel (x, y). Callers must stay in bounds.
    #[inline]
    pub fn bgr(&self, x: u32, y: u32) -> (u8, u8, u8) {
        let idx = ((y as usize) * (self.width as usize) + (x as usize)) * 3;
        (self.data[idx], self.data[idx + 1], self.data[idx + 2])
    }

    /// Luma at pixel (x, y) using the usual BT.601 weights.
    #[inline]
    pub fn gray(&self, x: u32, y: u32) -> f32 {
        let (b, g, r) = self.bgr(x, y);
        0.114 * b as f32 + 0.587 * g as f32 + 0.299 * r as f32
    }
}

struct ChannelInner {
    queue: Mutex<VecDeque<Frame>>,
    available: Condvar,
    capacity: usize,
    offered: AtomicU64,
    dropped: AtomicU64,
}

/// Producer half of a frame channel. One per camera worker.
pub struct FrameSender {
    inner: Arc<ChannelInner>,
}

/// Consumer half of a frame channel. One per engine.
pub struct FrameReceiver {
    inner: Arc<ChannelInner>,
}

/// Create a bounded frame channel. Capacity is clamped to 1..=4.
pub fn frame_channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    let capacity = capacity.clamp(MIN_CHANNEL_CAPACITY, MAX_CHANNEL_CAPACITY);
    let inner = Arc::new(ChannelInner {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        available: Condvar::new(),
        capacity,
        offered: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        FrameSender {
            inner: inner.clone(),
        },
        FrameReceiver { inner },
    )
}

impl FrameSender {
    /// Hand a frame to the consumer. Never blocks: returns `false` and drops
    /// the frame when the channel is full.
    pub fn offer(&self, frame: Frame) -> bool {
        self.inner.offered.fetch_add(1, Ordering::Relaxed);
        let mut queue = lock_queue(&self.inner.queue);
        if queue.len() >= self.inner.capacity {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        queue.push_back(frame);
        drop(queue);
        self.inner.available.notify_one();
        true
    }

    /// Frames offered so far (accepted or dropped).
    pub fn offered(&self) -> u64 {
        self.inner.offered.load(Ordering::Relaxed)
    }

    /// Frames dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl FrameReceiver {
    /// Take the next frame, blocking up to `timeout`. Returns `None` on
    /// timeout so the consumer loop can check its stop flag.
    pub fn poll(&self, timeout: Duration) -> Option<Frame> {
        let mut queue = lock_queue(&self.inner.queue);
        if let Some(frame) = queue.pop_front() {
            return Some(frame);
        }
        let (mut queue, result) = self
            .inner
            .available
            .wait_timeout(queue, timeout)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = result;
        queue.pop_front()
    }

    /// Frames currently buffered.
    pub fn len(&self) -> usize {
        lock_queue(&self.inner.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_queue(queue: &Mutex<VecDeque<Frame>>) -> std::sync::MutexGuard<'_, VecDeque<Frame>> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frame(tag: u8) -> Frame {
        Frame::new("cam0", 4, 4, vec![tag; 4 * 4 * 3])
    }

    #[test]
    fn offer_and_poll_transfer_ownership() {
        let (tx, rx) = frame_channel(2);
        assert!(tx.offer(test_frame(1)));
        let frame = rx.poll(Duration::from_millis(10)).expect("frame");
        assert_eq!(frame.data[0], 1);
        assert!(rx.is_empty());
    }

    #[test]
    fn full_channel_drops_new_frame_without_blocking() {
        let (tx, rx) = frame_channel(1);
        assert!(tx.offer(test_frame(1)));
        assert!(!tx.offer(test_frame(2)));
        assert_eq!(tx.dropped(), 1);
        assert_eq!(tx.offered(), 2);

        // The retained frame is the older one: recency is favored only in
        // the sense that the producer never stalls.
        let frame = rx.poll(Duration::from_millis(10)).expect("frame");
        assert_eq!(frame.data[0], 1);
    }

    #[test]
    fn poll_times_out_on_empty_channel() {
        let (_tx, rx) = frame_channel(2);
        let start = std::time::Instant::now();
        assert!(rx.poll(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn capacity_is_clamped() {
        let (tx, _rx) = frame_channel(64);
        for i in 0..MAX_CHANNEL_CAPACITY {
            assert!(tx.offer(test_frame(i as u8)));
        }
        assert!(!tx.offer(test_frame(99)));
    }

    #[test]
    fn poll_wakes_on_offer_from_other_thread() {
        let (tx, rx) = frame_channel(2);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.offer(test_frame(7));
        });
        let frame = rx.poll(Duration::from_millis(500)).expect("frame");
        assert_eq!(frame.data[0], 7);
        handle.join().expect("producer thread");
    }

    #[test]
    fn gray_uses_luma_weights() {
        let mut data = vec![0u8; 4 * 4 * 3];
        // pixel (1, 0) pure red in BGR order
        data[3..6].copy_from_slice(&[0, 0, 255]);
        let frame = Frame::new("cam0", 4, 4, data);
        assert!((frame.gray(1, 0) - 0.299 * 255.0).abs() < 1e-3);
        assert_eq!(frame.gray(0, 0), 0.0);
    }
}
