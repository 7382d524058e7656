//! Single-slot, latest-wins handoff between capture and processing.
//!
//! The capture side never waits on the processing side: publishing over an
//! occupied slot replaces the older frame and counts it as dropped. The
//! processing side waits, bounded, for the next frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::frame::Frame;

#[derive(Default)]
pub struct SingleSlotRelay {
    slot: Mutex<Option<Frame>>,
    ready: Condvar,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl SingleSlotRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `frame` in the slot, replacing any unconsumed frame.
    pub fn publish(&self, frame: Frame) {
        let replaced = self.lock().replace(frame);
        self.published.fetch_add(1, Ordering::Relaxed);
        if replaced.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
    }

    /// Remove and return the newest frame, waiting up to `timeout` for one.
    pub fn take(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if let Some(frame) = slot.take() {
                return Some(frame);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = self
                .ready
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Non-blocking take.
    pub fn try_take(&self) -> Option<Frame> {
        self.lock().take()
    }

    /// Discard any pending frame (used when a connection is torn down).
    pub fn clear(&self) {
        self.lock().take();
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    /// Total frames ever published.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Frames overwritten before anyone took them.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Frame>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn latest_frame_wins() {
        let relay = SingleSlotRelay::new();
        for seq in 1..=10 {
            relay.publish(Frame::filled(2, 2, [0, 0, 0], seq));
        }
        let frame = relay.take(Duration::from_millis(1)).unwrap();
        assert_eq!(frame.sequence(), 10);
        assert_eq!(relay.published(), 10);
        assert_eq!(relay.dropped(), 9);
        assert!(relay.try_take().is_none());
    }

    #[test]
    fn take_times_out_on_empty_slot() {
        let relay = SingleSlotRelay::new();
        let started = Instant::now();
        assert!(relay.take(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn take_wakes_on_publish() {
        let relay = Arc::new(SingleSlotRelay::new());
        let producer = {
            let relay = relay.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                relay.publish(Frame::filled(2, 2, [1, 2, 3], 1));
            })
        };
        let frame = relay.take(Duration::from_secs(5)).unwrap();
        assert_eq!(frame.sequence(), 1);
        producer.join().unwrap();
    }

    #[test]
    fn clear_discards_pending_frame() {
        let relay = SingleSlotRelay::new();
        relay.publish(Frame::filled(2, 2, [0, 0, 0], 1));
        relay.clear();
        assert!(relay.is_empty());
        assert_eq!(relay.dropped(), 0);
    }
}
