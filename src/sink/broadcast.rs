use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::detect::{Detection, DetectionCounts};
use crate::error::SinkError;
use crate::frame::wall_clock_millis;

use super::{FrameSink, IdleNotice, ProcessedFrame};

/// One push to remote subscribers. The JPEG travels beside the JSON fields.
#[derive(Clone, Debug, Serialize)]
pub struct BroadcastEvent {
    #[serde(skip)]
    pub jpeg: Option<Arc<[u8]>>,
    pub counts: DetectionCounts,
    pub detections: Vec<Detection>,
    pub fps: Option<f32>,
    pub fps_avg: Option<f32>,
    pub frame_counter: u64,
    pub sequence: Option<u64>,
    pub error: Option<String>,
    pub timestamp_ms: u64,
}

impl BroadcastEvent {
    pub fn from_frame(frame: &ProcessedFrame, jpeg: Option<Arc<[u8]>>) -> Self {
        Self {
            jpeg,
            counts: frame.counts.clone(),
            detections: frame.detections.clone(),
            fps: frame.fps,
            fps_avg: frame.fps_avg,
            frame_counter: frame.frame_counter,
            sequence: Some(frame.frame.sequence()),
            error: frame.error.clone(),
            timestamp_ms: frame.frame.captured_at_ms(),
        }
    }

    pub fn from_notice(notice: &IdleNotice) -> Self {
        Self {
            jpeg: None,
            counts: DetectionCounts::new(),
            detections: Vec::new(),
            fps: None,
            fps_avg: None,
            frame_counter: notice.frame_counter,
            sequence: None,
            error: Some(notice.message.clone()),
            timestamp_ms: wall_clock_millis(),
        }
    }
}

/// Fan-out point for remote subscribers.
///
/// Each subscriber gets a bounded channel. Delivery uses `try_send`: a slow
/// subscriber misses events instead of stalling the processing thread, and a
/// subscriber whose receiver is gone is dropped on the next publish.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    subscribers: Arc<Mutex<Vec<SyncSender<Arc<BroadcastEvent>>>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, capacity: usize) -> Receiver<Arc<BroadcastEvent>> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver `event` to every subscriber with room. Returns how many got it.
    pub fn publish(&self, event: BroadcastEvent) -> usize {
        let event = Arc::new(event);
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Sink adapter feeding a `BroadcastHub`.
pub struct BroadcastSink {
    hub: BroadcastHub,
}

impl BroadcastSink {
    pub fn new(hub: BroadcastHub) -> Self {
        Self { hub }
    }
}

impl FrameSink for BroadcastSink {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn consume(&mut self, frame: &ProcessedFrame) -> Result<(), SinkError> {
        if self.hub.subscriber_count() == 0 {
            return Ok(());
        }
        let jpeg = frame.jpeg()?;
        self.hub
            .publish(BroadcastEvent::from_frame(frame, Some(jpeg)));
        Ok(())
    }

    fn idle(&mut self, notice: &IdleNotice) -> Result<(), SinkError> {
        self.hub.publish(BroadcastEvent::from_notice(notice));
        Ok(())
    }
}
