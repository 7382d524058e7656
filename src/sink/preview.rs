use std::sync::{Arc, Mutex, PoisonError};

use crate::error::SinkError;

use super::{FrameSink, ProcessedFrame};

#[derive(Clone, Debug)]
pub struct PreviewFrame {
    pub jpeg: Arc<[u8]>,
    pub sequence: u64,
    pub frame_counter: u64,
    pub captured_at_ms: u64,
}

/// Most recent encoded frame, readable from any thread.
#[derive(Clone, Default)]
pub struct LatestPreview {
    slot: Arc<Mutex<Option<PreviewFrame>>>,
}

impl LatestPreview {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<PreviewFrame> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, frame: PreviewFrame) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }
}

/// Keeps the latest JPEG for local display.
pub struct PreviewSink {
    preview: LatestPreview,
}

impl PreviewSink {
    pub fn new(preview: LatestPreview) -> Self {
        Self { preview }
    }
}

impl FrameSink for PreviewSink {
    fn name(&self) -> &'static str {
        "preview"
    }

    fn consume(&mut self, frame: &ProcessedFrame) -> Result<(), SinkError> {
        self.preview.store(PreviewFrame {
            jpeg: frame.jpeg()?,
            sequence: frame.frame.sequence(),
            frame_counter: frame.frame_counter,
            captured_at_ms: frame.frame.captured_at_ms(),
        });
        Ok(())
    }
}
