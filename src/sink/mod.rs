//! Fan-out sinks.
//!
//! Every processed frame is offered to each sink in turn. A sink failure is
//! logged and counted; it never stops the pipeline or the other sinks.
//!
//! - `PreviewSink`: latest JPEG for local display / the HTTP adapter
//! - `RecordingSink`: MJPEG file
//! - `BroadcastSink`: push to in-process subscribers via `BroadcastHub`
//! - `MqttSink`: push to an MQTT broker (feature: sink-mqtt)

mod broadcast;
#[cfg(feature = "sink-mqtt")]
mod mqtt;
mod preview;
mod recording;

use std::io::Cursor;
use std::sync::{Arc, OnceLock};

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Serialize;

use crate::detect::{Detection, DetectionCounts};
use crate::error::SinkError;
use crate::frame::{wall_clock_millis, Frame};
use crate::supervisor::ConnectionState;

pub use broadcast::{BroadcastEvent, BroadcastHub, BroadcastSink};
#[cfg(feature = "sink-mqtt")]
pub use mqtt::{MqttSink, MqttSinkConfig};
pub use preview::{LatestPreview, PreviewFrame, PreviewSink};
pub use recording::RecordingSink;

pub const DEFAULT_JPEG_QUALITY: u8 = 75;

/// A frame after the inference stage, plus the metrics sinks report.
pub struct ProcessedFrame {
    pub frame: Frame,
    pub detections: Vec<Detection>,
    pub counts: DetectionCounts,
    /// True when inference ran (successfully or not) on this frame.
    pub inferred: bool,
    pub fps: Option<f32>,
    pub fps_avg: Option<f32>,
    /// Frames processed since startup, this one included.
    pub frame_counter: u64,
    pub error: Option<String>,
    jpeg_quality: u8,
    jpeg: OnceLock<Result<Arc<[u8]>, String>>,
}

impl ProcessedFrame {
    pub fn new(frame: Frame, frame_counter: u64, jpeg_quality: u8) -> Self {
        Self {
            frame,
            detections: Vec::new(),
            counts: DetectionCounts::new(),
            inferred: false,
            fps: None,
            fps_avg: None,
            frame_counter,
            error: None,
            jpeg_quality,
            jpeg: OnceLock::new(),
        }
    }

    /// JPEG encoding of the frame, produced once and shared by every sink.
    pub fn jpeg(&self) -> Result<Arc<[u8]>, SinkError> {
        self.jpeg
            .get_or_init(|| {
                encode_jpeg(self.frame.image(), self.jpeg_quality)
                    .map(Arc::from)
                    .map_err(|e| e.to_string())
            })
            .clone()
            .map_err(|reason| SinkError::Delivery {
                sink: "jpeg",
                reason,
            })
    }
}

/// Emitted instead of a frame while the stream is down.
#[derive(Clone, Debug, Serialize)]
pub struct IdleNotice {
    pub message: String,
    pub state: ConnectionState,
    pub frame_counter: u64,
    pub timestamp_ms: u64,
}

impl IdleNotice {
    pub fn new(message: impl Into<String>, state: ConnectionState, frame_counter: u64) -> Self {
        Self {
            message: message.into(),
            state,
            frame_counter,
            timestamp_ms: wall_clock_millis(),
        }
    }
}

pub trait FrameSink: Send {
    fn name(&self) -> &'static str;

    fn consume(&mut self, frame: &ProcessedFrame) -> Result<(), SinkError>;

    /// Called at most once per second while no frames flow.
    fn idle(&mut self, _notice: &IdleNotice) -> Result<(), SinkError> {
        Ok(())
    }

    /// Flush and release resources. Called once at shutdown.
    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// The set of sinks the processing worker fans out to.
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Box<dyn FrameSink>>,
    failures: u64,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn FrameSink>) {
        log::info!("sink '{}' attached", sink.name());
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Total sink failures absorbed so far.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn fan_out(&mut self, frame: &ProcessedFrame) {
        for sink in &mut self.sinks {
            if let Err(err) = sink.consume(frame) {
                self.failures += 1;
                log::warn!(
                    "sink '{}' failed on frame {}: {}",
                    sink.name(),
                    frame.frame_counter,
                    err
                );
            }
        }
    }

    pub fn idle(&mut self, notice: &IdleNotice) {
        for sink in &mut self.sinks {
            if let Err(err) = sink.idle(notice) {
                self.failures += 1;
                log::debug!("sink '{}' idle notice failed: {}", sink.name(), err);
            }
        }
    }

    pub fn close_all(&mut self) {
        for sink in &mut self.sinks {
            if let Err(err) = sink.close() {
                log::warn!("sink '{}' failed to close: {}", sink.name(), err);
            }
        }
        self.sinks.clear();
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, SinkError> {
    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buffer.into_inner())
}
