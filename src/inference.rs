//! Inference stage: runs the active detector on a frame the processing side
//! already owns, then filters, annotates and counts.
//!
//! A detector failure never escapes this module. The caller gets the original
//! frame back with no detections and the error attached for logging/status.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;

use crate::detect::{
    count_by_label, render, DetectRequest, Detection, DetectionConfig, DetectionCounts,
    DetectorRegistry,
};
use crate::error::InferenceError;
use crate::frame::Frame;

pub const FPS_WINDOW_CAPACITY: usize = 30;

/// Rolling window of recent inference durations.
#[derive(Clone, Debug)]
pub struct FpsWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl Default for FpsWindow {
    fn default() -> Self {
        Self::new(FPS_WINDOW_CAPACITY)
    }
}

impl FpsWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a sample, evicting the oldest once full.
    pub fn record(&mut self, elapsed: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
    }

    /// Fps implied by the most recent sample.
    pub fn instant_fps(&self) -> Option<f32> {
        self.samples.back().map(|d| fps_of(*d))
    }

    /// Mean of the per-sample fps values in the window.
    pub fn average_fps(&self) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f32 = self.samples.iter().map(|d| fps_of(*d)).sum();
        Some(sum / self.samples.len() as f32)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

fn fps_of(elapsed: Duration) -> f32 {
    let secs = elapsed.as_secs_f32();
    if secs > 0.0 {
        1.0 / secs
    } else {
        0.0
    }
}

/// What the inference stage hands to the sinks.
#[derive(Debug)]
pub struct InferenceOutput {
    /// Annotated copy on success; the untouched input on failure.
    pub frame: Frame,
    pub detections: Vec<Detection>,
    pub counts: DetectionCounts,
    pub elapsed: Duration,
    pub error: Option<InferenceError>,
}

impl InferenceOutput {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct InferenceStage {
    registry: Arc<DetectorRegistry>,
}

impl InferenceStage {
    pub fn new(registry: Arc<DetectorRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<DetectorRegistry> {
        &self.registry
    }

    /// Run the active model on `frame` with `config`.
    pub fn infer(&self, frame: Frame, config: &DetectionConfig) -> InferenceOutput {
        let started = Instant::now();
        match self.detect(&frame, config) {
            Ok(detections) => {
                let mut annotated = frame.annotated_copy();
                render::draw_detections(annotated.image_mut(), &detections, config);
                InferenceOutput {
                    counts: count_by_label(&detections),
                    frame: annotated,
                    detections,
                    elapsed: started.elapsed(),
                    error: None,
                }
            }
            Err(err) => {
                log::warn!("inference failed on frame {}: {}", frame.sequence(), err);
                InferenceOutput {
                    frame,
                    detections: Vec::new(),
                    counts: DetectionCounts::new(),
                    elapsed: started.elapsed(),
                    error: Some(err),
                }
            }
        }
    }

    /// Labelled, allow-list filtered detections.
    fn detect(
        &self,
        frame: &Frame,
        config: &DetectionConfig,
    ) -> Result<Vec<Detection>, InferenceError> {
        let (name, backend) = self.registry.active().ok_or(InferenceError::ModelNotLoaded)?;
        let mut backend = backend
            .lock()
            .map_err(|_| InferenceError::Poisoned(name.clone()))?;
        let request = DetectRequest {
            confidence_threshold: config.confidence_threshold,
            image_size: config.image_size,
        };

        let raw = panic::catch_unwind(AssertUnwindSafe(|| {
            backend.detect(frame.as_raw(), frame.width(), frame.height(), request)
        }))
        .map_err(|_| InferenceError::Runtime(anyhow!("detector '{}' panicked", name)))??;

        Ok(raw
            .into_iter()
            .filter(|d| d.confidence >= config.confidence_threshold)
            .map(|d| Detection {
                label: backend
                    .class_name(d.class_id)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("class_{}", d.class_id)),
                class_id: d.class_id,
                confidence: d.confidence,
                bbox: d.bbox,
            })
            .filter(|d| config.accepts(&d.label))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, RawDetection, StubBackend};

    #[test]
    fn fps_window_evicts_oldest() {
        let mut window = FpsWindow::new(3);
        window.record(Duration::from_millis(1000));
        window.record(Duration::from_millis(500));
        window.record(Duration::from_millis(250));
        assert!((window.average_fps().unwrap() - (1.0 + 2.0 + 4.0) / 3.0).abs() < 1e-4);

        window.record(Duration::from_millis(100));
        assert_eq!(window.len(), 3);
        assert!((window.average_fps().unwrap() - (2.0 + 4.0 + 10.0) / 3.0).abs() < 1e-4);
        assert!((window.instant_fps().unwrap() - 10.0).abs() < 1e-4);
    }

    #[test]
    fn fps_window_caps_at_thirty() {
        let mut window = FpsWindow::default();
        for _ in 0..45 {
            window.record(Duration::from_millis(50));
        }
        assert_eq!(window.len(), FPS_WINDOW_CAPACITY);
        assert_eq!(FpsWindow::new(0).average_fps(), None);
    }

    #[test]
    fn no_model_returns_original_frame() {
        let stage = InferenceStage::new(Arc::new(DetectorRegistry::new()));
        let output = stage.infer(Frame::filled(8, 8, [5, 5, 5], 3), &DetectionConfig::default());
        assert!(matches!(output.error, Some(InferenceError::ModelNotLoaded)));
        assert_eq!(output.frame.sequence(), 3);
        assert!(output.detections.is_empty());
        assert!(output.counts.is_empty());
    }

    #[test]
    fn unknown_class_ids_get_generic_labels() {
        let registry = Arc::new(DetectorRegistry::new());
        registry.register(
            "stub",
            StubBackend::new().with_detections(vec![RawDetection {
                class_id: 42,
                confidence: 0.8,
                bbox: BoundingBox::new(1.0, 1.0, 5.0, 5.0),
            }]),
        );
        let stage = InferenceStage::new(registry);
        let output = stage.infer(Frame::filled(16, 16, [0, 0, 0], 1), &DetectionConfig::default());
        assert!(output.is_ok());
        assert_eq!(output.detections[0].label, "class_42");
        assert_eq!(output.counts.get("class_42"), Some(&1));
    }
}
