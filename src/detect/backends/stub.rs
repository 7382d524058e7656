use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::{DetectRequest, DetectorBackend};
use crate::detect::result::{BoundingBox, RawDetection};

const DEFAULT_LABELS: [&str; 6] = ["person", "bicycle", "car", "motorcycle", "bus", "truck"];

/// Stub backend for tests and demo runs.
///
/// Detections are derived from a hash of the pixels, so the same frame always
/// yields the same boxes. `with_detections` pins a fixed list instead.
pub struct StubBackend {
    labels: Vec<String>,
    fixed: Option<Vec<RawDetection>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            labels: DEFAULT_LABELS.iter().map(|s| s.to_string()).collect(),
            fixed: None,
        }
    }

    /// Always report `detections` (still subject to the confidence threshold).
    pub fn with_detections(mut self, detections: Vec<RawDetection>) -> Self {
        self.fixed = Some(detections);
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    fn hashed_detections(&self, pixels: &[u8], width: u32, height: u32) -> Vec<RawDetection> {
        let digest: [u8; 32] = Sha256::digest(pixels).into();
        let count = (digest[0] % 4) as usize;
        let classes = self.labels.len().max(1) as u32;
        let (w, h) = (width as f32, height as f32);

        (0..count)
            .map(|i| {
                let b = &digest[1 + i * 7..8 + i * 7];
                let x = b[0] as f32 / 255.0 * w * 0.8;
                let y = b[1] as f32 / 255.0 * h * 0.8;
                let bw = (0.05 + b[2] as f32 / 255.0 * 0.15) * w;
                let bh = (0.05 + b[3] as f32 / 255.0 * 0.15) * h;
                RawDetection {
                    class_id: b[4] as u32 % classes,
                    confidence: 0.2 + (b[5] as f32 / 255.0) * 0.79,
                    bbox: BoundingBox::new(x, y, (x + bw).min(w), (y + bh).min(h)),
                }
            })
            .collect()
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        request: DetectRequest,
    ) -> Result<Vec<RawDetection>> {
        let candidates = match &self.fixed {
            Some(fixed) => fixed.clone(),
            None => self.hashed_detections(pixels, width, height),
        };
        Ok(candidates
            .into_iter()
            .filter(|d| d.confidence >= request.confidence_threshold)
            .collect())
    }

    fn class_name(&self, class_id: u32) -> Option<&str> {
        self.labels.get(class_id as usize).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: DetectRequest = DetectRequest {
        confidence_threshold: 0.0,
        image_size: 1024,
    };

    #[test]
    fn same_pixels_same_detections() {
        let mut backend = StubBackend::new();
        let pixels = vec![42u8; 64 * 48 * 3];
        let first = backend.detect(&pixels, 64, 48, REQUEST).unwrap();
        let second = backend.detect(&pixels, 64, 48, REQUEST).unwrap();
        assert_eq!(first, second);
        for det in &first {
            assert!(det.bbox.x2 <= 64.0 && det.bbox.y2 <= 48.0);
            assert!(backend.class_name(det.class_id).is_some());
        }
    }

    #[test]
    fn fixed_detections_respect_threshold() {
        let bbox = BoundingBox::new(0.0, 0.0, 4.0, 4.0);
        let mut backend = StubBackend::new().with_detections(vec![
            RawDetection {
                class_id: 0,
                confidence: 0.9,
                bbox,
            },
            RawDetection {
                class_id: 2,
                confidence: 0.1,
                bbox,
            },
        ]);
        let request = DetectRequest {
            confidence_threshold: 0.3,
            ..REQUEST
        };
        let found = backend.detect(&[], 8, 8, request).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(backend.class_name(found[0].class_id), Some("person"));
    }
}
