use anyhow::Result;

use super::result::RawDetection;

/// Per-call parameters passed to a detector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectRequest {
    /// Minimum confidence for a detection to be reported.
    pub confidence_threshold: f32,
    /// Square input size hint for models that letterbox internally.
    pub image_size: u32,
}

/// Detector backend trait.
///
/// The trained model is an opaque collaborator: packed RGB24 pixels in,
/// class ids with confidences and pixel-space corners out. Boxes must be in
/// the coordinate space of the `width` x `height` frame that was passed in.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &str;

    /// Run detection on a frame.
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        request: DetectRequest,
    ) -> Result<Vec<RawDetection>>;

    /// Human-readable label for a class id.
    fn class_name(&self, class_id: u32) -> Option<&str>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
