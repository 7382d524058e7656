mod backend;
mod backends;
mod config;
mod registry;
pub mod render;
mod result;

pub use backend::{DetectRequest, DetectorBackend};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use config::{
    DetectionConfig, DetectionConfigUpdate, SharedDetectionConfig, DEFAULT_CONFIDENCE_THRESHOLD,
    DEFAULT_IMAGE_SIZE, DEFAULT_PALETTE,
};
pub use registry::{DetectorRegistry, SharedBackend};
pub use result::{count_by_label, BoundingBox, Detection, DetectionCounts, RawDetection};
