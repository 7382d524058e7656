//! Frame types.
//!
//! - `RawImage`: a picture exactly as a media backend decoded it (any size, any
//!   supported pixel layout).
//! - `Frame`: a normalized RGB24 picture at the pipeline's output resolution,
//!   stamped at capture time.
//!
//! `Frame` is deliberately not `Clone`. It moves from the capture worker into
//! the relay and from the relay into the processing worker. A stage that wants
//! to draw on a frame asks for `annotated_copy()` and owns the result.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use image::RgbImage;

/// Default output resolution every captured frame is normalized to.
pub const DEFAULT_FRAME_WIDTH: u32 = 640;
pub const DEFAULT_FRAME_HEIGHT: u32 = 480;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Nv12,
}

/// Decoded picture handed over by a media backend before normalization.
#[derive(Clone, Debug)]
pub struct RawImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl RawImage {
    pub fn rgb(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            format: PixelFormat::Rgb24,
        }
    }
}

/// Normalized RGB24 frame.
pub struct Frame {
    image: RgbImage,
    sequence: u64,
    captured_at: Instant,
    captured_at_ms: u64,
}

impl Frame {
    /// Wrap a normalized image, stamping it with the current time.
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Instant::now(),
            captured_at_ms: wall_clock_millis(),
        }
    }

    /// Solid-color frame. Used by synthetic sources and tests.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], sequence: u64) -> Self {
        Self::new(RgbImage::from_pixel(width, height, image::Rgb(rgb)), sequence)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Per-source capture sequence number, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Capture time as milliseconds since the Unix epoch.
    pub fn captured_at_ms(&self) -> u64 {
        self.captured_at_ms
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Packed RGB bytes, row-major.
    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// New owned frame with the same pixels and capture stamp, for drawing on.
    pub fn annotated_copy(&self) -> Frame {
        Frame {
            image: self.image.clone(),
            sequence: self.sequence,
            captured_at: self.captured_at,
            captured_at_ms: self.captured_at_ms,
        }
    }

    pub(crate) fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("captured_at_ms", &self.captured_at_ms)
            .finish()
    }
}

pub(crate) fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
