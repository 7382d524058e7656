//! Synthetic stream (`stub://`) for tests and demo runs.
//!
//! Query parameters tune the stream:
//! - `fps`: pacing (default 15; `0` means no pacing)
//! - `width`, `height`: decoded size before normalization (default 640x480)
//! - `refuse=true`: every open fails as unreachable
//! - `frames=N`: stop producing after N pictures
//! - `after=stall|eos`: what happens past `frames` (default `stall`)

use std::thread;
use std::time::{Duration, Instant};

use crate::error::SourceError;
use crate::frame::{RawImage, DEFAULT_FRAME_HEIGHT, DEFAULT_FRAME_WIDTH};

use super::{Endpoint, MediaConnector, MediaStream};

const DEFAULT_FPS: u32 = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Exhausted {
    Stall,
    Eos,
}

#[derive(Clone, Debug)]
struct SyntheticConfig {
    fps: u32,
    width: u32,
    height: u32,
    refuse: bool,
    frame_limit: Option<u64>,
    exhausted: Exhausted,
}

impl SyntheticConfig {
    fn from_endpoint(endpoint: &Endpoint) -> Result<Self, SourceError> {
        let number = |key: &str, default: u64| -> Result<u64, SourceError> {
            match endpoint.query_param(key) {
                Some(value) => value.parse::<u64>().map_err(|_| {
                    SourceError::Init(format!("stub parameter {}='{}' is not a number", key, value))
                }),
                None => Ok(default),
            }
        };
        let small = |key: &str, default: u32| -> Result<u32, SourceError> {
            let value = number(key, u64::from(default))?;
            u32::try_from(value).map_err(|_| {
                SourceError::Init(format!("stub parameter {}={} is out of range", key, value))
            })
        };
        let exhausted = match endpoint.query_param("after").as_deref() {
            None | Some("stall") => Exhausted::Stall,
            Some("eos") => Exhausted::Eos,
            Some(other) => {
                return Err(SourceError::Init(format!(
                    "stub parameter after='{}' must be stall or eos",
                    other
                )))
            }
        };
        let width = small("width", DEFAULT_FRAME_WIDTH)?;
        let height = small("height", DEFAULT_FRAME_HEIGHT)?;
        if width == 0 || height == 0 {
            return Err(SourceError::Init("stub stream needs a non-zero size".into()));
        }
        Ok(Self {
            fps: small("fps", DEFAULT_FPS)?,
            width,
            height,
            refuse: endpoint.query_param("refuse").as_deref() == Some("true"),
            frame_limit: endpoint
                .query_param("frames")
                .map(|_| number("frames", 0))
                .transpose()?,
            exhausted,
        })
    }
}

/// Opens synthetic streams for `stub://` endpoints.
#[derive(Clone, Debug, Default)]
pub struct SyntheticConnector;

impl MediaConnector for SyntheticConnector {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open(
        &self,
        endpoint: &Endpoint,
        _timeout: Duration,
    ) -> Result<Box<dyn MediaStream>, SourceError> {
        if endpoint.scheme() != "stub" {
            return Err(SourceError::Init(format!(
                "synthetic connector cannot open '{}'",
                endpoint
            )));
        }
        let config = SyntheticConfig::from_endpoint(endpoint)?;
        if config.refuse {
            return Err(SourceError::unreachable(
                endpoint.as_str(),
                "connection refused",
            ));
        }
        log::info!(
            "SyntheticStream: {}x{} @ {} fps for {}",
            config.width,
            config.height,
            config.fps,
            endpoint
        );
        Ok(Box::new(SyntheticStream {
            config,
            frame_count: 0,
            scene_state: 0,
            next_due: None,
            closed: false,
        }))
    }
}

struct SyntheticStream {
    config: SyntheticConfig,
    frame_count: u64,
    /// Position of the moving block; changes every 50 frames to mimic motion.
    scene_state: u8,
    next_due: Option<Instant>,
    closed: bool,
}

impl SyntheticStream {
    fn frame_interval(&self) -> Option<Duration> {
        (self.config.fps > 0).then(|| Duration::from_secs(1) / self.config.fps)
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let (w, h) = (self.config.width as usize, self.config.height as usize);
        if self.frame_count.is_multiple_of(50) {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let offset = (y * w + x) * 3;
                pixels[offset] = ((x * 255) / w.max(1)) as u8;
                pixels[offset + 1] = ((y * 255) / h.max(1)) as u8;
                pixels[offset + 2] = (self.frame_count % 256) as u8;
            }
        }

        // Bright block sweeping left to right.
        let block = (w.min(h) / 6).max(1);
        let x0 = ((self.frame_count as usize * 4) + self.scene_state as usize * 7) % w.max(1);
        let y0 = (h / 2).saturating_sub(block / 2);
        for y in y0..(y0 + block).min(h) {
            for x in x0..(x0 + block).min(w) {
                let offset = (y * w + x) * 3;
                pixels[offset..offset + 3].copy_from_slice(&[240, 240, 240]);
            }
        }
        pixels
    }
}

impl MediaStream for SyntheticStream {
    fn read(&mut self, timeout: Duration) -> Result<RawImage, SourceError> {
        if self.closed {
            return Err(SourceError::EndOfStream("synthetic stream closed".into()));
        }
        if let Some(limit) = self.config.frame_limit {
            if self.frame_count >= limit {
                return match self.config.exhausted {
                    Exhausted::Eos => Err(SourceError::EndOfStream(format!(
                        "synthetic stream ended after {} frames",
                        limit
                    ))),
                    Exhausted::Stall => {
                        thread::sleep(timeout);
                        Err(SourceError::Stalled(timeout))
                    }
                };
            }
        }

        if let (Some(interval), Some(due)) = (self.frame_interval(), self.next_due) {
            let wait = due.saturating_duration_since(Instant::now());
            if wait > timeout {
                thread::sleep(timeout);
                return Err(SourceError::Stalled(timeout));
            }
            thread::sleep(wait);
            self.next_due = Some(due + interval);
        } else {
            self.next_due = self.frame_interval().map(|i| Instant::now() + i);
        }

        let pixels = self.generate_pixels();
        self.frame_count += 1;
        Ok(RawImage::rgb(pixels, self.config.width, self.config.height))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
