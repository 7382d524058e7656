//! Frame acquisition.
//!
//! The media library is an external collaborator reached through two traits:
//! - `MediaConnector::open` turns an `Endpoint` into a live `MediaStream`
//!   (bounded by an open timeout; never hangs on a refused endpoint).
//! - `MediaStream::read` yields one decoded picture or reports a stall.
//!
//! `FrameSource` wraps one open stream and adds what the pipeline needs on
//! top of it:
//! - normalization of every picture to the fixed output resolution
//!   (failures are logged and the picture is dropped; capture continues)
//! - counting consecutive stalls, escalating to `ConnectionLost` at the
//!   threshold
//! - releasing the stream before any connection-loss error propagates
//!
//! Backends:
//! - `stub://` synthetic stream (always compiled)
//! - GStreamer `uridecodebin` (feature: rtmp-gstreamer)
//! - FFmpeg demux/decode (feature: rtmp-ffmpeg)

mod endpoint;
mod normalize;
#[cfg(feature = "rtmp-gstreamer")]
pub(crate) mod rtmp;
#[cfg(feature = "rtmp-ffmpeg")]
pub(crate) mod rtmp_ffmpeg;
pub mod synthetic;

use std::time::Duration;

use crate::error::SourceError;
use crate::frame::{Frame, RawImage, DEFAULT_FRAME_HEIGHT, DEFAULT_FRAME_WIDTH};

pub use endpoint::Endpoint;
pub use synthetic::SyntheticConnector;

/// Consecutive stalled reads treated as a lost connection.
pub const DEFAULT_STALL_THRESHOLD: u32 = 30;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// One open connection to a media endpoint.
pub trait MediaStream: Send {
    /// Block up to `timeout` for the next decoded picture.
    ///
    /// Returns `SourceError::Stalled` when nothing arrived in time and
    /// `SourceError::EndOfStream` when the backend knows the stream is gone.
    fn read(&mut self, timeout: Duration) -> Result<RawImage, SourceError>;

    /// Release the underlying resource. Must be safe to call more than once.
    fn close(&mut self);
}

/// Factory for media streams.
pub trait MediaConnector: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn MediaStream>, SourceError>;
}

/// Connector that dispatches on the endpoint scheme.
///
/// `stub://` always goes to the synthetic stream. Network schemes use
/// GStreamer when compiled in, otherwise FFmpeg, otherwise fail with
/// `SourceError::Init`.
#[derive(Default)]
pub struct DefaultConnector {
    synthetic: SyntheticConnector,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MediaConnector for DefaultConnector {
    fn name(&self) -> &'static str {
        "default"
    }

    fn open(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn MediaStream>, SourceError> {
        if endpoint.scheme() == "stub" {
            return self.synthetic.open(endpoint, timeout);
        }
        #[cfg(feature = "rtmp-gstreamer")]
        {
            rtmp::GstreamerConnector.open(endpoint, timeout)
        }
        #[cfg(all(not(feature = "rtmp-gstreamer"), feature = "rtmp-ffmpeg"))]
        {
            rtmp_ffmpeg::FfmpegConnector.open(endpoint, timeout)
        }
        #[cfg(not(any(feature = "rtmp-gstreamer", feature = "rtmp-ffmpeg")))]
        {
            let _ = timeout;
            Err(SourceError::Init(format!(
                "'{}' streams require the rtmp-gstreamer or rtmp-ffmpeg feature",
                endpoint.scheme()
            )))
        }
    }
}

/// Tunables for a `FrameSource`.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceSettings {
    /// Output resolution every frame is normalized to.
    pub width: u32,
    pub height: u32,
    pub read_timeout: Duration,
    pub stall_threshold: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_FRAME_WIDTH,
            height: DEFAULT_FRAME_HEIGHT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            stall_threshold: DEFAULT_STALL_THRESHOLD,
        }
    }
}

/// Counters for one `FrameSource`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_read: u64,
    pub frames_discarded: u64,
    pub consecutive_stalls: u32,
}

/// An open, normalizing, stall-counting frame source.
pub struct FrameSource {
    endpoint: Endpoint,
    stream: Option<Box<dyn MediaStream>>,
    settings: SourceSettings,
    sequence: u64,
    stats: SourceStats,
}

impl FrameSource {
    /// Open `endpoint` through `connector`, bounded by `open_timeout`.
    pub fn open(
        connector: &dyn MediaConnector,
        endpoint: &Endpoint,
        settings: SourceSettings,
        open_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let stream = connector.open(endpoint, open_timeout)?;
        log::info!("FrameSource: opened {} via {}", endpoint, connector.name());
        Ok(Self {
            endpoint: endpoint.clone(),
            stream: Some(stream),
            settings,
            sequence: 0,
            stats: SourceStats::default(),
        })
    }

    /// Read the next frame.
    ///
    /// `Ok(None)` means a picture arrived but could not be converted or
    /// normalized and was dropped. A dropped picture neither counts as a stall
    /// nor resets the stall counter. `Err(Stalled)` is transient. `Err(ConnectionLost)` and
    /// `Err(EndOfStream)` are returned only after the stream has been closed.
    pub fn read(&mut self) -> Result<Option<Frame>, SourceError> {
        let timeout = self.settings.read_timeout;
        let Some(stream) = self.stream.as_mut() else {
            return Err(SourceError::ConnectionLost {
                stalls: self.stats.consecutive_stalls,
            });
        };

        match stream.read(timeout) {
            Ok(raw) => {
                self.stats.frames_read += 1;
                match normalize::normalize_frame(raw, self.settings.width, self.settings.height)
                {
                    Ok(image) => {
                        self.stats.consecutive_stalls = 0;
                        self.sequence += 1;
                        Ok(Some(Frame::new(image, self.sequence)))
                    }
                    Err(err) => {
                        self.stats.frames_discarded += 1;
                        log::warn!("FrameSource: dropping frame from {}: {}", self.endpoint, err);
                        Ok(None)
                    }
                }
            }
            Err(SourceError::BadFrame(reason)) => {
                self.stats.frames_discarded += 1;
                log::warn!("FrameSource: dropping frame from {}: {}", self.endpoint, reason);
                Ok(None)
            }
            Err(SourceError::Stalled(waited)) => {
                self.stats.consecutive_stalls += 1;
                let stalls = self.stats.consecutive_stalls;
                if stalls >= self.settings.stall_threshold {
                    self.close();
                    return Err(SourceError::ConnectionLost { stalls });
                }
                Err(SourceError::Stalled(waited))
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    /// Release the underlying stream. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
            log::info!(
                "FrameSource: closed {} (frames={}, discarded={})",
                self.endpoint,
                self.stats.frames_read,
                self.stats.frames_discarded
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}
