//! RTMP (and other network URL) ingestion through GStreamer.
//!
//! Pipeline: `uridecodebin ! videoconvert ! RGB appsink`, with the appsink
//! configured to hold one buffer and drop the rest so reads always see the
//! newest decoded picture.

use std::time::{Duration, Instant};

use gstreamer::prelude::*;
use gstreamer::ClockTime;

use crate::error::SourceError;
use crate::frame::RawImage;

use super::{Endpoint, MediaConnector, MediaStream};

pub(crate) struct GstreamerConnector;

impl MediaConnector for GstreamerConnector {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn open(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn MediaStream>, SourceError> {
        gstreamer::init().map_err(|e| SourceError::Init(format!("initialize gstreamer: {}", e)))?;

        let description = format!(
            "uridecodebin uri={} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            endpoint
        );
        let pipeline = gstreamer::parse_launch(&description)
            .map_err(|e| SourceError::Init(format!("build pipeline: {}", e)))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| SourceError::Init("pipeline is not a Pipeline".into()))?;
        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| SourceError::Init("appsink element missing from pipeline".into()))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| SourceError::Init("appsink element has unexpected type".into()))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        let mut stream = GstreamerStream {
            endpoint: endpoint.to_string(),
            pipeline,
            appsink,
            closed: false,
        };
        stream.start(timeout)?;
        log::info!("GstreamerStream: playing {}", endpoint);
        Ok(Box::new(stream))
    }
}

struct GstreamerStream {
    endpoint: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    closed: bool,
}

impl GstreamerStream {
    /// Move to Playing and wait, bounded, for the state change to settle.
    fn start(&mut self, timeout: Duration) -> Result<(), SourceError> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| self.refused(format!("set pipeline to Playing: {}", e)))?;

        let deadline = Instant::now() + timeout;
        loop {
            self.poll_bus()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (result, current, _) = self
                .pipeline
                .state(ClockTime::from_mseconds(remaining.min(Duration::from_millis(100)).as_millis() as u64));
            match result {
                Ok(gstreamer::StateChangeSuccess::NoPreroll) => return Ok(()),
                Ok(_) if current == gstreamer::State::Playing => return Ok(()),
                Err(e) => return Err(self.refused(format!("pipeline failed to start: {}", e))),
                Ok(_) => {}
            }
            if remaining.is_zero() {
                return Err(self.refused(format!("no answer within {:?}", timeout)));
            }
        }
    }

    fn refused(&mut self, reason: String) -> SourceError {
        self.close();
        SourceError::unreachable(self.endpoint.clone(), reason)
    }

    fn poll_bus(&self) -> Result<(), SourceError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(SourceError::EndOfStream(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    )));
                }
                MessageView::Eos(..) => {
                    return Err(SourceError::EndOfStream("gstreamer reached EOS".into()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl MediaStream for GstreamerStream {
    fn read(&mut self, timeout: Duration) -> Result<RawImage, SourceError> {
        if self.closed {
            return Err(SourceError::EndOfStream("pipeline closed".into()));
        }
        self.poll_bus()?;

        let sample = self
            .appsink
            .try_pull_sample(ClockTime::from_mseconds(timeout.as_millis() as u64));
        let Some(sample) = sample else {
            if self.appsink.is_eos() {
                return Err(SourceError::EndOfStream("appsink reached EOS".into()));
            }
            return Err(SourceError::Stalled(timeout));
        };
        sample_to_image(&sample)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstreamerStream: failed to stop {}: {}", self.endpoint, err);
        }
    }
}

impl Drop for GstreamerStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<RawImage, SourceError> {
    let bad = |what: &str| SourceError::BadFrame(format!("malformed sample: {}", what));

    let buffer = sample.buffer().ok_or_else(|| bad("missing buffer"))?;
    let caps = sample.caps().ok_or_else(|| bad("missing caps"))?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).map_err(|_| bad("caps are not video"))?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().map_err(|_| bad("buffer not readable"))?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok(RawImage::rgb(data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .ok_or_else(|| bad("row out of bounds"))?,
        );
    }
    Ok(RawImage::rgb(pixels, width, height))
}
