//! RTMP ingestion through FFmpeg (used when GStreamer is not compiled in).
//!
//! FFmpeg reads are blocking; the per-read bound comes from the demuxer's
//! `rw_timeout` option, which is set from the open timeout.

use std::time::{Duration, Instant};

use ffmpeg_next as ffmpeg;

use crate::error::SourceError;
use crate::frame::RawImage;

use super::{Endpoint, MediaConnector, MediaStream};

pub(crate) struct FfmpegConnector;

impl MediaConnector for FfmpegConnector {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn MediaStream>, SourceError> {
        ffmpeg::init().map_err(|e| SourceError::Init(format!("initialize ffmpeg: {}", e)))?;
        let refused = |reason: String| SourceError::unreachable(endpoint.as_str(), reason);

        let mut options = ffmpeg::Dictionary::new();
        options.set("rw_timeout", &(timeout.as_micros() as u64).to_string());
        options.set("fflags", "nobuffer");
        let input = ffmpeg::format::input_with_dictionary(&endpoint.as_str(), options)
            .map_err(|e| refused(format!("open input: {}", e)))?;

        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| refused("stream has no video track".into()))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .map_err(|e| SourceError::Init(format!("load decoder parameters: {}", e)))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| SourceError::Init(format!("open video decoder: {}", e)))?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| SourceError::Init(format!("create scaler: {}", e)))?;

        log::info!("FfmpegStream: opened {}", endpoint);
        Ok(Box::new(FfmpegStream {
            input: Some(input),
            stream_index,
            decoder,
            scaler,
        }))
    }
}

struct FfmpegStream {
    input: Option<ffmpeg::format::context::Input>,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
}

impl MediaStream for FfmpegStream {
    fn read(&mut self, timeout: Duration) -> Result<RawImage, SourceError> {
        let Some(input) = self.input.as_mut() else {
            return Err(SourceError::EndOfStream("input closed".into()));
        };
        let deadline = Instant::now() + timeout;
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .map_err(|e| SourceError::BadFrame(format!("scale frame: {}", e)))?;
                return frame_to_image(&rgb_frame);
            }
            if Instant::now() >= deadline {
                return Err(SourceError::Stalled(timeout));
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => {
                    return Err(SourceError::EndOfStream("stream reached EOF".into()))
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                    return Err(SourceError::Stalled(timeout))
                }
                Err(err) => return Err(SourceError::EndOfStream(format!("read packet: {}", err))),
            }
            if packet.stream() != self.stream_index {
                continue;
            }
            if let Err(err) = self.decoder.send_packet(&packet) {
                log::debug!("FfmpegStream: decoder rejected packet: {}", err);
            }
        }
    }

    fn close(&mut self) {
        self.input = None;
    }
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RawImage, SourceError> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let packed = data.get(..row_bytes * height as usize).ok_or_else(|| {
            SourceError::BadFrame("decoded frame is shorter than its dimensions".into())
        })?;
        return Ok(RawImage::rgb(packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(data.get(start..start + row_bytes).ok_or_else(|| {
            SourceError::BadFrame("decoded frame row is out of bounds".into())
        })?);
    }
    Ok(RawImage::rgb(pixels, width, height))
}
