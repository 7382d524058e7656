use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::SinkError;

use super::{FrameSink, ProcessedFrame};

/// Appends every processed frame to a Motion-JPEG file (concatenated JPEGs,
/// playable with `ffplay -f mjpeg`).
pub struct RecordingSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    frames_written: u64,
}

impl RecordingSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        log::info!("recording to {}", path.display());
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            frames_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl FrameSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn consume(&mut self, frame: &ProcessedFrame) -> Result<(), SinkError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(SinkError::Delivery {
                sink: "recording",
                reason: "recording already closed".into(),
            });
        };
        writer.write_all(&frame.jpeg()?)?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            log::info!(
                "recording closed: {} frames in {}",
                self.frames_written,
                self.path.display()
            );
        }
        Ok(())
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
