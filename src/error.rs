//! Error taxonomy for the capture → relay → inference → sink path.
//!
//! None of these errors stop the pipeline. Capture errors drive the
//! connection supervisor; inference and sink errors are absorbed per frame.
//! Application plumbing (config, API, daemon) uses `anyhow` instead.

use std::time::Duration;

use thiserror::Error;

/// Failures reported by a frame source or the media backend behind it.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The endpoint refused the connection, or opened without producing frames.
    #[error("stream endpoint {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    /// No frame arrived within the read timeout. Transient.
    #[error("no frame within {0:?}")]
    Stalled(Duration),

    /// Stalled reads crossed the consecutive-failure threshold.
    #[error("connection lost after {stalls} consecutive stalled reads")]
    ConnectionLost { stalls: u32 },

    /// One picture could not be converted. The stream stays open.
    #[error("dropped undecodable frame: {0}")]
    BadFrame(String),

    /// The backend reported end of stream or a fatal decode error.
    #[error("stream ended: {0}")]
    EndOfStream(String),

    /// A capture object could not be allocated at all (missing backend, bad URL).
    #[error("capture backend unavailable: {0}")]
    Init(String),
}

impl SourceError {
    pub fn unreachable(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unreachable {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// True for failures that end the current connection.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. } | Self::EndOfStream(_))
    }
}

/// Failure of the detector on a single frame.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("no detector model is loaded")]
    ModelNotLoaded,

    #[error("detector '{0}' is unavailable (lock poisoned)")]
    Poisoned(String),

    #[error("model runtime error: {0}")]
    Runtime(#[from] anyhow::Error),
}

/// Failure of one downstream consumer on a single frame.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),

    #[error("sink i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{sink} sink failed: {reason}")]
    Delivery { sink: &'static str, reason: String },
}

/// Rejections from the remote-control surface.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no detector model is loaded")]
    ModelNotLoaded,

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("invalid detection config: {0}")]
    InvalidConfig(String),
}
