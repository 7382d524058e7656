//! skywatch: live drone video object detection.
//!
//! # Architecture
//!
//! ```text
//! FrameSource ─> SingleSlotRelay ─> InferenceStage ─> SinkSet (preview, recording, broadcast, mqtt)
//!      ^
//!      └── ConnectionSupervisor (probe, backoff, reconnect)
//! ```
//!
//! Capture never waits on inference: the relay holds at most one frame and a
//! newer frame always replaces an unconsumed one. Only an explicit shutdown
//! stops the pipeline; every other failure is absorbed or retried.
//!
//! # Module Structure
//!
//! - `ingest`: media connectors, `FrameSource`, synthetic `stub://` stream
//! - `relay`: lossy single-slot handoff
//! - `supervisor`: reconnect state machine and connection status
//! - `detect`: detector backends, model registry, detection config, drawing
//! - `inference`: per-frame detection and fps accounting
//! - `sink`: fan-out consumers of processed frames
//! - `pipeline`: wiring plus the remote-control surface
//! - `api`: local HTTP adapter over `PipelineControl`
//! - `config`: file + env configuration

pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod inference;
pub mod ingest;
pub mod pipeline;
pub mod relay;
pub mod shutdown;
pub mod sink;
pub mod supervisor;

pub use error::{ControlError, InferenceError, SinkError, SourceError};
pub use frame::{Frame, PixelFormat, RawImage};
pub use pipeline::{Pipeline, PipelineControl, PipelineSettings, StatusSnapshot};
pub use relay::SingleSlotRelay;
pub use shutdown::ShutdownSignal;
pub use supervisor::{ConnectionState, ConnectionSupervisor, SupervisorSettings};
