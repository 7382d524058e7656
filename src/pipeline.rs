//! The running pipeline: one context object that owns every worker.
//!
//! ```text
//! skywatch-supervisor ──owns──> skywatch-capture ──publish──> SingleSlotRelay
//!                                                                  │ take
//!                                               skywatch-processing (inference + sinks)
//! ```
//!
//! `PipelineControl` is the remote-control surface: cloneable, cheap, safe to
//! hand to the HTTP adapter or a signal handler.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::detect::{
    render, DetectionConfig, DetectionConfigUpdate, DetectorRegistry, SharedDetectionConfig,
};
use crate::error::ControlError;
use crate::frame::Frame;
use crate::inference::{FpsWindow, InferenceStage};
use crate::ingest::{DefaultConnector, MediaConnector};
use crate::relay::SingleSlotRelay;
use crate::shutdown::{ShutdownSignal, Sleeper};
use crate::sink::{
    BroadcastHub, BroadcastSink, FrameSink, IdleNotice, LatestPreview, PreviewSink,
    ProcessedFrame, SinkSet, DEFAULT_JPEG_QUALITY,
};
use crate::supervisor::{
    ConnectionState, ConnectionStatus, ConnectionSupervisor, SupervisorHandle, SupervisorSettings,
};

pub const DEFAULT_TAKE_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_IDLE_NOTICE_INTERVAL: Duration = Duration::from_secs(1);
pub const STREAM_UNAVAILABLE: &str = "stream unavailable";

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub supervisor: SupervisorSettings,
    pub detection: DetectionConfig,
    pub jpeg_quality: u8,
    /// Enable inference as soon as the pipeline starts (needs a loaded model).
    pub infer_on_start: bool,
    /// Draw the fps readout on inferred frames.
    pub fps_overlay: bool,
    pub take_timeout: Duration,
    pub idle_notice_interval: Duration,
}

impl PipelineSettings {
    pub fn new(supervisor: SupervisorSettings) -> Self {
        Self {
            supervisor,
            detection: DetectionConfig::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            infer_on_start: false,
            fps_overlay: true,
            take_timeout: DEFAULT_TAKE_TIMEOUT,
            idle_notice_interval: DEFAULT_IDLE_NOTICE_INTERVAL,
        }
    }
}

/// Everything `status()` reports, captured at one instant.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub stream_connected: bool,
    pub connection_state: ConnectionState,
    pub reconnect_attempts: u32,
    pub reconnects: u64,
    pub inference_enabled: bool,
    pub model_loaded: bool,
    pub active_model: Option<String>,
    pub fps: Option<f32>,
    pub fps_avg: Option<f32>,
    pub frames: u64,
    pub dropped_frames: u64,
    pub last_error: Option<String>,
    pub last_inference_error: Option<String>,
}

struct Shared {
    relay: Arc<SingleSlotRelay>,
    status: Arc<ConnectionStatus>,
    config: SharedDetectionConfig,
    registry: Arc<DetectorRegistry>,
    inference_enabled: AtomicBool,
    fps: Mutex<FpsWindow>,
    frames: AtomicU64,
    last_inference_error: Mutex<Option<String>>,
    preview: LatestPreview,
    broadcast: BroadcastHub,
    shutdown: ShutdownSignal,
}

impl Shared {
    fn fps_window(&self) -> std::sync::MutexGuard<'_, FpsWindow> {
        self.fps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Remote-control handle for a running pipeline.
#[derive(Clone)]
pub struct PipelineControl {
    shared: Arc<Shared>,
}

impl PipelineControl {
    /// Turn inference on. Rejected when no model is loaded.
    pub fn start_inference(&self) -> Result<(), ControlError> {
        if !self.shared.registry.is_loaded() {
            return Err(ControlError::ModelNotLoaded);
        }
        if !self.shared.inference_enabled.swap(true, Ordering::SeqCst) {
            log::info!("inference enabled");
        }
        Ok(())
    }

    pub fn stop_inference(&self) {
        if self.shared.inference_enabled.swap(false, Ordering::SeqCst) {
            self.shared.fps_window().clear();
            log::info!("inference paused");
        }
    }

    pub fn inference_enabled(&self) -> bool {
        self.shared.inference_enabled.load(Ordering::SeqCst)
    }

    /// Apply a partial detection-config change. Takes effect from the next frame.
    pub fn update_config(
        &self,
        update: DetectionConfigUpdate,
    ) -> Result<Arc<DetectionConfig>, ControlError> {
        let config = self.shared.config.update(update)?;
        log::info!(
            "detection config updated: threshold={} classes={:?}",
            config.confidence_threshold,
            config.classes
        );
        Ok(config)
    }

    /// Replace the detection config whole.
    pub fn replace_config(
        &self,
        config: DetectionConfig,
    ) -> Result<Arc<DetectionConfig>, ControlError> {
        self.shared.config.store(config)
    }

    pub fn detection_config(&self) -> Arc<DetectionConfig> {
        self.shared.config.load()
    }

    /// Switch the active detector model.
    pub fn change_model(&self, name: &str) -> Result<(), ControlError> {
        self.shared
            .registry
            .set_active(name)
            .map_err(|_| ControlError::UnknownModel(name.to_string()))?;
        self.shared.fps_window().clear();
        Ok(())
    }

    pub fn models(&self) -> Vec<String> {
        self.shared.registry.list()
    }

    pub fn status(&self) -> StatusSnapshot {
        let connection = self.shared.status.snapshot();
        let inference_enabled = self.inference_enabled();
        let (fps, fps_avg) = if inference_enabled {
            let window = self.shared.fps_window();
            (window.instant_fps(), window.average_fps())
        } else {
            (None, None)
        };
        StatusSnapshot {
            stream_connected: connection.state == ConnectionState::Connected,
            connection_state: connection.state,
            reconnect_attempts: connection.consecutive_attempts,
            reconnects: connection.reconnects,
            inference_enabled,
            model_loaded: self.shared.registry.is_loaded(),
            active_model: self.shared.registry.active_name(),
            fps,
            fps_avg,
            frames: self.shared.frames.load(Ordering::Relaxed),
            dropped_frames: self.shared.relay.dropped(),
            last_error: connection.last_error,
            last_inference_error: self
                .shared
                .last_inference_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    pub fn preview(&self) -> LatestPreview {
        self.shared.preview.clone()
    }

    pub fn broadcast(&self) -> BroadcastHub {
        self.shared.broadcast.clone()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shared.shutdown.clone()
    }
}

pub struct PipelineBuilder {
    settings: PipelineSettings,
    connector: Arc<dyn MediaConnector>,
    registry: Arc<DetectorRegistry>,
    sinks: Vec<Box<dyn FrameSink>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    shutdown: ShutdownSignal,
}

impl PipelineBuilder {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            connector: Arc::new(DefaultConnector::new()),
            registry: Arc::new(DetectorRegistry::new()),
            sinks: Vec::new(),
            sleeper: None,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn connector(mut self, connector: Arc<dyn MediaConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn registry(mut self, registry: Arc<DetectorRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Extra sink, after the built-in preview and broadcast sinks.
    pub fn sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn shutdown_signal(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Spawn the supervisor and processing workers.
    pub fn start(self) -> Result<Pipeline> {
        let PipelineBuilder {
            settings,
            connector,
            registry,
            sinks: extra_sinks,
            sleeper,
            shutdown,
        } = self;

        let config = SharedDetectionConfig::new(DetectionConfig::default());
        config
            .store(settings.detection.clone())
            .context("invalid detection config")?;

        let shared = Arc::new(Shared {
            relay: Arc::new(SingleSlotRelay::new()),
            status: Arc::new(ConnectionStatus::new()),
            config,
            registry,
            inference_enabled: AtomicBool::new(false),
            fps: Mutex::new(FpsWindow::default()),
            frames: AtomicU64::new(0),
            last_inference_error: Mutex::new(None),
            preview: LatestPreview::new(),
            broadcast: BroadcastHub::new(),
            shutdown: shutdown.clone(),
        });
        let control = PipelineControl {
            shared: shared.clone(),
        };
        if settings.infer_on_start {
            if let Err(err) = control.start_inference() {
                log::warn!("inference not started: {}", err);
            }
        }

        let mut sinks = SinkSet::new();
        sinks.push(Box::new(PreviewSink::new(shared.preview.clone())));
        sinks.push(Box::new(BroadcastSink::new(shared.broadcast.clone())));
        for sink in extra_sinks {
            sinks.push(sink);
        }

        let processor = {
            let shared = shared.clone();
            let worker = ProcessingWorker {
                stage: InferenceStage::new(shared.registry.clone()),
                jpeg_quality: settings.jpeg_quality,
                fps_overlay: settings.fps_overlay,
                take_timeout: settings.take_timeout,
                idle_notice_interval: settings.idle_notice_interval,
                shared,
                sinks,
            };
            thread::Builder::new()
                .name("skywatch-processing".into())
                .spawn(move || worker.run())
                .context("spawn processing worker")?
        };

        let mut supervisor = ConnectionSupervisor::new(
            settings.supervisor.clone(),
            connector,
            shared.relay.clone(),
            shared.status.clone(),
            shutdown.clone(),
        );
        if let Some(sleeper) = sleeper {
            supervisor = supervisor.with_sleeper(sleeper);
        }
        let supervisor = match supervisor.spawn() {
            Ok(handle) => handle,
            Err(err) => {
                shutdown.trigger();
                let _ = processor.join();
                return Err(err).context("spawn supervisor");
            }
        };

        log::info!(
            "pipeline started for {} (inference {})",
            settings.supervisor.endpoint,
            if control.inference_enabled() { "on" } else { "off" }
        );
        Ok(Pipeline {
            control,
            supervisor: Some(supervisor),
            processor: Some(processor),
        })
    }
}

pub struct Pipeline {
    control: PipelineControl,
    supervisor: Option<SupervisorHandle>,
    processor: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn builder(settings: PipelineSettings) -> PipelineBuilder {
        PipelineBuilder::new(settings)
    }

    pub fn control(&self) -> PipelineControl {
        self.control.clone()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.control.status()
    }

    /// Block until shutdown is triggered from elsewhere, waking every `tick`.
    pub fn wait(&self, tick: Duration, mut on_tick: impl FnMut(&StatusSnapshot)) {
        let signal = self.control.shutdown_signal();
        while !signal.wait_timeout(tick) {
            on_tick(&self.status());
        }
    }

    /// Stop capture, then processing, then the sinks. Idempotent.
    pub fn shutdown(&mut self) {
        if self.supervisor.is_none() && self.processor.is_none() {
            return;
        }
        self.control.shared.shutdown.trigger();
        if let Some(mut supervisor) = self.supervisor.take() {
            supervisor.shutdown();
        }
        if let Some(processor) = self.processor.take() {
            if processor.join().is_err() {
                log::error!("processing worker panicked");
            }
        }
        log::info!(
            "pipeline stopped after {} frames ({} dropped in relay)",
            self.control.shared.frames.load(Ordering::Relaxed),
            self.control.shared.relay.dropped()
        );
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ProcessingWorker {
    shared: Arc<Shared>,
    stage: InferenceStage,
    sinks: SinkSet,
    jpeg_quality: u8,
    fps_overlay: bool,
    take_timeout: Duration,
    idle_notice_interval: Duration,
}

impl ProcessingWorker {
    fn run(mut self) {
        let mut last_notice: Option<Instant> = None;
        while !self.shared.shutdown.is_triggered() {
            match self.shared.relay.take(self.take_timeout) {
                Some(frame) => self.process(frame),
                None => {
                    let state = self.shared.status.state();
                    let due = last_notice
                        .map_or(true, |at| at.elapsed() >= self.idle_notice_interval);
                    if state != ConnectionState::Connected && due {
                        let notice = IdleNotice::new(
                            STREAM_UNAVAILABLE,
                            state,
                            self.shared.frames.load(Ordering::Relaxed),
                        );
                        self.sinks.idle(&notice);
                        last_notice = Some(Instant::now());
                    }
                }
            }
        }
        self.sinks.close_all();
    }

    fn process(&mut self, frame: Frame) {
        let counter = self.shared.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.shared.inference_enabled.load(Ordering::SeqCst) {
            let processed = ProcessedFrame::new(frame, counter, self.jpeg_quality);
            self.sinks.fan_out(&processed);
            return;
        }

        let config = self.shared.config.load();
        let output = self.stage.infer(frame, &config);
        let (fps, fps_avg) = {
            let mut window = self.shared.fps_window();
            if output.is_ok() {
                window.record(output.elapsed);
            }
            (window.instant_fps(), window.average_fps())
        };
        *self
            .shared
            .last_inference_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) =
            output.error.as_ref().map(ToString::to_string);

        let succeeded = output.is_ok();
        let mut processed = ProcessedFrame::new(output.frame, counter, self.jpeg_quality);
        // A failed inference forwards the frame untouched.
        if self.fps_overlay && succeeded {
            let text = format!(
                "FPS {:.1} | AVG {:.1}",
                fps.unwrap_or_default(),
                fps_avg.unwrap_or_default()
            );
            render::draw_overlay(processed.frame.image_mut(), &text);
        }
        processed.detections = output.detections;
        processed.counts = output.counts;
        processed.inferred = true;
        processed.fps = fps;
        processed.fps_avg = fps_avg;
        processed.error = output.error.map(|e| e.to_string());

        if counter % 100 == 0 {
            log::info!("frames processed: {}", counter);
        }
        self.sinks.fan_out(&processed);
    }
}
