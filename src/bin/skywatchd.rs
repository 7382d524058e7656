//! skywatchd - drone video detection daemon
//!
//! Pulls a live RTMP stream, keeps it connected, runs object detection on the
//! newest frame, and fans the annotated result out to the preview, the
//! optional recording file, broadcast subscribers and MQTT.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use skywatch::{
    api::{ApiConfig, ApiServer},
    config::SkywatchConfig,
    detect::{DetectorRegistry, StubBackend},
    pipeline::{Pipeline, StatusSnapshot},
    shutdown::ShutdownSignal,
    sink::RecordingSink,
};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Live drone stream object detection")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "SKYWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Stream URL (rtmp://host:port/app/key, or stub://name for a synthetic feed).
    #[arg(long)]
    url: Option<String>,

    /// Append annotated frames to this MJPEG file.
    #[arg(long)]
    record: Option<PathBuf>,

    /// Control API listen address.
    #[arg(long)]
    api_addr: Option<String>,

    /// Start with inference enabled.
    #[arg(long)]
    infer: bool,

    /// Register the built-in deterministic detector (no model file needed).
    #[arg(long)]
    demo_detector: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = SkywatchConfig::load_with(args.config.as_deref())?;
    if let Some(url) = args.url {
        cfg.stream.url = url;
    }
    if let Some(path) = args.record {
        cfg.output_video = Some(path);
    }
    if let Some(addr) = args.api_addr {
        cfg.api_addr = addr;
    }
    if args.infer {
        cfg.model.infer_on_start = true;
    }

    let settings = cfg.pipeline_settings()?;
    let demo = args.demo_detector || settings.supervisor.endpoint.scheme() == "stub";
    let registry = Arc::new(load_models(&cfg, demo)?);

    let shutdown = ShutdownSignal::new();
    let handler_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        handler_signal.trigger();
    })
    .context("error setting Ctrl-C handler")?;

    let mut builder = Pipeline::builder(settings)
        .registry(registry)
        .shutdown_signal(shutdown);
    if let Some(path) = &cfg.output_video {
        let sink = RecordingSink::create(path)
            .with_context(|| format!("open recording file {}", path.display()))?;
        builder = builder.sink(Box::new(sink));
    }
    builder = add_mqtt_sink(builder, &cfg)?;

    let mut pipeline = builder.start()?;
    let api_config = ApiConfig {
        addr: cfg.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, pipeline.control()).spawn()?;

    log::info!("skywatchd {} running", env!("CARGO_PKG_VERSION"));
    pipeline.wait(STATUS_LOG_INTERVAL, log_status);

    log::info!("stopping control api...");
    api_handle.stop()?;
    pipeline.shutdown();
    Ok(())
}

fn load_models(cfg: &SkywatchConfig, demo: bool) -> Result<DetectorRegistry> {
    let registry = DetectorRegistry::new();
    match &cfg.model.path {
        Some(path) if path.exists() => register_model_file(&registry, cfg, path)?,
        Some(path) => log::warn!(
            "model file {} not found; running without a model",
            path.display()
        ),
        None => log::info!("no model configured"),
    }
    if demo {
        log::info!("registering demo detector 'stub'");
        registry.register("stub", StubBackend::new());
    }
    if !registry.is_loaded() {
        log::warn!("no detector loaded; inference requests will be rejected");
    }
    Ok(registry)
}

#[cfg(feature = "backend-tract")]
fn register_model_file(
    registry: &DetectorRegistry,
    cfg: &SkywatchConfig,
    path: &std::path::Path,
) -> Result<()> {
    let mut backend = skywatch::detect::TractBackend::new(path, cfg.detection.image_size)
        .with_context(|| format!("load model {}", path.display()))?;
    if let Some(labels) = &cfg.model.labels {
        backend = backend.with_labels_file(labels)?;
    }
    log::info!("loaded model '{}' from {}", cfg.model.name, path.display());
    registry.register(cfg.model.name.clone(), backend);
    Ok(())
}

#[cfg(not(feature = "backend-tract"))]
fn register_model_file(
    _registry: &DetectorRegistry,
    _cfg: &SkywatchConfig,
    path: &std::path::Path,
) -> Result<()> {
    log::warn!(
        "model {} ignored: built without the backend-tract feature",
        path.display()
    );
    Ok(())
}

#[cfg(feature = "sink-mqtt")]
fn add_mqtt_sink(
    builder: skywatch::pipeline::PipelineBuilder,
    cfg: &SkywatchConfig,
) -> Result<skywatch::pipeline::PipelineBuilder> {
    let Some(mqtt) = &cfg.mqtt else {
        return Ok(builder);
    };
    let sink = skywatch::sink::MqttSink::connect(&skywatch::sink::MqttSinkConfig {
        broker: mqtt.broker.clone(),
        client_id: mqtt.client_id.clone(),
        topic_prefix: mqtt.topic_prefix.clone(),
        username: mqtt.username.clone(),
        password: mqtt.password.clone(),
    })?;
    Ok(builder.sink(Box::new(sink)))
}

#[cfg(not(feature = "sink-mqtt"))]
fn add_mqtt_sink(
    builder: skywatch::pipeline::PipelineBuilder,
    cfg: &SkywatchConfig,
) -> Result<skywatch::pipeline::PipelineBuilder> {
    if cfg.mqtt.is_some() {
        log::warn!("mqtt settings ignored: built without the sink-mqtt feature");
    }
    Ok(builder)
}

fn log_status(status: &StatusSnapshot) {
    log::info!(
        "stream={:?} attempts={} inference={} model={} fps={:.1} avg={:.1} frames={} dropped={}",
        status.connection_state,
        status.reconnect_attempts,
        status.inference_enabled,
        status.active_model.as_deref().unwrap_or("-"),
        status.fps.unwrap_or_default(),
        status.fps_avg.unwrap_or_default(),
        status.frames,
        status.dropped_frames
    );
    if let Some(err) = &status.last_error {
        log::warn!("last stream error: {}", err);
    }
}
