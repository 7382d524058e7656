use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::DetectionConfig;
use crate::ingest::{
    Endpoint, SourceSettings, DEFAULT_OPEN_TIMEOUT, DEFAULT_READ_TIMEOUT, DEFAULT_STALL_THRESHOLD,
};
use crate::pipeline::PipelineSettings;
use crate::sink::DEFAULT_JPEG_QUALITY;
use crate::supervisor::{
    BackoffPolicy, SupervisorSettings, DEFAULT_MONITOR_INTERVAL, DEFAULT_PROBE_WINDOW,
};

pub const DEFAULT_STREAM_URL: &str = "rtmp://127.0.0.1:1935/live/dron";
const DEFAULT_API_ADDR: &str = crate::api::DEFAULT_API_ADDR;
const DEFAULT_MODEL_NAME: &str = "default";
const DEFAULT_MQTT_CLIENT_ID: &str = "skywatch";
const DEFAULT_MQTT_TOPIC_PREFIX: &str = "skywatch";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SkywatchConfigFile {
    stream: Option<StreamConfigFile>,
    detection: Option<DetectionConfig>,
    model: Option<ModelConfigFile>,
    output: Option<OutputConfigFile>,
    api: Option<ApiConfigFile>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    read_timeout_ms: Option<u64>,
    stall_threshold: Option<u32>,
    open_timeout_ms: Option<u64>,
    probe_window_ms: Option<u64>,
    backoff: Option<BackoffPolicy>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ModelConfigFile {
    name: Option<String>,
    path: Option<PathBuf>,
    labels: Option<PathBuf>,
    infer_on_start: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OutputConfigFile {
    video: Option<PathBuf>,
    jpeg_quality: Option<u8>,
    fps_overlay: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MqttConfigFile {
    broker: Option<String>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SkywatchConfig {
    pub stream: StreamSettings,
    pub detection: DetectionConfig,
    pub model: ModelSettings,
    pub output_video: Option<PathBuf>,
    pub jpeg_quality: u8,
    pub fps_overlay: bool,
    pub api_addr: String,
    pub mqtt: Option<MqttSettings>,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub read_timeout: Duration,
    pub stall_threshold: u32,
    pub open_timeout: Duration,
    pub probe_window: Duration,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub name: String,
    pub path: Option<PathBuf>,
    pub labels: Option<PathBuf>,
    pub infer_on_start: bool,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SkywatchConfig {
    /// Load from the file named by `SKYWATCH_CONFIG` (if any), then apply env
    /// overrides and validate.
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Like `load`, but an explicit `config_path` wins over `SKYWATCH_CONFIG`.
    pub fn load_with(config_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("SKYWATCH_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match config_path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Some(read_config_file(&path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SkywatchConfigFile) -> Self {
        let stream = file.stream.unwrap_or_default();
        let model = file.model.unwrap_or_default();
        let output = file.output.unwrap_or_default();
        let ms = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_millis).unwrap_or(default)
        };
        Self {
            stream: StreamSettings {
                url: stream.url.unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
                width: stream.width.unwrap_or(crate::frame::DEFAULT_FRAME_WIDTH),
                height: stream.height.unwrap_or(crate::frame::DEFAULT_FRAME_HEIGHT),
                read_timeout: ms(stream.read_timeout_ms, DEFAULT_READ_TIMEOUT),
                stall_threshold: stream.stall_threshold.unwrap_or(DEFAULT_STALL_THRESHOLD),
                open_timeout: ms(stream.open_timeout_ms, DEFAULT_OPEN_TIMEOUT),
                probe_window: ms(stream.probe_window_ms, DEFAULT_PROBE_WINDOW),
                backoff: stream.backoff.unwrap_or_default(),
            },
            detection: file.detection.unwrap_or_default(),
            model: ModelSettings {
                name: model.name.unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
                path: model.path,
                labels: model.labels,
                infer_on_start: model.infer_on_start.unwrap_or(false),
            },
            output_video: output.video,
            jpeg_quality: output.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            fps_overlay: output.fps_overlay.unwrap_or(true),
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            mqtt: file.mqtt.and_then(|mqtt| {
                Some(MqttSettings {
                    broker: mqtt.broker?,
                    client_id: mqtt
                        .client_id
                        .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                    topic_prefix: mqtt
                        .topic_prefix
                        .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
                    username: mqtt.username,
                    password: mqtt.password,
                })
            }),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("SKYWATCH_STREAM_URL") {
            if !url.trim().is_empty() {
                self.stream.url = url.trim().to_string();
            }
        }
        if let Ok(addr) = std::env::var("SKYWATCH_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr.trim().to_string();
            }
        }
        if let Ok(path) = std::env::var("SKYWATCH_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.model.path = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("SKYWATCH_OUTPUT_VIDEO") {
            if !path.trim().is_empty() {
                self.output_video = Some(PathBuf::from(path));
            }
        }
        if let Ok(threshold) = std::env::var("SKYWATCH_CONF_THRESH") {
            self.detection.confidence_threshold = threshold.trim().parse().map_err(|_| {
                anyhow!("SKYWATCH_CONF_THRESH must be a number between 0.0 and 1.0")
            })?;
        }
        if let Ok(classes) = std::env::var("SKYWATCH_CLASSES") {
            let parsed: BTreeSet<String> = split_csv(&classes).into_iter().collect();
            self.detection.classes = if parsed.is_empty() { None } else { Some(parsed) };
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        Endpoint::parse(&self.stream.url)
            .with_context(|| format!("invalid stream url '{}'", self.stream.url))?;
        if self.stream.width == 0 || self.stream.height == 0 {
            return Err(anyhow!("frame width and height must be greater than zero"));
        }
        if self.stream.stall_threshold == 0 {
            return Err(anyhow!("stall_threshold must be greater than zero"));
        }
        if self.stream.read_timeout.is_zero() || self.stream.probe_window.is_zero() {
            return Err(anyhow!("read timeout and probe window must be greater than zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be within 1..=100"));
        }
        self.api_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid api address '{}'", self.api_addr))?;
        self.detection.validate()?;
        if self.model.name.trim().is_empty() {
            return Err(anyhow!("model name must not be empty"));
        }
        Ok(())
    }

    /// Settings for `Pipeline::builder`.
    pub fn pipeline_settings(&self) -> Result<PipelineSettings> {
        let endpoint = Endpoint::parse(&self.stream.url)?;
        let supervisor = SupervisorSettings {
            endpoint,
            source: SourceSettings {
                width: self.stream.width,
                height: self.stream.height,
                read_timeout: self.stream.read_timeout,
                stall_threshold: self.stream.stall_threshold,
            },
            open_timeout: self.stream.open_timeout,
            probe_window: self.stream.probe_window,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            backoff: self.stream.backoff.clone(),
        };
        let mut settings = PipelineSettings::new(supervisor);
        settings.detection = self.detection.clone();
        settings.jpeg_quality = self.jpeg_quality;
        settings.fps_overlay = self.fps_overlay;
        settings.infer_on_start = self.model.infer_on_start;
        Ok(settings)
    }
}

fn read_config_file(path: &Path) -> Result<SkywatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
