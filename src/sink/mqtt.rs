//! MQTT push sink.
//!
//! Topics (QoS 0, not retained):
//! - `<prefix>/frame`: raw JPEG bytes
//! - `<prefix>/stats`: JSON `BroadcastEvent` without the image
//!
//! Publishing uses `try_publish` so a slow or absent broker drops messages
//! rather than blocking the processing thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, ConnectionError, MqttOptions};
use rumqttc::Transport;

use crate::error::SinkError;

use super::{BroadcastEvent, FrameSink, IdleNotice, ProcessedFrame};

const RETRY_PAUSE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct MqttSinkConfig {
    /// `mqtt://host:port` or `mqtts://host:port`.
    pub broker: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

struct MqttEndpoint {
    host: String,
    port: u16,
    use_tls: bool,
}

pub struct MqttSink {
    client: Client,
    topic_prefix: String,
    closing: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttSink {
    pub fn connect(config: &MqttSinkConfig) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&config.broker)?;
        let mut options = MqttOptions::new(&config.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);
        if let Some(user) = &config.username {
            options.set_credentials(user, config.password.clone().unwrap_or_default());
        }
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, 10);
        let closing = Arc::new(AtomicBool::new(false));
        let thread_closing = closing.clone();
        let handle = std::thread::Builder::new()
            .name("skywatch-mqtt".into())
            .spawn(move || drive_connection(connection, &thread_closing))
            .context("spawn MQTT connection thread")?;
        log::info!(
            "MQTT sink publishing to {}:{} under '{}' (TLS: {})",
            endpoint.host,
            endpoint.port,
            config.topic_prefix,
            endpoint.use_tls
        );
        Ok(Self {
            client,
            topic_prefix: config.topic_prefix.trim_end_matches('/').to_string(),
            closing,
            connection_handle: Some(handle),
        })
    }

    fn publish(&self, suffix: &str, payload: Vec<u8>) -> Result<(), SinkError> {
        let topic = format!("{}/{}", self.topic_prefix, suffix);
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| SinkError::Delivery {
                sink: "mqtt",
                reason: e.to_string(),
            })
    }

    fn publish_stats(&self, event: &BroadcastEvent) -> Result<(), SinkError> {
        let json = serde_json::to_vec(event).map_err(|e| SinkError::Delivery {
            sink: "mqtt",
            reason: format!("serialize stats: {}", e),
        })?;
        self.publish("stats", json)
    }
}

/// Poll the event loop until the sink closes. Each poll after an error
/// reconnects, so a broker outage only pauses publishing.
fn drive_connection(mut connection: Connection, closing: &AtomicBool) {
    for event in connection.iter() {
        let Err(err) = event else { continue };
        if !keep_polling(&err, closing) {
            break;
        }
        log::warn!("MQTT connection error: {}; retrying in {:?}", err, RETRY_PAUSE);
        std::thread::sleep(RETRY_PAUSE);
        if closing.load(Ordering::SeqCst) {
            break;
        }
    }
}

fn keep_polling(err: &ConnectionError, closing: &AtomicBool) -> bool {
    !closing.load(Ordering::SeqCst) && !matches!(err, ConnectionError::RequestsDone)
}

impl FrameSink for MqttSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn consume(&mut self, frame: &ProcessedFrame) -> Result<(), SinkError> {
        let jpeg = frame.jpeg()?;
        self.publish("frame", jpeg.to_vec())?;
        self.publish_stats(&BroadcastEvent::from_frame(frame, None))
    }

    fn idle(&mut self, notice: &IdleNotice) -> Result<(), SinkError> {
        self.publish_stats(&BroadcastEvent::from_notice(notice))
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.closing.store(true, Ordering::SeqCst);
        if let Err(err) = self.client.disconnect() {
            log::debug!("MQTT disconnect: {}", err);
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = match remainder.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().context("invalid MQTT port")?),
        None => (remainder, if use_tls { 8883 } else { 1883 }),
    };
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host: host.to_string(),
        port,
        use_tls,
    })
}
