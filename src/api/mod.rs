//! Local HTTP control surface.
//!
//! Routes:
//! - `GET  /health`
//! - `GET  /api/status`
//! - `GET  /api/frame.jpg`
//! - `POST /api/inference/start`, `POST /api/inference/stop`
//! - `POST /api/config` (JSON `DetectionConfigUpdate`)
//! - `POST /api/model/change` (`{"model": "<name>"}`)
//!
//! Stream connectivity is reported through `/api/status`, never as an HTTP
//! error.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;

use crate::detect::DetectionConfigUpdate;
use crate::error::ControlError;
use crate::pipeline::PipelineControl;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
pub const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_API_ADDR.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    control: PipelineControl,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, control: PipelineControl) -> Self {
        Self { cfg, control }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind api to {}", configured_addr))?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let control = self.control;
        let join = std::thread::Builder::new()
            .name("skywatch-api".into())
            .spawn(move || {
                if let Err(err) = run_api(listener, &control, shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })
            .context("spawn api thread")?;
        log::info!("control api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    control: &PipelineControl,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let pipeline_stopped = control.shutdown_signal();
    loop {
        if shutdown.load(Ordering::SeqCst) || pipeline_stopped.is_triggered() {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, control) {
                    log::warn!("control api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, control: &PipelineControl) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        return Response::error(403, "forbidden").write_to(&mut stream);
    }

    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            Response::error(400, "bad_request").write_to(&mut stream)?;
            return Err(err);
        }
    };
    log::debug!("{} {}", request.method, request.path);
    route(&request, control).write_to(&mut stream)
}

#[derive(Deserialize)]
struct ModelChange {
    model: String,
}

fn route(request: &HttpRequest, control: &PipelineControl) -> Response {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => Response::json(200, json!({ "status": "ok" })),
        ("GET", "/api/status") => match serde_json::to_value(control.status()) {
            Ok(body) => Response::json(200, body),
            Err(err) => Response::error(500, &err.to_string()),
        },
        ("GET", "/api/frame.jpg") => match control.preview().latest() {
            Some(frame) => Response {
                status: 200,
                content_type: "image/jpeg",
                body: frame.jpeg.to_vec(),
            },
            None => Response::error(404, "no_frame"),
        },
        ("POST", "/api/inference/start") => match control.start_inference() {
            Ok(()) => Response::json(200, json!({ "inference_enabled": true })),
            Err(err) => Response::control_error(&err),
        },
        ("POST", "/api/inference/stop") => {
            control.stop_inference();
            Response::json(200, json!({ "inference_enabled": false }))
        }
        ("POST", "/api/config") => {
            let update: DetectionConfigUpdate = match serde_json::from_slice(&request.body) {
                Ok(update) => update,
                Err(err) => return Response::error(400, &format!("invalid config: {}", err)),
            };
            match control.update_config(update) {
                Ok(config) => Response::json(
                    200,
                    json!({
                        "confidence_threshold": config.confidence_threshold,
                        "classes": config.classes,
                        "image_size": config.image_size,
                    }),
                ),
                Err(err) => Response::control_error(&err),
            }
        }
        ("POST", "/api/model/change") => {
            let change: ModelChange = match serde_json::from_slice(&request.body) {
                Ok(change) => change,
                Err(err) => return Response::error(400, &format!("invalid request: {}", err)),
            };
            match control.change_model(&change.model) {
                Ok(()) => Response::json(200, json!({ "active_model": change.model })),
                Err(err) => Response::control_error(&err),
            }
        }
        (
            _,
            "/health" | "/api/status" | "/api/frame.jpg" | "/api/inference/start"
            | "/api/inference/stop" | "/api/config" | "/api/model/change",
        ) => Response::error(405, "method_not_allowed"),
        _ => Response::error(404, "not_found"),
    }
}

fn read_request<R: Read>(stream: &mut R) -> Result<HttpRequest> {
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_HEADER_BYTES + MAX_BODY_BYTES {
            return Err(anyhow!("request too large"));
        }
    };
    if header_end > MAX_HEADER_BYTES {
        return Err(anyhow!("request headers too large"));
    }

    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data.split_off(header_end + 4);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path,
        headers,
        body,
    })
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    #[allow(dead_code)]
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string().into_bytes(),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, json!({ "error": message }))
    }

    fn control_error(err: &ControlError) -> Self {
        let status = match err {
            ControlError::ModelNotLoaded => 409,
            ControlError::UnknownModel(_) => 404,
            ControlError::InvalidConfig(_) => 400,
        };
        Self::error(status, &err.to_string())
    }

    fn write_to<W: Write>(&self, stream: &mut W) -> Result<()> {
        let status_line = match self.status {
            200 => "HTTP/1.1 200 OK",
            400 => "HTTP/1.1 400 Bad Request",
            403 => "HTTP/1.1 403 Forbidden",
            404 => "HTTP/1.1 404 Not Found",
            405 => "HTTP/1.1 405 Method Not Allowed",
            409 => "HTTP/1.1 409 Conflict",
            _ => "HTTP/1.1 500 Internal Server Error",
        };
        let header = format!(
            "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
            status_line = status_line,
            content_type = self.content_type,
            len = self.body.len()
        );
        stream.write_all(header.as_bytes())?;
        stream.write_all(&self.body)?;
        stream.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_request_line_and_strips_query() {
        let mut raw = Cursor::new(b"get /api/status?verbose=1 HTTP/1.1\r\nHost: x\r\n\r\n".to_vec());
        let request = read_request(&mut raw).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/api/status");
        assert_eq!(request.headers.get("host").map(String::as_str), Some("x"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn reads_body_by_content_length() {
        let body = r#"{"confidence_threshold":0.5}"#;
        let raw = format!(
            "POST /api/config HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}trailing",
            body.len(),
            body
        );
        let request = read_request(&mut Cursor::new(raw.into_bytes())).unwrap();
        assert_eq!(request.body, body.as_bytes());
        let update: DetectionConfigUpdate = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(update.confidence_threshold, Some(0.5));
    }

    /// Hands out at most `chunk` bytes per read, like a slow socket.
    struct Trickle {
        inner: Cursor<Vec<u8>>,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let len = buf.len().min(self.chunk);
            self.inner.read(&mut buf[..len])
        }
    }

    #[test]
    fn assembles_body_split_across_reads() {
        let body = r#"{"classes":["person","car"]}"#;
        let raw = format!(
            "POST /api/config HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut stream = Trickle {
            inner: Cursor::new(raw.into_bytes()),
            chunk: 7,
        };
        let request = read_request(&mut stream).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/api/config");
        assert_eq!(request.body, body.as_bytes());
    }

    #[test]
    fn rejects_truncated_and_oversized_requests() {
        let truncated = b"POST /api/config HTTP/1.1\r\nContent-Length: 10\r\n\r\n{}".to_vec();
        assert!(read_request(&mut Cursor::new(truncated)).is_err());

        let oversized = format!(
            "POST /api/config HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_BYTES + 1
        );
        assert!(read_request(&mut Cursor::new(oversized.into_bytes())).is_err());

        assert!(read_request(&mut Cursor::new(b"GET / HTTP/1.1\r\n".to_vec())).is_err());
    }

    #[test]
    fn control_errors_map_to_status_codes() {
        assert_eq!(Response::control_error(&ControlError::ModelNotLoaded).status, 409);
        assert_eq!(
            Response::control_error(&ControlError::UnknownModel("x".into())).status,
            404
        );
        let mut out = Vec::new();
        Response::error(405, "method_not_allowed").write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(text.ends_with(r#"{"error":"method_not_allowed"}"#));
    }
}
