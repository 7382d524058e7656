mod common;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use skywatch::api::{ApiConfig, ApiServer};
use skywatch::detect::{DetectorRegistry, StubBackend};
use skywatch::pipeline::{Pipeline, PipelineSettings};

fn request(addr: SocketAddr, method: &str, path: &str, body: &str) -> (u16, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    let raw = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {len}\r\n\r\n{body}",
        len = body.len()
    );
    stream.write_all(raw.as_bytes()).expect("send request");

    let mut response = Vec::new();
    stream.read_to_end(&mut response).expect("read response");
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&response[..split]).to_string();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    (status, response[split + 4..].to_vec())
}

fn json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).expect("json body")
}

#[test]
fn control_routes_drive_the_pipeline() {
    let registry = Arc::new(DetectorRegistry::new());
    let settings = PipelineSettings::new(common::settings("stub://api?fps=30"));
    let mut pipeline = Pipeline::builder(settings)
        .registry(registry.clone())
        .start()
        .expect("start pipeline");
    let api = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".into(),
        },
        pipeline.control(),
    )
    .spawn()
    .expect("spawn api");
    let addr = api.addr;

    let (status, body) = request(addr, "GET", "/health", "");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["status"], "ok");

    let (status, body) = request(addr, "POST", "/api/inference/start", "");
    assert_eq!(status, 409);
    assert!(json(&body)["error"].as_str().unwrap().contains("no detector"));

    registry.register("stub", StubBackend::new());
    let (status, _) = request(addr, "POST", "/api/inference/start", "");
    assert_eq!(status, 200);

    let (status, body) = request(addr, "POST", "/api/config", r#"{"confidence_threshold":0.5,"classes":["person"]}"#);
    assert_eq!(status, 200);
    assert_eq!(json(&body)["confidence_threshold"], 0.5);
    let (status, _) = request(addr, "POST", "/api/config", r#"{"confidence_threshold":"high"}"#);
    assert_eq!(status, 400);

    let (status, _) = request(addr, "POST", "/api/model/change", r#"{"model":"missing"}"#);
    assert_eq!(status, 404);
    let (status, _) = request(addr, "POST", "/api/model/change", r#"{"model":"stub"}"#);
    assert_eq!(status, 200);

    let deadline = Instant::now() + Duration::from_secs(5);
    let frame = loop {
        let (status, body) = request(addr, "GET", "/api/frame.jpg", "");
        if status == 200 {
            break body;
        }
        assert_eq!(status, 404);
        assert!(Instant::now() < deadline, "no preview frame served");
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(&frame[..2], &[0xFF, 0xD8]);

    let (status, body) = request(addr, "GET", "/api/status", "");
    assert_eq!(status, 200);
    let snapshot = json(&body);
    assert_eq!(snapshot["stream_connected"], true);
    assert_eq!(snapshot["connection_state"], "connected");
    assert_eq!(snapshot["inference_enabled"], true);
    assert_eq!(snapshot["active_model"], "stub");

    let (status, _) = request(addr, "POST", "/api/inference/stop", "");
    assert_eq!(status, 200);
    let (status, _) = request(addr, "GET", "/api/inference/stop", "");
    assert_eq!(status, 405);
    let (status, _) = request(addr, "GET", "/nope", "");
    assert_eq!(status, 404);

    api.stop().expect("stop api");
    pipeline.shutdown();
}
