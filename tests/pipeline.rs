mod common;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use image::Rgb;
use skywatch::detect::{
    BoundingBox, DetectionConfig, DetectionConfigUpdate, DetectorRegistry, SharedDetectionConfig, StubBackend,
};
use skywatch::inference::InferenceStage;
use skywatch::pipeline::{Pipeline, PipelineSettings, STREAM_UNAVAILABLE};
use skywatch::sink::{FrameSink, ProcessedFrame, RecordingSink};
use skywatch::{ConnectionState, ControlError, Frame, SingleSlotRelay, SinkError};

use common::{ScriptedConnector, ScriptedDetector, ShortSleeper, HEIGHT, WIDTH};

const URL: &str = "rtmp://127.0.0.1:1935/live/test";

/// Keeps the error and raw pixels of every frame it is handed.
struct CapturingSink(Arc<Mutex<Vec<(Option<String>, Vec<u8>)>>>);

impl FrameSink for CapturingSink {
    fn name(&self) -> &'static str {
        "capturing"
    }

    fn consume(&mut self, frame: &ProcessedFrame) -> Result<(), SinkError> {
        if frame.inferred {
            self.0
                .lock()
                .unwrap()
                .push((frame.error.clone(), frame.frame.as_raw().to_vec()));
        }
        Ok(())
    }
}

fn stage_with(detector: ScriptedDetector) -> InferenceStage {
    let registry = Arc::new(DetectorRegistry::new());
    registry.register("scripted", detector);
    InferenceStage::new(registry)
}

#[test]
fn consumer_gets_newest_frame_after_burst() {
    let relay = SingleSlotRelay::new();
    for seq in 1..=10 {
        relay.publish(Frame::filled(WIDTH, HEIGHT, [0, 0, 0], seq));
    }
    let frame = relay.take(Duration::from_millis(10)).expect("frame");
    assert_eq!(frame.sequence(), 10);
    assert_eq!(relay.dropped(), 9);
    assert!(relay.take(Duration::from_millis(10)).is_none());
}

#[test]
fn inference_failure_is_confined_to_one_frame() {
    let stage = stage_with(ScriptedDetector::new(&["person"], vec![(0, 0.9)]).failing_on(1));
    let config = DetectionConfig::default();

    let first = Frame::filled(WIDTH, HEIGHT, [10, 20, 30], 1);
    let original = first.as_raw().to_vec();
    let out = stage.infer(first, &config);
    assert!(out.error.is_some());
    assert!(out.detections.is_empty());
    assert!(out.counts.is_empty());
    assert_eq!(out.frame.sequence(), 1);
    assert_eq!(out.frame.as_raw(), original.as_slice());

    let out = stage.infer(Frame::filled(WIDTH, HEIGHT, [10, 20, 30], 2), &config);
    assert!(out.is_ok());
    assert_eq!(out.detections.len(), 1);
    assert_eq!(out.counts.get("person"), Some(&1));
    assert_ne!(out.frame.as_raw(), original.as_slice());
}

#[test]
fn allow_list_limits_counts_and_boxes() {
    let stage = stage_with(ScriptedDetector::with_boxes(
        &["person", "car"],
        vec![
            (0, 0.9, BoundingBox::new(10.0, 40.0, 40.0, 80.0)),
            (1, 0.8, BoundingBox::new(120.0, 40.0, 160.0, 80.0)),
            (0, 0.7, BoundingBox::new(10.0, 95.0, 40.0, 115.0)),
        ],
    ));
    let config = DetectionConfig {
        classes: Some(BTreeSet::from(["person".to_string()])),
        ..DetectionConfig::default()
    };

    let out = stage.infer(Frame::filled(200, 120, [0, 0, 0], 1), &config);
    assert_eq!(out.counts.len(), 1);
    assert_eq!(out.counts.get("person"), Some(&2));
    assert!(out.detections.iter().all(|d| d.label == "person"));

    let image = out.frame.image();
    let black = Rgb([0u8, 0, 0]);
    // Person outlines are drawn on both edges of the stroke.
    for (x, y) in [(10, 60), (11, 60), (40, 60), (25, 80)] {
        assert_ne!(*image.get_pixel(x, y), black, "person outline missing at ({x}, {y})");
    }
    // The filtered car box, its tag, and its surroundings stay untouched.
    for y in 25..=85 {
        for x in 115..=165 {
            assert_eq!(*image.get_pixel(x, y), black, "car pixel drawn at ({x}, {y})");
        }
    }
}

#[test]
fn failed_inference_reaches_sinks_without_overlay() {
    let registry = Arc::new(DetectorRegistry::new());
    registry.register(
        "scripted",
        ScriptedDetector::new(&["person"], vec![(0, 0.9)]).always_failing(),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut settings = PipelineSettings::new(common::settings(URL));
    settings.infer_on_start = true;
    assert!(settings.fps_overlay);

    let mut pipeline = Pipeline::builder(settings)
        .connector(ScriptedConnector::new(Vec::new()))
        .registry(registry)
        .sink(Box::new(CapturingSink(seen.clone())))
        .start()
        .expect("start pipeline");

    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.lock().unwrap().len() < 3 {
        assert!(Instant::now() < deadline, "no frames reached the sink");
        thread::sleep(Duration::from_millis(10));
    }
    pipeline.shutdown();

    for (error, pixels) in seen.lock().unwrap().iter() {
        assert!(error.is_some(), "inference was expected to fail");
        assert!(pixels.iter().all(|&p| p == 90), "failed frame was drawn on");
    }
}

#[test]
fn threshold_filters_low_confidence() {
    let stage = stage_with(ScriptedDetector::new(&["person"], vec![(0, 0.9), (0, 0.2)]));
    let out = stage.infer(
        Frame::filled(WIDTH, HEIGHT, [0, 0, 0], 1),
        &DetectionConfig::default(),
    );
    assert_eq!(out.detections.len(), 1);

    let strict = DetectionConfig {
        confidence_threshold: 0.95,
        ..DetectionConfig::default()
    };
    let out = stage.infer(Frame::filled(WIDTH, HEIGHT, [0, 0, 0], 2), &strict);
    assert!(out.detections.is_empty());
}

#[test]
fn config_swap_is_observed_whole() {
    let shared = Arc::new(SharedDetectionConfig::new(DetectionConfig::default()));
    let a = DetectionConfig {
        confidence_threshold: 0.1,
        image_size: 320,
        ..DetectionConfig::default()
    };
    let b = DetectionConfig {
        confidence_threshold: 0.9,
        image_size: 640,
        classes: Some(BTreeSet::from(["car".to_string()])),
        ..DetectionConfig::default()
    };

    let writer = {
        let shared = shared.clone();
        let (a, b) = (a.clone(), b.clone());
        thread::spawn(move || {
            for i in 0..500 {
                let next = if i % 2 == 0 { a.clone() } else { b.clone() };
                shared.store(next).expect("valid config");
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let shared = shared.clone();
            let (a, b) = (a.clone(), b.clone());
            thread::spawn(move || {
                for _ in 0..2_000 {
                    let seen = shared.load();
                    let whole = *seen == DetectionConfig::default() || *seen == a || *seen == b;
                    assert!(whole, "torn config observed: {:?}", seen);
                }
            })
        })
        .collect();

    writer.join().expect("writer");
    for reader in readers {
        reader.join().expect("reader");
    }
}

#[test]
fn stub_stream_runs_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recording = dir.path().join("out.mjpeg");

    let registry = Arc::new(DetectorRegistry::new());
    registry.register("stub", StubBackend::new());
    let mut settings = PipelineSettings::new(common::settings("stub://e2e?fps=60&width=64&height=48"));
    settings.infer_on_start = true;

    let mut pipeline = Pipeline::builder(settings)
        .registry(registry)
        .sink(Box::new(RecordingSink::create(&recording).expect("recording")))
        .start()
        .expect("start pipeline");
    let control = pipeline.control();
    let events = control.broadcast().subscribe(16);

    let deadline = Instant::now() + Duration::from_secs(5);
    let event = loop {
        let event = events
            .recv_timeout(Duration::from_secs(5))
            .expect("broadcast event");
        if event.fps.is_some() && event.jpeg.is_some() {
            break event;
        }
        assert!(Instant::now() < deadline, "no inferred frame broadcast");
    };
    assert!(event.error.is_none());
    assert!(event.frame_counter >= 1);

    let status = control.status();
    assert!(status.stream_connected);
    assert_eq!(status.connection_state, ConnectionState::Connected);
    assert!(status.inference_enabled);
    assert!(status.model_loaded);
    assert_eq!(status.active_model.as_deref(), Some("stub"));
    assert!(status.frames >= 1);
    assert!(status.fps_avg.is_some());

    let preview = control.preview().latest().expect("preview frame");
    assert_eq!(&preview.jpeg[..2], &[0xFF, 0xD8]);

    control.stop_inference();
    assert!(!control.status().inference_enabled);
    assert!(control.status().fps.is_none());

    pipeline.shutdown();
    pipeline.shutdown();
    let status = pipeline.status();
    assert!(!status.stream_connected);
    assert_eq!(status.connection_state, ConnectionState::Disconnected);
    let written = std::fs::metadata(&recording).expect("recording file").len();
    assert!(written > 0);
}

#[test]
fn control_operations_validate_their_inputs() {
    let registry = Arc::new(DetectorRegistry::new());
    let settings = PipelineSettings::new(common::settings("stub://control?fps=30"));
    let mut pipeline = Pipeline::builder(settings)
        .registry(registry.clone())
        .start()
        .expect("start pipeline");
    let control = pipeline.control();

    assert!(matches!(control.start_inference(), Err(ControlError::ModelNotLoaded)));
    assert!(!control.status().model_loaded);
    assert!(control.status().active_model.is_none());

    assert!(matches!(
        control.change_model("missing"),
        Err(ControlError::UnknownModel(name)) if name == "missing"
    ));

    let bad = DetectionConfigUpdate {
        confidence_threshold: Some(1.5),
        ..DetectionConfigUpdate::default()
    };
    assert!(matches!(control.update_config(bad), Err(ControlError::InvalidConfig(_))));
    assert_eq!(control.detection_config().confidence_threshold, 0.3);

    let good = DetectionConfigUpdate {
        confidence_threshold: Some(0.6),
        classes: Some(BTreeSet::from(["person".to_string()])),
        ..DetectionConfigUpdate::default()
    };
    let applied = control.update_config(good).expect("valid update");
    assert_eq!(applied.confidence_threshold, 0.6);
    assert_eq!(*control.detection_config(), *applied);

    registry.register("alpha", StubBackend::new());
    registry.register("beta", StubBackend::new());
    control.start_inference().expect("model now loaded");
    control.change_model("beta").expect("known model");
    assert_eq!(control.status().active_model.as_deref(), Some("beta"));
    assert_eq!(control.models(), vec!["alpha".to_string(), "beta".to_string()]);

    pipeline.shutdown();
}

#[test]
fn unreachable_stream_reports_unavailable_at_most_once_per_second() {
    let settings = PipelineSettings::new(common::settings("stub://down?refuse=true"));
    let mut pipeline = Pipeline::builder(settings)
        .sleeper(Arc::new(ShortSleeper))
        .start()
        .expect("start pipeline");
    let events = pipeline.control().broadcast().subscribe(16);

    let first = events
        .recv_timeout(Duration::from_secs(3))
        .expect("first notice");
    let second = events
        .recv_timeout(Duration::from_secs(3))
        .expect("second notice");
    for event in [&first, &second] {
        assert_eq!(event.error.as_deref(), Some(STREAM_UNAVAILABLE));
        assert!(event.jpeg.is_none());
        assert!(event.sequence.is_none());
    }
    assert!(second.timestamp_ms.saturating_sub(first.timestamp_ms) >= 900);

    let status = pipeline.status();
    assert!(!status.stream_connected);
    assert!(status.reconnect_attempts >= 1);
    assert!(status.last_error.is_some());
    assert_eq!(status.frames, 0);

    pipeline.shutdown();
}
