#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skywatch::detect::{BoundingBox, DetectRequest, DetectorBackend, RawDetection};
use skywatch::ingest::{Endpoint, MediaConnector, MediaStream, SourceSettings};
use skywatch::shutdown::{ShutdownSignal, Sleeper};
use skywatch::supervisor::{BackoffPolicy, SupervisorSettings};
use skywatch::{RawImage, SourceError};

pub const WIDTH: u32 = 32;
pub const HEIGHT: u32 = 24;

/// One scripted read result.
#[derive(Clone, Debug)]
pub enum Step {
    Frame,
    Stall,
    Eos,
}

/// What a connector does on one `open` call.
#[derive(Clone, Debug)]
pub enum Open {
    Refuse,
    /// Play the steps, then produce frames forever.
    Script(Vec<Step>),
    /// Never produce a frame.
    Silent,
    /// Never produce a frame, and report each stall without waiting.
    Mute,
}

pub struct ScriptedStream {
    steps: VecDeque<Step>,
    silent: bool,
    instant_stalls: bool,
    reads: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl MediaStream for ScriptedStream {
    fn read(&mut self, timeout: Duration) -> Result<RawImage, SourceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let step = if self.silent {
            Step::Stall
        } else {
            self.steps.pop_front().unwrap_or(Step::Frame)
        };
        match step {
            Step::Frame => {
                std::thread::sleep(Duration::from_millis(2));
                Ok(RawImage::rgb(
                    vec![90; (WIDTH * HEIGHT * 3) as usize],
                    WIDTH,
                    HEIGHT,
                ))
            }
            Step::Stall if self.instant_stalls => Err(SourceError::Stalled(timeout)),
            Step::Stall => {
                std::thread::sleep(timeout.min(Duration::from_millis(5)));
                Err(SourceError::Stalled(timeout))
            }
            Step::Eos => Err(SourceError::EndOfStream("scripted end of stream".into())),
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector that plays back `Open` outcomes in order; once exhausted every
/// open succeeds with an endless frame stream.
#[derive(Default)]
pub struct ScriptedConnector {
    opens: Mutex<VecDeque<Open>>,
    pub open_calls: AtomicUsize,
    pub reads: Arc<AtomicUsize>,
    pub closed: Mutex<Vec<Arc<AtomicBool>>>,
}

impl ScriptedConnector {
    pub fn new(opens: Vec<Open>) -> Arc<Self> {
        Arc::new(Self {
            opens: Mutex::new(opens.into()),
            ..Self::default()
        })
    }

    pub fn all_closed(&self) -> bool {
        self.closed
            .lock()
            .unwrap()
            .iter()
            .all(|flag| flag.load(Ordering::SeqCst))
    }
}

impl MediaConnector for ScriptedConnector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn open(&self, endpoint: &Endpoint, _timeout: Duration) -> Result<Box<dyn MediaStream>, SourceError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .opens
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Open::Script(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (steps, silent, instant_stalls) = match next {
            Open::Refuse => {
                return Err(SourceError::unreachable(endpoint.as_str(), "connection refused"))
            }
            Open::Script(steps) => (steps, false, false),
            Open::Silent => (Vec::new(), true, false),
            Open::Mute => (Vec::new(), true, true),
        };
        self.closed.lock().unwrap().push(closed.clone());
        Ok(Box::new(ScriptedStream {
            steps: steps.into(),
            silent,
            instant_stalls,
            reads: self.reads.clone(),
            closed,
        }))
    }
}

/// Records every requested delay and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    pub waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal) -> bool {
        self.waits.lock().unwrap().push(duration);
        shutdown.is_triggered()
    }
}

/// Real but short sleeps, so looping supervisors do not spin.
pub struct ShortSleeper;

impl Sleeper for ShortSleeper {
    fn sleep(&self, _duration: Duration, shutdown: &ShutdownSignal) -> bool {
        shutdown.wait_timeout(Duration::from_millis(10))
    }
}

pub fn settings(url: &str) -> SupervisorSettings {
    let mut settings = SupervisorSettings::new(Endpoint::parse(url).expect("endpoint"));
    settings.source = SourceSettings {
        width: WIDTH,
        height: HEIGHT,
        read_timeout: Duration::from_millis(20),
        stall_threshold: 3,
    };
    settings.open_timeout = Duration::from_millis(200);
    settings.probe_window = Duration::from_millis(300);
    settings.monitor_interval = Duration::from_millis(50);
    settings.backoff = BackoffPolicy::default();
    settings
}

/// Detector returning a fixed set of labelled detections, optionally failing
/// on chosen calls.
pub struct ScriptedDetector {
    labels: Vec<String>,
    detections: Vec<RawDetection>,
    fail_on: Vec<usize>,
    always_fail: bool,
    calls: usize,
}

impl ScriptedDetector {
    pub fn new(labels: &[&str], detections: Vec<(u32, f32)>) -> Self {
        Self::with_boxes(
            labels,
            detections
                .into_iter()
                .enumerate()
                .map(|(i, (class_id, confidence))| {
                    let x = i as f32 * 4.0;
                    (class_id, confidence, BoundingBox::new(x, 2.0, x + 3.0, 10.0))
                })
                .collect(),
        )
    }

    pub fn with_boxes(labels: &[&str], detections: Vec<(u32, f32, BoundingBox)>) -> Self {
        Self {
            labels: labels.iter().map(|l| l.to_string()).collect(),
            detections: detections
                .into_iter()
                .map(|(class_id, confidence, bbox)| RawDetection {
                    class_id,
                    confidence,
                    bbox,
                })
                .collect(),
            fail_on: Vec::new(),
            always_fail: false,
            calls: 0,
        }
    }

    /// Fail the `n`-th call (1-based).
    pub fn failing_on(mut self, n: usize) -> Self {
        self.fail_on.push(n);
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }
}

impl DetectorBackend for ScriptedDetector {
    fn name(&self) -> &str {
        "scripted"
    }

    fn detect(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
        _request: DetectRequest,
    ) -> anyhow::Result<Vec<RawDetection>> {
        self.calls += 1;
        if self.always_fail || self.fail_on.contains(&self.calls) {
            anyhow::bail!("scripted failure on call {}", self.calls);
        }
        Ok(self.detections.clone())
    }

    fn class_name(&self, class_id: u32) -> Option<&str> {
        self.labels.get(class_id as usize).map(String::as_str)
    }
}
