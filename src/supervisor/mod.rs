//! Connection supervision.
//!
//! `ConnectionSupervisor` owns the lifecycle of the capture side:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Degraded | Disconnected -> Connecting -> ...
//!                   any -> ShuttingDown
//! ```
//!
//! - `Connecting` opens the source and probes it: the attempt only counts as
//!   connected once a real frame arrives within the probe window.
//! - Failed attempts wait per `BackoffPolicy` through an injected `Sleeper`
//!   and retry forever. The consecutive attempt counter resets on success.
//! - `Connected` watches the capture worker. A stall-threshold loss or a
//!   crashed worker moves to `Degraded`; end of stream to `Disconnected`.
//! - Recovery tears down the worker and source, clears the relay and
//!   re-enters `Connecting`.

mod backoff;
mod capture;
mod status;

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::SourceError;
use crate::frame::Frame;
use crate::ingest::{
    Endpoint, FrameSource, MediaConnector, SourceSettings, DEFAULT_OPEN_TIMEOUT,
};
use crate::relay::SingleSlotRelay;
use crate::shutdown::{ShutdownSignal, SignalSleeper, Sleeper};

pub use backoff::BackoffPolicy;
pub use status::{ConnectionSnapshot, ConnectionState, ConnectionStatus};

use capture::{CaptureWorker, WorkerExit, STALL_PAUSE};

pub const DEFAULT_PROBE_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub endpoint: Endpoint,
    pub source: SourceSettings,
    pub open_timeout: Duration,
    /// How long a freshly opened source gets to produce its first frame.
    pub probe_window: Duration,
    /// How often a connected supervisor checks on the capture worker.
    pub monitor_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl SupervisorSettings {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            source: SourceSettings::default(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            probe_window: DEFAULT_PROBE_WINDOW,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Connecting,
    Connected,
    Degraded,
    Disconnected,
    ShuttingDown,
}

impl SupervisorState {
    fn public(self) -> ConnectionState {
        match self {
            SupervisorState::Connecting => ConnectionState::Connecting,
            SupervisorState::Connected => ConnectionState::Connected,
            SupervisorState::Degraded => ConnectionState::Degraded,
            SupervisorState::Idle
            | SupervisorState::Disconnected
            | SupervisorState::ShuttingDown => ConnectionState::Disconnected,
        }
    }
}

pub struct ConnectionSupervisor {
    settings: SupervisorSettings,
    connector: Arc<dyn MediaConnector>,
    relay: Arc<SingleSlotRelay>,
    status: Arc<ConnectionStatus>,
    shutdown: ShutdownSignal,
    sleeper: Arc<dyn Sleeper>,
    state: SupervisorState,
    attempts: u32,
    worker: Option<CaptureWorker>,
}

impl ConnectionSupervisor {
    pub fn new(
        settings: SupervisorSettings,
        connector: Arc<dyn MediaConnector>,
        relay: Arc<SingleSlotRelay>,
        status: Arc<ConnectionStatus>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            settings,
            connector,
            relay,
            status,
            shutdown,
            sleeper: Arc::new(SignalSleeper),
            state: SupervisorState::Idle,
            attempts: 0,
            worker: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Consecutive failed connect attempts since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn status(&self) -> &Arc<ConnectionStatus> {
        &self.status
    }

    /// `Idle -> Connecting`.
    pub fn start(&mut self) {
        if self.state == SupervisorState::Idle {
            log::info!("supervisor: connecting to {}", self.settings.endpoint);
            self.enter(SupervisorState::Connecting);
            self.status.set_connecting(0, None);
        }
    }

    /// Run one connect attempt. On failure, waits out the backoff delay
    /// before returning.
    pub fn connect_once(&mut self) -> SupervisorState {
        if self.state != SupervisorState::Connecting {
            return self.state;
        }
        let result = self.open_and_probe().and_then(|(source, first)| {
            // Consumers only see frames once the status reads connected, and
            // the probe frame must land before anything the worker reads.
            self.status.set_connected();
            self.relay.publish(first);
            CaptureWorker::spawn(source, self.relay.clone(), self.shutdown.clone())
                .map_err(|e: io::Error| SourceError::Init(format!("spawn capture worker: {}", e)))
        });

        match result {
            Ok(worker) => {
                self.worker = Some(worker);
                if self.attempts > 0 {
                    log::info!(
                        "supervisor: connected to {} after {} failed attempts",
                        self.settings.endpoint,
                        self.attempts
                    );
                } else {
                    log::info!("supervisor: connected to {}", self.settings.endpoint);
                }
                self.attempts = 0;
                self.enter(SupervisorState::Connected);
            }
            Err(err) => {
                self.attempts = self.attempts.saturating_add(1);
                let delay = self.settings.backoff.delay_for(self.attempts);
                match &err {
                    SourceError::Init(_) => log::error!(
                        "supervisor: attempt {} failed: {}; retrying in {:?}",
                        self.attempts,
                        err,
                        delay
                    ),
                    _ => log::warn!(
                        "supervisor: attempt {} failed: {}; retrying in {:?}",
                        self.attempts,
                        err,
                        delay
                    ),
                }
                self.status
                    .set_connecting(self.attempts, Some(err.to_string()));
                if self.shutdown.is_triggered() || self.sleeper.sleep(delay, &self.shutdown) {
                    self.shutdown();
                }
            }
        }
        self.state
    }

    /// While connected, wait one monitor interval for the capture worker to
    /// report trouble.
    pub fn monitor_once(&mut self) -> SupervisorState {
        if self.state != SupervisorState::Connected {
            return self.state;
        }
        let Some(worker) = self.worker.as_ref() else {
            self.lost(SupervisorState::Degraded, "capture worker missing".into());
            return self.state;
        };
        let exit = worker.wait_exit(self.settings.monitor_interval);
        if self.shutdown.is_triggered() {
            return self.state;
        }
        match exit {
            None => {}
            Some(WorkerExit::Lost(err @ SourceError::EndOfStream(_))) => {
                self.lost(SupervisorState::Disconnected, err.to_string())
            }
            Some(WorkerExit::Lost(err)) => self.lost(SupervisorState::Degraded, err.to_string()),
            Some(WorkerExit::Crashed) => {
                self.lost(SupervisorState::Degraded, "capture worker exited unexpectedly".into())
            }
        }
        self.state
    }

    /// `Degraded | Disconnected -> Connecting`: drop the stale worker and
    /// source, clear the relay.
    pub fn recover(&mut self) -> SupervisorState {
        if !matches!(
            self.state,
            SupervisorState::Degraded | SupervisorState::Disconnected
        ) {
            return self.state;
        }
        self.release_capture();
        self.relay.clear();
        self.status.record_reconnect();
        self.status.set_connecting(self.attempts, None);
        log::info!("supervisor: reconnecting to {}", self.settings.endpoint);
        self.enter(SupervisorState::Connecting);
        self.state
    }

    /// Advance the state machine by one step.
    pub fn step(&mut self) -> SupervisorState {
        if self.shutdown.is_triggered() {
            self.shutdown();
            return self.state;
        }
        match self.state {
            SupervisorState::Idle => {
                self.start();
                self.state
            }
            SupervisorState::Connecting => self.connect_once(),
            SupervisorState::Connected => self.monitor_once(),
            SupervisorState::Degraded | SupervisorState::Disconnected => self.recover(),
            SupervisorState::ShuttingDown => self.state,
        }
    }

    /// Drive the state machine until shutdown.
    pub fn run(&mut self) {
        while self.state != SupervisorState::ShuttingDown {
            self.step();
        }
    }

    /// Release the capture loop and source. Idempotent.
    pub fn shutdown(&mut self) {
        if self.state == SupervisorState::ShuttingDown {
            return;
        }
        self.shutdown.trigger();
        self.release_capture();
        self.enter(SupervisorState::ShuttingDown);
        self.status.set_disconnected();
        log::info!("supervisor: stopped");
    }

    /// Run on a dedicated `skywatch-supervisor` thread.
    pub fn spawn(mut self) -> io::Result<SupervisorHandle> {
        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name("skywatch-supervisor".into())
            .spawn(move || {
                self.start();
                self.run();
            })?;
        Ok(SupervisorHandle {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Open the source and wait for its first frame, which is handed back
    /// unpublished.
    fn open_and_probe(&mut self) -> Result<(FrameSource, Frame), SourceError> {
        let mut source = FrameSource::open(
            self.connector.as_ref(),
            &self.settings.endpoint,
            self.settings.source.clone(),
            self.settings.open_timeout,
        )?;

        let deadline = Instant::now() + self.settings.probe_window;
        while Instant::now() < deadline && !self.shutdown.is_triggered() {
            match source.read() {
                Ok(Some(frame)) => return Ok((source, frame)),
                Ok(None) => {}
                Err(SourceError::Stalled(_)) => thread::sleep(STALL_PAUSE),
                Err(err) => return Err(err),
            }
        }
        source.close();
        Err(SourceError::unreachable(
            self.settings.endpoint.as_str(),
            format!("no frames within {:?}", self.settings.probe_window),
        ))
    }

    fn lost(&mut self, next: SupervisorState, reason: String) {
        log::warn!("supervisor: connection {:?}: {}", next, reason);
        self.status.set_lost(next.public(), reason);
        self.enter(next);
    }

    fn release_capture(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Some(mut source) = worker.stop() {
                source.close();
            }
        }
    }

    fn enter(&mut self, next: SupervisorState) {
        if self.state != next {
            log::debug!("supervisor: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.release_capture();
    }
}

/// Handle to a supervisor running on its own thread.
pub struct SupervisorHandle {
    shutdown: ShutdownSignal,
    handle: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    /// Trigger shutdown and join the supervisor thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("supervisor thread panicked");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
