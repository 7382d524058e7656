//! The capture worker: one thread that owns an open `FrameSource` and feeds
//! the relay until the connection is lost or it is told to stop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::SourceError;
use crate::ingest::FrameSource;
use crate::relay::SingleSlotRelay;
use crate::shutdown::ShutdownSignal;

pub(super) const STALL_PAUSE: Duration = Duration::from_millis(10);

/// Why the capture worker stopped on its own.
#[derive(Debug)]
pub(crate) enum WorkerExit {
    /// The source reported a connection-ending error (already closed).
    Lost(SourceError),
    /// The thread ended without reporting (panic).
    Crashed,
}

pub(crate) struct CaptureWorker {
    stop: Arc<AtomicBool>,
    exits: Receiver<SourceError>,
    handle: Option<JoinHandle<FrameSource>>,
}

impl CaptureWorker {
    pub(crate) fn spawn(
        source: FrameSource,
        relay: Arc<SingleSlotRelay>,
        shutdown: ShutdownSignal,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, exits) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("skywatch-capture".into())
            .spawn({
                let stop = stop.clone();
                move || capture_loop(source, &relay, &stop, &shutdown, tx)
            })?;
        Ok(Self {
            stop,
            exits,
            handle: Some(handle),
        })
    }

    /// Wait up to `timeout` for the worker to exit on its own.
    pub(crate) fn wait_exit(&self, timeout: Duration) -> Option<WorkerExit> {
        match self.exits.recv_timeout(timeout) {
            Ok(err) => Some(WorkerExit::Lost(err)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(WorkerExit::Crashed),
        }
    }

    /// Stop the worker and take back its source. `None` if the thread panicked.
    pub(crate) fn stop(mut self) -> Option<FrameSource> {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(source) => Some(source),
            Err(_) => {
                log::error!("capture worker panicked; its source was dropped during unwind");
                None
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn capture_loop(
    mut source: FrameSource,
    relay: &SingleSlotRelay,
    stop: &AtomicBool,
    shutdown: &ShutdownSignal,
    exits: Sender<SourceError>,
) -> FrameSource {
    while !stop.load(Ordering::SeqCst) && !shutdown.is_triggered() {
        match source.read() {
            Ok(Some(frame)) => relay.publish(frame),
            Ok(None) => {}
            Err(SourceError::Stalled(_)) => thread::sleep(STALL_PAUSE),
            Err(err) => {
                log::warn!("capture on {} ended: {}", source.endpoint(), err);
                let _ = exits.send(err);
                // Keep the sender alive until told to stop so the supervisor
                // sees exactly one report and never a hang-up.
                while !stop.load(Ordering::SeqCst) && !shutdown.is_triggered() {
                    thread::sleep(STALL_PAUSE);
                }
                break;
            }
        }
    }
    source
}
