//! Cooperative shutdown shared by every worker thread.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A one-way latch. Once triggered it stays triggered, and every waiter wakes.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait up to `timeout`. Returns true if shutdown was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut triggered = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*triggered {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            triggered = cvar
                .wait_timeout(triggered, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// How the supervisor waits between reconnect attempts.
///
/// Tests substitute a recorder so backoff sequences can be checked without
/// real delays.
pub trait Sleeper: Send + Sync {
    /// Sleep for `duration` or until `shutdown` fires. Returns true if the
    /// sleep was interrupted by shutdown.
    fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal) -> bool;
}

/// Real sleeper: waits on the shutdown latch so shutdown is never delayed by
/// a pending backoff.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalSleeper;

impl Sleeper for SignalSleeper {
    fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal) -> bool {
        shutdown.wait_timeout(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_false_on_timeout() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        assert!(!signal.is_triggered());
    }

    #[test]
    fn trigger_interrupts_long_sleep() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let interrupted = SignalSleeper.sleep(Duration::from_secs(30), &signal);
                (interrupted, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        signal.trigger();
        signal.trigger();
        let (interrupted, waited) = waiter.join().unwrap();
        assert!(interrupted);
        assert!(waited < Duration::from_secs(5));
    }
}
