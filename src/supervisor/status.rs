use std::sync::{PoisonError, RwLock};

use serde::Serialize;

use crate::frame::wall_clock_millis;

/// Connection state as seen by everyone outside the supervisor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

/// One consistent view of the connection, published as a whole.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    /// Consecutive failed connect attempts; 0 once connected.
    pub consecutive_attempts: u32,
    /// Times a live connection was torn down and re-entered `Connecting`.
    pub reconnects: u64,
    pub last_error: Option<String>,
    pub connected_since_ms: Option<u64>,
}

/// Shared connection status. Written only by the supervisor.
#[derive(Debug, Default)]
pub struct ConnectionStatus {
    inner: RwLock<ConnectionSnapshot>,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub(crate) fn set_connected(&self) {
        self.update(|s| {
            s.state = ConnectionState::Connected;
            s.consecutive_attempts = 0;
            s.last_error = None;
            s.connected_since_ms = Some(wall_clock_millis());
        });
    }

    pub(crate) fn set_connecting(&self, attempts: u32, error: Option<String>) {
        self.update(|s| {
            s.state = ConnectionState::Connecting;
            s.consecutive_attempts = attempts;
            if error.is_some() {
                s.last_error = error;
            }
            s.connected_since_ms = None;
        });
    }

    pub(crate) fn set_lost(&self, state: ConnectionState, error: String) {
        self.update(|s| {
            s.state = state;
            s.last_error = Some(error);
            s.connected_since_ms = None;
        });
    }

    pub(crate) fn record_reconnect(&self) {
        self.update(|s| s.reconnects += 1);
    }

    pub(crate) fn set_disconnected(&self) {
        self.update(|s| {
            s.state = ConnectionState::Disconnected;
            s.connected_since_ms = None;
        });
    }

    fn update(&self, apply: impl FnOnce(&mut ConnectionSnapshot)) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connecting_keeps_last_error_until_connected() {
        let status = ConnectionStatus::new();
        status.set_connecting(1, Some("refused".into()));
        status.set_connecting(2, None);
        let snapshot = status.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Connecting);
        assert_eq!(snapshot.consecutive_attempts, 2);
        assert_eq!(snapshot.last_error.as_deref(), Some("refused"));

        status.set_connected();
        let snapshot = status.snapshot();
        assert!(status.is_connected());
        assert_eq!(snapshot.consecutive_attempts, 0);
        assert_eq!(snapshot.last_error, None);
        assert!(snapshot.connected_since_ms.is_some());
    }

    #[test]
    fn serializes_state_in_snake_case() {
        let json = serde_json::to_value(ConnectionState::Degraded).unwrap();
        assert_eq!(json, serde_json::json!("degraded"));
    }
}
