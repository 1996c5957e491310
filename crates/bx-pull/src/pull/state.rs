//! Connection state types.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bx_pull_proto::PullStatus;

/// State of the Pull connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Offline,
    /// Socket being opened.
    Connecting,
    /// Socket open and subscribed.
    Online,
}

impl ConnectionState {
    /// Wire spelling used in status reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Connecting => "connect",
            Self::Online => "online",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<PullStatus> for ConnectionState {
    fn from(status: PullStatus) -> Self {
        match status {
            PullStatus::Offline => Self::Offline,
            PullStatus::Connecting => Self::Connecting,
            PullStatus::Online => Self::Online,
        }
    }
}

/// Atomic wrapper for connection state.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU32);

impl AtomicConnectionState {
    /// Create a new atomic state.
    #[must_use]
    pub const fn new(state: ConnectionState) -> Self {
        Self(AtomicU32::new(state as u32))
    }

    /// Load the current state.
    #[must_use]
    pub fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::SeqCst) {
            0 => ConnectionState::Offline,
            1 => ConnectionState::Connecting,
            _ => ConnectionState::Online,
        }
    }

    /// Store a new state.
    pub(crate) fn store(&self, state: ConnectionState) {
        self.0.store(state as u32, Ordering::SeqCst);
    }
}

impl Default for AtomicConnectionState {
    fn default() -> Self {
        Self::new(ConnectionState::Offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_enum() {
        assert_eq!(ConnectionState::Offline as u32, 0);
        assert_eq!(ConnectionState::Connecting as u32, 1);
        assert_eq!(ConnectionState::Online as u32, 2);
    }

    #[test]
    fn test_atomic_connection_state() {
        let state = AtomicConnectionState::default();
        assert_eq!(state.load(), ConnectionState::Offline);

        state.store(ConnectionState::Connecting);
        assert_eq!(state.load(), ConnectionState::Connecting);

        state.store(ConnectionState::Online);
        assert_eq!(state.load(), ConnectionState::Online);
    }

    #[test]
    fn test_from_server_status() {
        assert_eq!(ConnectionState::from(PullStatus::Online), ConnectionState::Online);
        assert_eq!(ConnectionState::from(PullStatus::Connecting), ConnectionState::Connecting);
        assert_eq!(ConnectionState::Connecting.to_string(), "connect");
    }
}
