//! Diagnostic counters and the read-only debug snapshot.

use std::time::{Duration, Instant};

use bx_pull_proto::REVISION;
use parking_lot::Mutex;
use serde::Serialize;

use crate::auth::{AuthMaterial, AuthMode};

use super::state::ConnectionState;

/// Channel ids longer than this are truncated in snapshots.
pub const CHANNEL_DISPLAY_LEN: usize = 30;

#[derive(Debug)]
struct Counters {
    connected_at: Option<Instant>,
    last_message_at: Option<Instant>,
    messages_received: u64,
    messages_sent: u64,
    bytes_received: u64,
    bytes_sent: u64,
    channel_id: Option<String>,
    revision: u32,
    config_timestamp: i64,
    rpc_id: u64,
    reconnect_attempts: u32,
    auth_mode: Option<AuthMode>,
    has_api_token: bool,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            connected_at: None,
            last_message_at: None,
            messages_received: 0,
            messages_sent: 0,
            bytes_received: 0,
            bytes_sent: 0,
            channel_id: None,
            revision: REVISION,
            config_timestamp: 0,
            rpc_id: 0,
            reconnect_attempts: 0,
            auth_mode: None,
            has_api_token: false,
        }
    }
}

/// Counters written by the connection worker and read by the handle.
#[derive(Debug, Default)]
pub struct Diagnostics {
    counters: Mutex<Counters>,
}

impl Diagnostics {
    /// Record an inbound frame of `bytes` bytes.
    pub fn record_received(&self, bytes: usize) {
        let mut c = self.counters.lock();
        c.messages_received += 1;
        c.bytes_received += bytes as u64;
        c.last_message_at = Some(Instant::now());
    }

    /// Record an outbound frame of `bytes` bytes.
    pub fn record_sent(&self, bytes: usize) {
        let mut c = self.counters.lock();
        c.messages_sent += 1;
        c.bytes_sent += bytes as u64;
    }

    /// Mark the socket opened or closed.
    pub fn set_connected(&self, connected: bool) {
        self.counters.lock().connected_at = connected.then(Instant::now);
    }

    /// Record the bound channel.
    pub fn set_channel(&self, channel_id: Option<&str>) {
        self.counters.lock().channel_id = channel_id.map(str::to_string);
    }

    /// Record the protocol revision.
    pub fn set_revision(&self, revision: u32) {
        self.counters.lock().revision = revision;
    }

    /// Record when the configuration was resolved.
    pub fn set_config_timestamp(&self, timestamp: i64) {
        self.counters.lock().config_timestamp = timestamp;
    }

    /// Record the last allocated RPC id.
    pub fn set_rpc_id(&self, id: u64) {
        self.counters.lock().rpc_id = id;
    }

    /// Record the reconnect attempt count.
    pub fn set_reconnect_attempts(&self, attempts: u32) {
        self.counters.lock().reconnect_attempts = attempts;
    }

    /// Record the credentials in use.
    pub fn set_auth(&self, material: Option<&AuthMaterial>) {
        let mut c = self.counters.lock();
        c.auth_mode = material.map(AuthMaterial::mode);
        c.has_api_token = material.and_then(AuthMaterial::token).is_some();
    }

    /// Current protocol revision.
    #[must_use]
    pub fn revision(&self) -> u32 {
        self.counters.lock().revision
    }

    /// Build a snapshot.
    #[must_use]
    pub fn snapshot(&self, identity: &SnapshotIdentity<'_>, state: ConnectionState) -> DebugSnapshot {
        let c = self.counters.lock();
        DebugSnapshot {
            status: state.as_str().to_string(),
            connected: state == ConnectionState::Online,
            user_id: identity.user_id,
            channel_id: c.channel_id.as_deref().map(truncate_channel),
            site_id: identity.site_id.to_string(),
            reconnect_attempts: c.reconnect_attempts,
            revision: c.revision,
            config_timestamp: c.config_timestamp,
            rpc_id_counter: c.rpc_id,
            use_api_token: identity.use_api_token,
            has_api_token: c.has_api_token,
            auth_mode: c.auth_mode.map(|mode| mode.to_string()),
            messages_received: c.messages_received,
            messages_sent: c.messages_sent,
            bytes_received: c.bytes_received,
            bytes_sent: c.bytes_sent,
            connected_for_ms: c.connected_at.map(|t| millis(t.elapsed())),
            last_message_age_ms: c.last_message_at.map(|t| millis(t.elapsed())),
        }
    }
}

/// Static identity fields of a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotIdentity<'a> {
    /// Portal user id.
    pub user_id: u64,
    /// Site id.
    pub site_id: &'a str,
    /// Whether token mode was requested.
    pub use_api_token: bool,
}

/// Point-in-time view of the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugSnapshot {
    /// `offline`, `connect` or `online`.
    pub status: String,
    /// Whether the connection is online.
    pub connected: bool,
    /// Portal user id.
    pub user_id: u64,
    /// Bound channel, truncated for display.
    pub channel_id: Option<String>,
    /// Site id.
    pub site_id: String,
    /// Reconnect attempts since the last successful open.
    pub reconnect_attempts: u32,
    /// Protocol revision.
    pub revision: u32,
    /// When the configuration was resolved, Unix seconds.
    pub config_timestamp: i64,
    /// Last allocated RPC id.
    pub rpc_id_counter: u64,
    /// Whether token mode was requested.
    pub use_api_token: bool,
    /// Whether a token is in use.
    pub has_api_token: bool,
    /// Mode of the credentials in use.
    pub auth_mode: Option<String>,
    /// Inbound frames.
    pub messages_received: u64,
    /// Outbound frames.
    pub messages_sent: u64,
    /// Inbound payload bytes.
    pub bytes_received: u64,
    /// Outbound payload bytes.
    pub bytes_sent: u64,
    /// Time since the socket opened.
    pub connected_for_ms: Option<u64>,
    /// Time since the last inbound frame.
    pub last_message_age_ms: Option<u64>,
}

/// Shorten a channel id to [`CHANNEL_DISPLAY_LEN`] characters plus `...`.
#[must_use]
pub fn truncate_channel(id: &str) -> String {
    match id.char_indices().nth(CHANNEL_DISPLAY_LEN) {
        Some((cut, _)) => format!("{}...", &id[..cut]),
        None => id.to_string(),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY: SnapshotIdentity<'static> = SnapshotIdentity {
        user_id: 7,
        site_id: "ap",
        use_api_token: true,
    };

    #[test]
    fn test_truncate_channel() {
        assert_eq!(truncate_channel("short"), "short");
        let exact = "a".repeat(30);
        assert_eq!(truncate_channel(&exact), exact);
        let long = "b".repeat(31);
        assert_eq!(truncate_channel(&long), format!("{}...", "b".repeat(30)));
    }

    #[test]
    fn test_fresh_snapshot() {
        let diagnostics = Diagnostics::default();
        let snapshot = diagnostics.snapshot(&IDENTITY, ConnectionState::Offline);

        assert_eq!(snapshot.status, "offline");
        assert!(!snapshot.connected);
        assert_eq!(snapshot.revision, REVISION);
        assert_eq!(snapshot.channel_id, None);
        assert_eq!(snapshot.connected_for_ms, None);
        assert_eq!(snapshot.last_message_age_ms, None);
        assert!(!snapshot.has_api_token);
    }

    #[test]
    fn test_counters_reflected() {
        let diagnostics = Diagnostics::default();
        diagnostics.set_connected(true);
        diagnostics.record_received(10);
        diagnostics.record_received(5);
        diagnostics.record_sent(3);
        diagnostics.set_channel(Some(&"c".repeat(40)));
        diagnostics.set_rpc_id(4);
        diagnostics.set_reconnect_attempts(2);
        diagnostics.set_auth(Some(&AuthMaterial::Token {
            token: "t".to_string(),
            cookie_header: None,
        }));

        let snapshot = diagnostics.snapshot(&IDENTITY, ConnectionState::Online);
        assert!(snapshot.connected);
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.bytes_received, 15);
        assert_eq!(snapshot.messages_sent, 1);
        assert_eq!(snapshot.bytes_sent, 3);
        assert_eq!(snapshot.channel_id.as_deref().map(str::len), Some(33));
        assert_eq!(snapshot.rpc_id_counter, 4);
        assert_eq!(snapshot.reconnect_attempts, 2);
        assert_eq!(snapshot.auth_mode.as_deref(), Some("token"));
        assert!(snapshot.has_api_token);
        assert!(snapshot.connected_for_ms.is_some());
        assert!(snapshot.last_message_age_ms.is_some());

        diagnostics.set_connected(false);
        let snapshot = diagnostics.snapshot(&IDENTITY, ConnectionState::Offline);
        assert_eq!(snapshot.connected_for_ms, None);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = Diagnostics::default().snapshot(&IDENTITY, ConnectionState::Connecting);
        let value = serde_json::to_value(snapshot).unwrap();
        assert_eq!(value["status"], "connect");
        assert_eq!(value["site_id"], "ap");
        assert_eq!(value["use_api_token"], true);
    }
}
