//! Protocol constants.

use serde::{Deserialize, Serialize};

/// Web protocol revision spoken by this client.
pub const REVISION: u32 = 19;

/// Mobile protocol revision advertised in publish extras.
pub const MOBILE_REVISION: u32 = 3;

/// Value of the `jsonrpc` field on every outbound envelope.
pub const JSON_RPC_VERSION: &str = "2.0";

/// Bare keepalive sentinel sent outside the envelope.
pub const PING: &str = "ping";

/// Reply to [`PING`].
pub const PONG: &str = "pong";

/// WebSocket close codes used by the Pull server and client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// Regular shutdown; never followed by a reconnect.
    NormalClosure,
    /// Server going away.
    ServerDie,
    /// Channel configuration replaced by the server.
    ConfigReplaced,
    /// Channel validity window elapsed.
    ChannelExpired,
    /// Server restarted.
    ServerRestarted,
    /// Pull configuration expired.
    ConfigExpired,
    /// Disconnect requested by the owning application.
    Manual,
    /// No inbound traffic within the ping-wait window.
    Stuck,
    /// Server rejected the channel id.
    WrongChannelId,
    /// Any other code.
    Other(u16),
}

impl CloseCode {
    /// Whether a close with this code should be followed by a reconnect.
    #[must_use]
    pub const fn reconnects(self) -> bool {
        !matches!(self, Self::NormalClosure)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::NormalClosure,
            1001 => Self::ServerDie,
            3000 => Self::ConfigReplaced,
            3001 => Self::ChannelExpired,
            3002 => Self::ServerRestarted,
            3003 => Self::ConfigExpired,
            3004 => Self::Manual,
            3005 => Self::Stuck,
            4010 => Self::WrongChannelId,
            other => Self::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::NormalClosure => 1000,
            CloseCode::ServerDie => 1001,
            CloseCode::ConfigReplaced => 3000,
            CloseCode::ChannelExpired => 3001,
            CloseCode::ServerRestarted => 3002,
            CloseCode::ConfigExpired => 3003,
            CloseCode::Manual => 3004,
            CloseCode::Stuck => 3005,
            CloseCode::WrongChannelId => 4010,
            CloseCode::Other(other) => other,
        }
    }
}

/// Connection status as reported by the server in `pull.connection_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullStatus {
    /// Channel is not delivering.
    #[serde(rename = "offline")]
    Offline,
    /// Channel is delivering.
    #[serde(rename = "online")]
    Online,
    /// Channel is being established.
    #[serde(rename = "connect")]
    Connecting,
}

impl PullStatus {
    /// Parse the wire spelling. Unknown values yield `None`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "offline" => Some(Self::Offline),
            "online" => Some(Self::Online),
            "connect" => Some(Self::Connecting),
            _ => None,
        }
    }

    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Connecting => "connect",
        }
    }
}

/// Origin of a pushed message (`sender.type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    /// Not reported.
    #[default]
    Unknown,
    /// Another client.
    Client,
    /// Portal backend.
    Backend,
}

impl From<u64> for SenderType {
    fn from(value: u64) -> Self {
        match value {
            1 => Self::Client,
            2 => Self::Backend,
            _ => Self::Unknown,
        }
    }
}
