//! Error types for bx-pull.

use thiserror::Error;

/// Errors that can occur in client operations.
///
/// Failures inside the connection worker never surface as `PullError`;
/// they are reported through [`crate::PullEvent`] instead. These errors
/// are returned from the synchronous edges: loading settings, talking to
/// the REST collaborator, and awaiting an RPC reply.
#[derive(Debug, Error)]
pub enum PullError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Authentication rejected by the portal.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// REST collaborator call failed.
    #[error("rest call failed: {0}")]
    Rest(String),

    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Operation requires an online connection.
    #[error("not connected")]
    NotConnected,

    /// The connection closed before a reply arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// No reply within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The server answered an RPC with an error object.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] bx_pull_proto::ProtoError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PullError {
    /// Whether the portal rejected the credentials.
    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}
