//! Events delivered to the owning application.

use std::time::Duration;

use bx_pull_proto::{PushMessage, SenderType};
use serde::Serialize;
use serde_json::Value;

/// A pushed message, normalized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushEvent {
    /// `"<module>.<command>"`, module lower-cased.
    pub event_type: String,
    /// Module id, lower-cased.
    pub module_id: String,
    /// Command.
    pub command: String,
    /// Command parameters (an object).
    pub params: Value,
    /// Server metadata, with the sender under `sender`.
    pub extra: Value,
    /// Server message id, if any.
    pub mid: Option<String>,
    /// Reported origin.
    pub sender_type: SenderType,
}

impl From<&PushMessage> for PushEvent {
    fn from(message: &PushMessage) -> Self {
        Self {
            event_type: message.body.event_type(),
            module_id: message.body.module(),
            command: message.body.command.clone(),
            params: message.params(),
            extra: message.extra(),
            mid: message.mid.clone(),
            sender_type: message.sender_type(),
        }
    }
}

/// Presence change for a watched user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserStatus {
    /// Portal user id.
    pub user_id: u64,
    /// Whether the user is online.
    pub online: bool,
}

/// Events emitted by [`crate::PullClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum PullEvent {
    /// A pushed message.
    Message(PushEvent),
    /// An RPC with a method this client does not interpret.
    Rpc {
        /// Method name.
        method: String,
        /// Raw parameters.
        params: Value,
    },
    /// Connection status changed.
    Status {
        /// Whether the connection is online.
        connected: bool,
        /// Human-readable detail.
        message: String,
    },
    /// A reconnect was scheduled.
    Reconnecting {
        /// One-based attempt number.
        attempt: u32,
        /// Delay before connecting.
        delay: Duration,
    },
    /// The attempt ceiling was reached; an explicit start is required.
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
    },
    /// The portal rejected the credentials.
    AuthenticationFailed {
        /// Failure detail.
        reason: String,
    },
    /// Diagnostic trace.
    Debug(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_event_from_message() {
        let message = PushMessage::from_params(json!({
            "mid": 12,
            "body": { "module_id": "IM", "command": "message", "params": { "text": "hi" } },
            "sender": { "type": 1 }
        }))
        .unwrap();

        let event = PushEvent::from(&message);
        assert_eq!(event.event_type, "im.message");
        assert_eq!(event.module_id, "im");
        assert_eq!(event.params["text"], "hi");
        assert_eq!(event.extra["sender"]["type"], 1);
        assert_eq!(event.mid.as_deref(), Some("12"));
        assert_eq!(event.sender_type, SenderType::Client);
    }

    #[test]
    fn test_pull_event_variants() {
        let event = PullEvent::Reconnecting {
            attempt: 3,
            delay: Duration::from_secs(20),
        };
        if let PullEvent::Reconnecting { attempt, delay } = event {
            assert_eq!(attempt, 3);
            assert_eq!(delay, Duration::from_secs(20));
        } else {
            panic!("expected Reconnecting");
        }

        let event = PullEvent::Status {
            connected: false,
            message: "Disconnected".to_string(),
        };
        assert!(matches!(event, PullEvent::Status { connected: false, .. }));
    }

    #[test]
    fn test_user_status_serializes() {
        let status = UserStatus { user_id: 5, online: true };
        assert_eq!(serde_json::to_value(status).unwrap(), json!({ "user_id": 5, "online": true }));
    }
}
