//! Pushed message payloads.
//!
//! Inbound `message` RPCs and outbound `publish` requests share the same
//! `module_id` / `command` / `params` body, so a published body can be fed
//! back through the same routing on the receiving side.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::constants::SenderType;
use crate::ProtoError;

/// Body of a pushed or published message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Owning module, e.g. `im`, `online`, `pull`.
    #[serde(default)]
    pub module_id: String,
    /// Command within the module.
    #[serde(default)]
    pub command: String,
    /// Command parameters.
    #[serde(default)]
    pub params: Value,
    /// Server-side metadata.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

impl MessageBody {
    /// Create a body without extras.
    #[must_use]
    pub fn new(module_id: impl Into<String>, command: impl Into<String>, params: Value) -> Self {
        Self {
            module_id: module_id.into(),
            command: command.into(),
            params,
            extra: Value::Null,
        }
    }

    /// Module id folded to lower case, as used for routing.
    #[must_use]
    pub fn module(&self) -> String {
        self.module_id.to_lowercase()
    }

    /// `"<module>.<command>"`.
    #[must_use]
    pub fn event_type(&self) -> String {
        format!("{}.{}", self.module(), self.command)
    }
}

/// `params` of an inbound `message` RPC.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PushMessage {
    /// Server-assigned message id. Numbers are normalized to strings.
    #[serde(default, deserialize_with = "deserialize_mid")]
    pub mid: Option<String>,
    /// The id exactly as sent, echoed back in the ack.
    #[serde(skip)]
    pub mid_value: Option<Value>,
    /// Routed payload.
    #[serde(default)]
    pub body: MessageBody,
    /// Raw sender description, if any.
    #[serde(default)]
    pub sender: Value,
}

impl PushMessage {
    /// Decode from the `params` of a `message` RPC.
    ///
    /// # Errors
    ///
    /// Returns an error if `params` is not an object of the expected shape.
    pub fn from_params(params: Value) -> Result<Self, ProtoError> {
        if !params.is_object() {
            return Err(ProtoError::Decoding(
                "message params must be an object".to_string(),
            ));
        }
        let mid_value = params.get("mid").cloned();
        let mut message: Self =
            serde_json::from_value(params).map_err(|e| ProtoError::Decoding(e.to_string()))?;
        if message.mid.is_some() {
            message.mid_value = mid_value;
        }
        Ok(message)
    }

    /// Id to acknowledge, in its wire form.
    #[must_use]
    pub fn ack_mid(&self) -> Option<Value> {
        self.mid_value
            .clone()
            .or_else(|| self.mid.clone().map(Value::String))
    }

    /// Reported sender type.
    #[must_use]
    pub fn sender_type(&self) -> SenderType {
        self.sender
            .get("type")
            .and_then(Value::as_u64)
            .map_or(SenderType::Unknown, SenderType::from)
    }

    /// Body params, or an empty object when absent.
    #[must_use]
    pub fn params(&self) -> Value {
        match &self.body.params {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        }
    }

    /// Body extras with the sender folded in under `sender`.
    #[must_use]
    pub fn extra(&self) -> Value {
        let mut extra = match &self.body.extra {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        if !self.sender.is_null() {
            extra.insert("sender".to_string(), self.sender.clone());
        }
        Value::Object(extra)
    }
}

fn deserialize_mid<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_folds_module_case() {
        let body = MessageBody::new("IM", "messageChat", json!({}));
        assert_eq!(body.module(), "im");
        assert_eq!(body.event_type(), "im.messageChat");
    }

    #[test]
    fn test_push_message_string_mid() {
        let message = PushMessage::from_params(json!({
            "mid": "a1b2",
            "body": { "module_id": "im", "command": "message", "params": { "text": "hi" } }
        }))
        .unwrap();
        assert_eq!(message.mid.as_deref(), Some("a1b2"));
        assert_eq!(message.ack_mid(), Some(json!("a1b2")));
        assert_eq!(message.body.command, "message");
        assert_eq!(message.params()["text"], "hi");
    }

    #[test]
    fn test_push_message_numeric_and_empty_mid() {
        let message = PushMessage::from_params(json!({ "mid": 17 })).unwrap();
        assert_eq!(message.mid.as_deref(), Some("17"));
        assert_eq!(message.ack_mid(), Some(json!(17)));

        let message = PushMessage::from_params(json!({ "mid": "" })).unwrap();
        assert!(message.mid.is_none());
        assert!(message.ack_mid().is_none());
    }

    #[test]
    fn test_push_message_rejects_non_object() {
        assert!(PushMessage::from_params(json!("nope")).is_err());
        assert!(PushMessage::from_params(Value::Null).is_err());
    }

    #[test]
    fn test_missing_params_become_empty_object() {
        let message = PushMessage::from_params(json!({
            "body": { "module_id": "pull", "command": "config_expired" }
        }))
        .unwrap();
        assert_eq!(message.params(), json!({}));
    }

    #[test]
    fn test_sender_folded_into_extra() {
        let message = PushMessage::from_params(json!({
            "body": { "module_id": "im", "command": "x", "extra": { "server_time": "now" } },
            "sender": { "type": 2, "id": "srv" }
        }))
        .unwrap();
        let extra = message.extra();
        assert_eq!(extra["server_time"], "now");
        assert_eq!(extra["sender"]["id"], "srv");
        assert_eq!(message.sender_type(), SenderType::Backend);
    }
}
