//! JSON-RPC style envelope used on the Pull channel.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::body::MessageBody;
use crate::constants::{JSON_RPC_VERSION, PONG};
use crate::ProtoError;

/// Identifier allocated to every outbound request.
pub type RpcId = u64;

/// Monotonic per-connection id allocator. The first id handed out is 1.
#[derive(Debug, Default, Clone)]
pub struct RpcIdCounter {
    last: RpcId,
}

impl RpcIdCounter {
    /// Create a counter whose next id is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: 0 }
    }

    /// Allocate the next id.
    pub fn next_id(&mut self) -> RpcId {
        self.last += 1;
        self.last
    }

    /// Last id handed out (0 if none).
    #[must_use]
    pub const fn current(&self) -> RpcId {
        self.last
    }

    /// Start over from 1.
    pub fn reset(&mut self) {
        self.last = 0;
    }
}

/// Outbound request: `{ jsonrpc, method, params, id }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Always [`JSON_RPC_VERSION`].
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    pub params: Value,
    /// Request id.
    pub id: RpcId,
}

impl RpcRequest {
    /// Create a request.
    #[must_use]
    pub fn new(id: RpcId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Keepalive request.
    #[must_use]
    pub fn ping(id: RpcId) -> Self {
        Self::new(id, "ping", json!({}))
    }

    /// Acknowledge receipt of a pushed message. The id is echoed as
    /// received, string or number.
    #[must_use]
    pub fn ack(id: RpcId, mid: impl Into<Value>) -> Self {
        Self::new(id, "ack", json!({ "mid": mid.into() }))
    }

    /// Announce the channels this connection listens on.
    #[must_use]
    pub fn subscribe(id: RpcId, channels: &[String]) -> Self {
        Self::new(id, "subscribe", json!({ "channelList": channels }))
    }

    /// Publish a body to the given channels.
    #[must_use]
    pub fn publish(id: RpcId, channels: &[String], body: &MessageBody, extra: Option<Value>) -> Self {
        let mut params = json!({
            "channelList": channels,
            "body": body,
        });
        if let (Some(extra), Some(map)) = (extra, params.as_object_mut()) {
            map.insert("extra".to_string(), extra);
        }
        Self::new(id, "publish", params)
    }

    /// Start receiving presence changes for a user.
    #[must_use]
    pub fn subscribe_status_change(id: RpcId, user_id: u64) -> Self {
        Self::new(id, "subscribeStatusChange", json!({ "userId": user_id }))
    }

    /// Stop receiving presence changes for a user.
    #[must_use]
    pub fn unsubscribe_status_change(id: RpcId, user_id: u64) -> Self {
        Self::new(id, "unsubscribeStatusChange", json!({ "userId": user_id }))
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }
}

/// Reply to a server request: `{ jsonrpc, result, id }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    /// Always [`JSON_RPC_VERSION`].
    pub jsonrpc: String,
    /// Result payload.
    pub result: Value,
    /// Id of the request being answered, echoed verbatim.
    pub id: Value,
}

impl RpcResult {
    /// Answer a server `ping` request.
    #[must_use]
    pub fn pong(id: Value) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            result: Value::String(PONG.to_string()),
            id,
        }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }
}

/// Any inbound JSON object. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    /// Protocol version, if sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    /// Method name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Parameters (`null` when absent).
    #[serde(default)]
    pub params: Value,
    /// Request or response id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Response error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Classification of an inbound envelope by its `method` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod<'a> {
    /// Pushed message; `params` is a [`crate::PushMessage`].
    Message,
    /// Server keepalive request.
    Ping,
    /// Response to one of our requests.
    Result,
    /// Anything else, including a missing method.
    Other(&'a str),
}

impl RpcEnvelope {
    /// Classify this envelope.
    ///
    /// A bare response (no method but a `result` or `error`) is treated as
    /// [`RpcMethod::Result`].
    #[must_use]
    pub fn method(&self) -> RpcMethod<'_> {
        match self.method.as_deref() {
            Some("message") => RpcMethod::Message,
            Some("ping") => RpcMethod::Ping,
            Some("result") => RpcMethod::Result,
            None if self.result.is_some() || self.error.is_some() => RpcMethod::Result,
            Some(other) => RpcMethod::Other(other),
            None => RpcMethod::Other(""),
        }
    }

    /// The id as an outbound request id, when it is a non-negative integer
    /// (or a string holding one).
    #[must_use]
    pub fn request_id(&self) -> Option<RpcId> {
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_starts_at_one_and_resets() {
        let mut ids = RpcIdCounter::new();
        assert_eq!(ids.current(), 0);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        ids.reset();
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn test_ack_shape() {
        let json = RpcRequest::ack(7, "abc").to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "ack");
        assert_eq!(value["params"]["mid"], "abc");
        assert_eq!(value["id"], 7);

        let json = RpcRequest::ack(8, json!(17)).to_json().unwrap();
        assert!(json.contains(r#""mid":17"#));
    }

    #[test]
    fn test_publish_shape() {
        let body = MessageBody::new("im", "typing", json!({ "chat_id": 42 }));
        let request = RpcRequest::publish(3, &["42".to_string()], &body, None);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["method"], "publish");
        assert_eq!(value["params"]["channelList"], json!(["42"]));
        assert_eq!(value["params"]["body"]["module_id"], "im");
        assert_eq!(value["params"]["body"]["command"], "typing");
        assert!(value["params"].get("extra").is_none());
    }

    #[test]
    fn test_publish_with_extra() {
        let body = MessageBody::new("im", "typing", json!({}));
        let request = RpcRequest::publish(1, &[], &body, Some(json!({ "revision_web": 19 })));
        assert_eq!(request.params["extra"]["revision_web"], 19);
    }

    #[test]
    fn test_pong_echoes_id() {
        let json = RpcResult::pong(json!("x-1")).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["result"], "pong");
        assert_eq!(value["id"], "x-1");
    }

    #[test]
    fn test_envelope_classification() {
        let envelope: RpcEnvelope =
            serde_json::from_value(json!({ "method": "message", "params": {} })).unwrap();
        assert_eq!(envelope.method(), RpcMethod::Message);

        let envelope: RpcEnvelope =
            serde_json::from_value(json!({ "id": 4, "result": { "ok": true } })).unwrap();
        assert_eq!(envelope.method(), RpcMethod::Result);
        assert_eq!(envelope.request_id(), Some(4));

        let envelope: RpcEnvelope =
            serde_json::from_value(json!({ "method": "server.time" })).unwrap();
        assert_eq!(envelope.method(), RpcMethod::Other("server.time"));
        assert_eq!(envelope.params, Value::Null);
    }

    #[test]
    fn test_request_id_from_string() {
        let envelope = RpcEnvelope {
            id: Some(json!("12")),
            ..RpcEnvelope::default()
        };
        assert_eq!(envelope.request_id(), Some(12));

        let envelope = RpcEnvelope {
            id: Some(json!(-1)),
            ..RpcEnvelope::default()
        };
        assert_eq!(envelope.request_id(), None);
    }
}
