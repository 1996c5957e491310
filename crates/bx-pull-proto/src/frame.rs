//! Inbound frame decoding.
//!
//! Every payload goes through the same ordered pipeline:
//!
//! 1. the literal `ping` / `pong` sentinels;
//! 2. a structured JSON decode (an object, or an array of objects);
//! 3. a lossy UTF-8 decode that looks for a JSON object embedded in
//!    surrounding bytes;
//! 4. otherwise the payload is returned as opaque bytes.

use serde_json::Value;

use crate::constants::{PING, PONG};
use crate::envelope::RpcEnvelope;

/// Bare sentinel strings sent outside the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    /// `"ping"`; must be answered with `"pong"`.
    Ping,
    /// `"pong"`.
    Pong,
}

/// Result of decoding one WebSocket payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Keepalive sentinel.
    Sentinel(Sentinel),
    /// A single envelope.
    Rpc(Box<RpcEnvelope>),
    /// Several envelopes delivered in one payload, in order.
    Batch(Vec<RpcEnvelope>),
    /// Undecodable payload.
    Raw(Vec<u8>),
}

impl Frame {
    /// Decode a text payload.
    #[must_use]
    pub fn decode_text(text: &str) -> Self {
        if let Some(sentinel) = sentinel(text) {
            return Self::Sentinel(sentinel);
        }
        if let Some(frame) = structured(text) {
            return frame;
        }
        embedded(text).unwrap_or_else(|| Self::Raw(text.as_bytes().to_vec()))
    }

    /// Decode a binary payload.
    #[must_use]
    pub fn decode_binary(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => match Self::decode_text(text) {
                Self::Raw(_) => Self::Raw(bytes.to_vec()),
                frame => frame,
            },
            Err(_) => {
                let text = String::from_utf8_lossy(bytes);
                embedded(&text).unwrap_or_else(|| Self::Raw(bytes.to_vec()))
            }
        }
    }
}

fn sentinel(text: &str) -> Option<Sentinel> {
    match text.trim() {
        PING => Some(Sentinel::Ping),
        PONG => Some(Sentinel::Pong),
        _ => None,
    }
}

fn structured(text: &str) -> Option<Frame> {
    match serde_json::from_str::<Value>(text).ok()? {
        object @ Value::Object(_) => serde_json::from_value(object)
            .ok()
            .map(|envelope| Frame::Rpc(Box::new(envelope))),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(_) => serde_json::from_value::<RpcEnvelope>(item).ok(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Frame::Batch),
        _ => None,
    }
}

fn embedded(text: &str) -> Option<Frame> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match structured(&text[start..=end])? {
        frame @ Frame::Rpc(_) => Some(frame),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RpcMethod;
    use test_case::test_case;

    #[test_case("ping", Sentinel::Ping ; "ping")]
    #[test_case("pong", Sentinel::Pong ; "pong")]
    #[test_case("ping\n", Sentinel::Ping ; "trailing newline")]
    fn test_sentinels(text: &str, expected: Sentinel) {
        assert_eq!(Frame::decode_text(text), Frame::Sentinel(expected));
    }

    #[test]
    fn test_object_decodes_to_rpc() {
        let frame = Frame::decode_text(r#"{"jsonrpc":"2.0","method":"message","params":{}}"#);
        match frame {
            Frame::Rpc(envelope) => assert_eq!(envelope.method(), RpcMethod::Message),
            other => panic!("expected Rpc, got {other:?}"),
        }
    }

    #[test]
    fn test_array_decodes_to_batch() {
        let frame = Frame::decode_text(r#"[{"method":"ping","id":1},{"method":"message"}]"#);
        match frame {
            Frame::Batch(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].method(), RpcMethod::Ping);
                assert_eq!(items[1].method(), RpcMethod::Message);
            }
            other => panic!("expected Batch, got {other:?}"),
        }
    }

    #[test]
    fn test_embedded_json_is_extracted() {
        let frame = Frame::decode_text("#!NGINXNMS!#{\"method\":\"message\",\"params\":{}}#!NGINXNME!#");
        assert!(matches!(frame, Frame::Rpc(_)));
    }

    #[test]
    fn test_binary_with_embedded_json() {
        let mut bytes = vec![0xff, 0x00, 0x12];
        bytes.extend_from_slice(br#"{"method":"message","params":{"mid":"1"}}"#);
        bytes.push(0xfe);
        match Frame::decode_binary(&bytes) {
            Frame::Rpc(envelope) => assert_eq!(envelope.params["mid"], "1"),
            other => panic!("expected Rpc, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_ping() {
        assert_eq!(Frame::decode_binary(b"ping"), Frame::Sentinel(Sentinel::Ping));
    }

    #[test]
    fn test_opaque_payloads_stay_raw() {
        assert_eq!(Frame::decode_binary(&[0x08, 0x96, 0x01]), Frame::Raw(vec![0x08, 0x96, 0x01]));
        assert_eq!(Frame::decode_text("hello"), Frame::Raw(b"hello".to_vec()));
        assert_eq!(Frame::decode_text("42"), Frame::Raw(b"42".to_vec()));
        assert_eq!(Frame::decode_text("} {"), Frame::Raw(b"} {".to_vec()));
    }

    #[test]
    fn test_array_with_scalars_is_raw() {
        assert!(matches!(Frame::decode_text("[1,2]"), Frame::Raw(_)));
    }
}
