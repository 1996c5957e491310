//! # bx-pull-proto
//!
//! Protocol definitions for the Bitrix24 Pull realtime channel.
//!
//! This crate performs no I/O. It describes the JSON-RPC style envelope,
//! the `ping`/`pong` sentinels, close codes, and the ordered decode
//! pipeline that turns a raw WebSocket payload into a [`Frame`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod body;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod frame;

pub use body::{MessageBody, PushMessage};
pub use constants::{
    CloseCode, PullStatus, SenderType, JSON_RPC_VERSION, MOBILE_REVISION, PING, PONG, REVISION,
};
pub use envelope::{RpcEnvelope, RpcId, RpcIdCounter, RpcMethod, RpcRequest, RpcResult};
pub use error::ProtoError;
pub use frame::{Frame, Sentinel};
