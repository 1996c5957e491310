//! Pull realtime connection.
//!
//! Owns the WebSocket to the Pull server, including decoding and routing
//! of inbound frames, keepalive supervision, and reconnection with
//! exponential backoff.

mod client;
mod connection;
mod debug;
mod dispatch;
mod events;
mod liveness;
mod pending;
mod presence;
mod publish;
mod reconnect;
mod session;
mod state;

// Re-export public types
pub use client::PullClient;
pub use debug::{truncate_channel, DebugSnapshot, Diagnostics, SnapshotIdentity};
pub use dispatch::{Dispatcher, Effect, Handler};
pub use events::{PullEvent, PushEvent, UserStatus};
pub use liveness::{Liveness, LivenessConfig, LivenessTick};
pub use pending::PendingRequests;
pub use presence::{StatusRegistry, UserStatusSubscription};
pub use publish::{Composer, Publication, NEW_MESSAGE_COMMAND};
pub use reconnect::{ReconnectPlan, ReconnectPolicy, ReconnectReason, ReconnectState};
pub use session::{SessionState, RECENT_CAPACITY};
pub use state::{AtomicConnectionState, ConnectionState};
