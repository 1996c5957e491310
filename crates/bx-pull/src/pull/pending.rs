//! Continuations awaiting RPC responses.

use std::collections::HashMap;

use bx_pull_proto::{RpcEnvelope, RpcId};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::PullError;

/// Reply slot for one outstanding request.
pub type Reply = oneshot::Sender<Result<Value, PullError>>;

/// Outstanding requests by id.
#[derive(Debug, Default)]
pub struct PendingRequests {
    waiters: HashMap<RpcId, Reply>,
}

impl PendingRequests {
    /// Register a continuation for `id`. Waiters whose caller has given
    /// up are dropped first.
    pub fn insert(&mut self, id: RpcId, reply: Reply) {
        self.prune();
        self.waiters.insert(id, reply);
    }

    /// Drop waiters whose receiver is gone, e.g. after a request timeout.
    /// Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let before = self.waiters.len();
        self.waiters.retain(|_, reply| !reply.is_closed());
        let removed = before - self.waiters.len();
        if removed > 0 {
            debug!(removed, "dropped abandoned requests");
        }
        removed
    }

    /// Complete the continuation matching a response. Unknown or missing
    /// ids are ignored; returns whether a waiter was found.
    pub fn resolve(&mut self, response: &RpcEnvelope) -> bool {
        let Some(reply) = response.request_id().and_then(|id| self.waiters.remove(&id)) else {
            debug!(id = ?response.id, "response without a waiter");
            return false;
        };

        let outcome = match (&response.error, &response.result) {
            (Some(error), _) if !error.is_null() => Err(PullError::Rpc(rpc_error_text(error))),
            (_, Some(result)) => Ok(result.clone()),
            _ => Ok(response.params.clone()),
        };
        // the caller may have given up already
        let _ = reply.send(outcome);
        true
    }

    /// Fail every waiter with [`PullError::ConnectionClosed`].
    pub fn fail_all(&mut self) {
        for (_, reply) in self.waiters.drain() {
            let _ = reply.send(Err(PullError::ConnectionClosed));
        }
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Whether nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

fn rpc_error_text(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| error.to_string(), str::to_string)
}
