//! Inbound frame routing.
//!
//! The [`Dispatcher`] turns decoded frames into [`Effect`]s. It never
//! touches the socket: the connection loop applies the effects in order,
//! so dispatch stays synchronous and testable without a server.
//!
//! Pushed messages are routed through a table keyed by module and
//! optionally command. A command-specific entry wins over a module-wide
//! one; anything unmatched goes to the fallback handler.

use std::collections::HashMap;

use bx_pull_proto::{
    Frame, ProtoError, PullStatus, PushMessage, RpcEnvelope, RpcIdCounter, RpcMethod, RpcRequest,
    RpcResult, Sentinel, PONG,
};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use super::events::{PullEvent, PushEvent, UserStatus};
use super::reconnect::ReconnectReason;
use super::session::SessionState;
use super::state::ConnectionState;

/// Something the connection loop must do in response to a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Write a text frame.
    Send(String),
    /// Deliver an event to the application.
    Emit(PullEvent),
    /// Bind to a new channel id.
    AdoptChannel(String),
    /// Resolve the configuration again.
    ReloadConfig,
    /// Close the socket and reconnect.
    Reconnect(ReconnectReason),
    /// Record a new protocol revision.
    SetRevision(u32),
    /// Mirror a server-reported status.
    MirrorStatus(ConnectionState),
    /// Notify presence watchers.
    UserStatus(UserStatus),
    /// Complete an outstanding request.
    Resolve(Box<RpcEnvelope>),
}

/// Handler for one route. Receives the decoded message and appends
/// side effects; the normalized event and the ack are added afterwards.
pub type Handler = fn(&PushMessage, &mut Vec<Effect>);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Route {
    module: String,
    command: Option<String>,
}

/// Routes decoded frames to handlers.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    routes: HashMap<Route, Handler>,
    fallback: Handler,
    session: SessionState,
}

impl Dispatcher {
    /// Create a dispatcher with the built-in routes. `chat_module` is the
    /// module id of the chat application.
    #[must_use]
    pub fn new(chat_module: &str) -> Self {
        let mut dispatcher = Self {
            routes: HashMap::new(),
            fallback: on_generic,
            session: SessionState::new(),
        };
        dispatcher.register("pull", Some("channel_replaced"), on_channel_replaced);
        dispatcher.register("pull", Some("config_expired"), on_config_expired);
        dispatcher.register("pull", Some("revision_changed"), on_revision_changed);
        dispatcher.register("pull", Some("connection_status"), on_connection_status);
        dispatcher.register("pull", Some("server_restarted"), on_server_restarted);
        dispatcher.register("online", Some("userStatusChange"), on_user_status_change);
        dispatcher.register("online", None, on_online);
        dispatcher.register("im", None, on_im);
        dispatcher.register(chat_module, None, on_chat);
        dispatcher
    }

    /// Route `module` (and `command`, if given) to `handler`, replacing
    /// any previous entry. Module ids match case-insensitively.
    pub fn register(&mut self, module: &str, command: Option<&str>, handler: Handler) {
        self.routes.insert(
            Route {
                module: module.to_lowercase(),
                command: command.map(str::to_string),
            },
            handler,
        );
    }

    /// Session bookkeeping.
    #[must_use]
    pub const fn session(&self) -> &SessionState {
        &self.session
    }

    /// Handle one decoded frame. Outbound ids are drawn from `ids`.
    ///
    /// Any [`Effect::Reconnect`] is placed last so acks go out on the
    /// socket being replaced.
    pub fn handle(&mut self, frame: Frame, ids: &mut RpcIdCounter) -> Vec<Effect> {
        let mut effects = Vec::new();
        match frame {
            Frame::Sentinel(Sentinel::Ping) => effects.push(Effect::Send(PONG.to_string())),
            Frame::Sentinel(Sentinel::Pong) => trace!("pong received"),
            Frame::Rpc(envelope) => self.handle_envelope(*envelope, ids, &mut effects),
            Frame::Batch(envelopes) => {
                for envelope in envelopes {
                    self.handle_envelope(envelope, ids, &mut effects);
                }
            }
            Frame::Raw(bytes) => debug!(len = bytes.len(), "discarding opaque frame"),
        }
        effects.sort_by_key(|effect| matches!(effect, Effect::Reconnect(_)));
        effects
    }

    fn handle_envelope(&mut self, envelope: RpcEnvelope, ids: &mut RpcIdCounter, effects: &mut Vec<Effect>) {
        match envelope.method() {
            RpcMethod::Message => match PushMessage::from_params(envelope.params) {
                Ok(message) => self.handle_message(&message, ids, effects),
                Err(e) => warn!(error = %e, "discarding malformed message"),
            },
            RpcMethod::Ping => {
                let id = envelope.id.unwrap_or(Value::Null);
                push_send(effects, RpcResult::pong(id).to_json());
            }
            RpcMethod::Result => effects.push(Effect::Resolve(Box::new(envelope))),
            RpcMethod::Other(method) => {
                let method = method.to_string();
                debug!(method = %method, "forwarding rpc");
                effects.push(Effect::Emit(PullEvent::Rpc {
                    method,
                    params: envelope.params,
                }));
            }
        }
    }

    fn handle_message(&mut self, message: &PushMessage, ids: &mut RpcIdCounter, effects: &mut Vec<Effect>) {
        if let Some(mid) = message.mid.as_deref() {
            if !self.session.observe(mid) {
                debug!(mid = %mid, "duplicate message suppressed");
                return;
            }
        }

        let module = message.body.module();
        let command = message.body.command.as_str();
        let handler = self
            .routes
            .get(&Route {
                module: module.clone(),
                command: Some(command.to_string()),
            })
            .or_else(|| self.routes.get(&Route { module, command: None }))
            .copied()
            .unwrap_or(self.fallback);
        handler(message, effects);

        effects.push(Effect::Emit(PullEvent::Message(PushEvent::from(message))));

        if let Some(mid) = message.ack_mid() {
            push_send(effects, RpcRequest::ack(ids.next_id(), mid).to_json());
        }
    }
}

fn push_send(effects: &mut Vec<Effect>, encoded: Result<String, ProtoError>) {
    match encoded {
        Ok(json) => effects.push(Effect::Send(json)),
        Err(e) => warn!(error = %e, "failed to encode reply"),
    }
}

fn debug_event(effects: &mut Vec<Effect>, text: String) {
    effects.push(Effect::Emit(PullEvent::Debug(text)));
}

fn on_channel_replaced(message: &PushMessage, effects: &mut Vec<Effect>) {
    let params = message.params();
    let channel = params
        .get("channel_id")
        .or_else(|| params.get("channel").and_then(|c| c.get("id")))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty());

    match channel {
        Some(id) => {
            info!("server replaced the channel");
            effects.push(Effect::AdoptChannel(id.to_string()));
            effects.push(Effect::Reconnect(ReconnectReason::ChannelReplaced));
        }
        None => warn!("channel_replaced without a channel id"),
    }
}

fn on_config_expired(_message: &PushMessage, effects: &mut Vec<Effect>) {
    info!("server expired the pull config");
    effects.push(Effect::ReloadConfig);
    effects.push(Effect::Reconnect(ReconnectReason::ConfigExpired));
}

fn on_revision_changed(message: &PushMessage, effects: &mut Vec<Effect>) {
    let revision = message
        .params()
        .get("revision")
        .and_then(|r| r.as_u64().or_else(|| r.as_str().and_then(|s| s.parse().ok())))
        .and_then(|r| u32::try_from(r).ok());

    if let Some(revision) = revision {
        effects.push(Effect::SetRevision(revision));
        debug_event(effects, format!("Protocol revision changed to {revision}"));
    } else {
        warn!("revision_changed without a revision");
    }
}

fn on_connection_status(message: &PushMessage, effects: &mut Vec<Effect>) {
    let params = message.params();
    let status = params.get("status").and_then(Value::as_str).and_then(PullStatus::parse);
    match status {
        Some(status) => effects.push(Effect::MirrorStatus(status.into())),
        None => warn!(params = %params, "connection_status with unknown status"),
    }
}

fn on_server_restarted(_message: &PushMessage, effects: &mut Vec<Effect>) {
    info!("server restarting");
    effects.push(Effect::Reconnect(ReconnectReason::ServerRestarted));
}

fn on_user_status_change(message: &PushMessage, effects: &mut Vec<Effect>) {
    let params = message.params();
    let user_id = params
        .get("user_id")
        .or_else(|| params.get("userId"))
        .and_then(|id| id.as_u64().or_else(|| id.as_str().and_then(|s| s.parse().ok())));
    let online = params
        .get("online")
        .and_then(Value::as_bool)
        .or_else(|| params.get("status").and_then(Value::as_str).map(|s| s == "online"));

    match (user_id, online) {
        (Some(user_id), Some(online)) => effects.push(Effect::UserStatus(UserStatus { user_id, online })),
        _ => warn!(params = %params, "userStatusChange without user or status"),
    }
}

fn on_online(message: &PushMessage, _effects: &mut Vec<Effect>) {
    debug!(command = %message.body.command, "presence event");
}

fn on_im(message: &PushMessage, _effects: &mut Vec<Effect>) {
    debug!(command = %message.body.command, "im event");
}

fn on_chat(message: &PushMessage, _effects: &mut Vec<Effect>) {
    debug!(command = %message.body.command, "chat event");
}

fn on_generic(message: &PushMessage, _effects: &mut Vec<Effect>) {
    debug!(event = %message.body.event_type(), "unrouted event");
}
