//! Connection manager.
//!
//! One [`ConnectionManager`] task owns the socket, the reconnect counter,
//! session state and the pending-response table. The public handle talks
//! to it only through [`Command`]s and reads what it publishes in
//! [`Shared`]; events flow back on a single channel.
//!
//! ```text
//!   Offline --connect--> Connecting --open--> Online
//!      ^                                        |
//!      +------------ close / error -------------+
//!      |
//!      +-- timer (running) --> Connecting
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bx_pull_proto::{CloseCode, Frame, ProtoError, RpcIdCounter, RpcRequest};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, COOKIE, USER_AGENT};
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{AuthMaterial, AuthProvider};
use crate::config::{ConfigResolver, CredentialBundle, ResolvedConfig};
use crate::error::PullError;
use crate::settings::ClientSettings;

use super::debug::{truncate_channel, Diagnostics};
use super::dispatch::{Dispatcher, Effect};
use super::events::PullEvent;
use super::liveness::{Liveness, LivenessTick};
use super::pending::{PendingRequests, Reply};
use super::presence::StatusRegistry;
use super::publish::Publication;
use super::reconnect::{ReconnectPlan, ReconnectReason, ReconnectState};
use super::state::{AtomicConnectionState, ConnectionState};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<Socket, Message>;

const USER_ID_HEADER: &str = "x-bitrix-user-id";

/// Requests from the handle to the connection task.
#[derive(Debug)]
pub(crate) enum Command {
    Publish {
        publication: Publication,
        reply: oneshot::Sender<bool>,
    },
    Request {
        method: String,
        params: Value,
        reply: Reply,
    },
    SubscribeStatus(u64),
    UnsubscribeStatus(u64),
    Disconnect {
        code: CloseCode,
        reason: String,
    },
    Connect,
    Stop,
}

/// Link to a running connection task.
#[derive(Debug)]
pub(crate) struct WorkerLink {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) running: Arc<AtomicBool>,
}

/// State and counters published by one run of the connection task.
///
/// Every [`start`](super::PullClient::start) installs a fresh run, so a
/// task that is still winding down only ever writes to its own.
#[derive(Debug, Default)]
pub(crate) struct RunState {
    pub(crate) state: AtomicConnectionState,
    pub(crate) diagnostics: Diagnostics,
}

/// State shared between the handle and the connection task.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) statuses: StatusRegistry,
    run: Mutex<Arc<RunState>>,
    link: Mutex<Option<WorkerLink>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            statuses: StatusRegistry::default(),
            run: Mutex::new(Arc::default()),
            link: Mutex::new(None),
        }
    }

    /// The most recent run.
    pub(crate) fn run(&self) -> Arc<RunState> {
        Arc::clone(&self.run.lock())
    }

    /// Replace the current run with a fresh one and return it.
    pub(crate) fn begin_run(&self) -> Arc<RunState> {
        let run = Arc::new(RunState::default());
        *self.run.lock() = Arc::clone(&run);
        run
    }

    /// Install `link`, returning the previous one.
    pub(crate) fn attach(&self, link: WorkerLink) -> Option<WorkerLink> {
        self.link.lock().replace(link)
    }

    pub(crate) fn detach(&self) -> Option<WorkerLink> {
        self.link.lock().take()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| link.running.load(Ordering::SeqCst))
    }

    /// Queue a command for the running task. Returns `false` if none runs.
    pub(crate) fn command(&self, command: Command) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| link.commands.send(command).is_ok())
    }
}

enum Next {
    Connect,
    Retry(Duration),
    Idle,
    Exit,
}

/// Why a live socket ended.
enum Outcome {
    Stopped,
    Manual,
    Forced(ReconnectReason),
    Remote(Option<u16>),
    Error(String),
}

/// Owner of the socket and everything that must stay consistent with it.
pub(crate) struct ConnectionManager {
    settings: ClientSettings,
    bundle: CredentialBundle,
    resolver: ConfigResolver,
    resolved: ResolvedConfig,
    auth: Arc<AuthProvider>,
    shared: Arc<Shared>,
    run_state: Arc<RunState>,
    running: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<PullEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    dispatcher: Dispatcher,
    reconnect: ReconnectState,
    ids: RpcIdCounter,
    pending: PendingRequests,
    manual: bool,
}

impl ConnectionManager {
    pub(crate) fn new(
        settings: ClientSettings,
        bundle: CredentialBundle,
        auth: Arc<AuthProvider>,
        shared: Arc<Shared>,
        run_state: Arc<RunState>,
        running: Arc<AtomicBool>,
        events: mpsc::UnboundedSender<PullEvent>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let resolver = ConfigResolver::from_settings(&settings);
        let resolved = resolver.resolve(&bundle);
        let dispatcher = Dispatcher::new(&settings.chat_module);

        let manager = Self {
            settings,
            bundle,
            resolver,
            resolved,
            auth,
            shared,
            run_state,
            running,
            events,
            commands,
            dispatcher,
            reconnect: ReconnectState::default(),
            ids: RpcIdCounter::new(),
            pending: PendingRequests::default(),
            manual: false,
        };
        manager.publish_config();
        manager
    }

    /// Drive the connection until stopped.
    pub(crate) async fn run(mut self) {
        let mut next = Next::Connect;
        loop {
            if !self.is_running() {
                break;
            }
            next = match next {
                Next::Connect => self.connect_and_serve().await,
                Next::Retry(delay) => self.wait(Some(delay)).await,
                Next::Idle => self.wait(None).await,
                Next::Exit => break,
            };
        }
        self.shutdown();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn emit(&self, event: PullEvent) {
        // the application may have dropped its receiver
        let _ = self.events.send(event);
    }

    fn emit_status(&self, connected: bool, message: impl Into<String>) {
        self.emit(PullEvent::Status {
            connected,
            message: message.into(),
        });
    }

    fn publish_config(&self) {
        let diagnostics = &self.run_state.diagnostics;
        diagnostics.set_config_timestamp(self.resolved.resolved_at);
        diagnostics.set_revision(self.resolved.config.api.revision_web);
        diagnostics.set_channel(self.channel_id());

        if self.resolved.synthesized_channel {
            self.emit(PullEvent::Debug("Using a synthesized channel".to_string()));
        }
    }

    fn channel_id(&self) -> Option<&str> {
        self.resolved
            .config
            .channels
            .primary()
            .map(|channel| channel.id.as_str())
    }

    fn reload_config(&mut self) {
        self.resolved = self.resolver.resolve(&self.bundle);
        info!(source = ?self.resolved.source, "pull config reloaded");
        self.publish_config();
    }

    fn reject(command: Command) {
        match command {
            Command::Publish { reply, .. } => {
                let _ = reply.send(false);
            }
            Command::Request { reply, .. } => {
                let _ = reply.send(Err(PullError::NotConnected));
            }
            // resubscribed from the registry on the next open
            Command::SubscribeStatus(_) | Command::UnsubscribeStatus(_) => {}
            Command::Disconnect { .. } | Command::Connect | Command::Stop => {}
        }
    }

    /// Wait out a reconnect delay, or indefinitely when `delay` is `None`.
    async fn wait(&mut self, delay: Option<Duration>) -> Next {
        let timer = async move {
            match delay {
                Some(delay) => sleep(delay).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timer);

        loop {
            tokio::select! {
                () = &mut timer => {
                    return if self.is_running() { Next::Connect } else { Next::Exit };
                }
                command = self.commands.recv() => match command {
                    None | Some(Command::Stop) => return Next::Exit,
                    Some(Command::Connect) => {
                        info!("connect requested");
                        self.manual = false;
                        self.reconnect.reset();
                        self.run_state.diagnostics.set_reconnect_attempts(0);
                        return Next::Connect;
                    }
                    Some(Command::Disconnect { .. }) => {
                        self.manual = true;
                        return Next::Idle;
                    }
                    Some(other) => Self::reject(other),
                },
            }
        }
    }

    /// Run `fut` while still answering commands. `Err` carries where to
    /// go instead when the caller gave up.
    async fn interruptible<F: Future>(&mut self, fut: F) -> Result<F::Output, Next> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Ok(output),
                command = self.commands.recv() => match command {
                    None | Some(Command::Stop) => return Err(Next::Exit),
                    Some(Command::Disconnect { .. }) => {
                        self.manual = true;
                        return Err(Next::Idle);
                    }
                    Some(Command::Connect) => {}
                    Some(other) => Self::reject(other),
                },
            }
        }
    }

    async fn connect_and_serve(&mut self) -> Next {
        self.run_state.state.store(ConnectionState::Connecting);
        self.emit_status(false, "Connecting...");

        let auth = Arc::clone(&self.auth);
        let material = match self.interruptible(auth.resolve()).await {
            Ok(material) => material,
            Err(next) => return self.abandon_connect(next),
        };
        self.run_state.diagnostics.set_auth(Some(&material));

        let request = match self.build_request(&material) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "cannot build connection request");
                return self.on_failure(e);
            }
        };

        info!(
            user_id = self.bundle.user_id,
            mode = %material.mode(),
            "connecting to pull server"
        );
        let connected = match self.interruptible(tokio_tungstenite::connect_async(request)).await {
            Ok(connected) => connected,
            Err(next) => return self.abandon_connect(next),
        };

        match connected {
            Ok((socket, _response)) => {
                let outcome = self.serve(socket).await;
                self.after_close(outcome)
            }
            Err(WsError::Http(response)) => self.on_failure(handshake_rejected(response.status())),
            Err(e) => self.on_failure(PullError::WebSocket(e.to_string())),
        }
    }

    fn abandon_connect(&self, next: Next) -> Next {
        self.run_state.state.store(ConnectionState::Offline);
        self.emit_status(false, "Disconnected");
        next
    }

    fn build_request(&self, material: &AuthMaterial) -> Result<Request, PullError> {
        let server = &self.resolved.config.server;
        let base = server
            .websocket_url()
            .ok_or_else(|| PullError::Config("no websocket endpoint".to_string()))?;
        let mut url = Url::parse(base)
            .map_err(|e| PullError::Config(format!("invalid websocket url '{base}': {e}")))?;

        let user_id = self.bundle.user_id.to_string();
        let hostname = server.hostname.as_deref().unwrap_or(&self.settings.hostname);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("CHANNEL_ID", self.channel_id().unwrap_or_default())
                .append_pair("user_id", &user_id)
                .append_pair("site_id", &self.settings.site_id)
                .append_pair("hostname", hostname)
                .append_pair("binaryMode", "true");
            for (name, value) in material.query_pairs() {
                query.append_pair(name, &value);
            }
            query.append_pair("timestamp", &Utc::now().timestamp_millis().to_string());
        }

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| PullError::WebSocket(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(USER_AGENT, header_value(&self.settings.user_agent)?);
        headers.insert(HeaderName::from_static(USER_ID_HEADER), header_value(&user_id)?);
        if let Some(cookies) = material.cookie_header() {
            headers.insert(COOKIE, header_value(cookies)?);
        }
        if let Some(token) = material.token() {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
        }
        Ok(request)
    }

    async fn serve(&mut self, socket: Socket) -> Outcome {
        let (mut write, mut read) = socket.split();

        self.run_state.state.store(ConnectionState::Online);
        self.run_state.diagnostics.set_connected(true);
        self.run_state.diagnostics.set_reconnect_attempts(0);
        self.reconnect.reset();
        self.ids.reset();

        let channel = self.channel_id().map(truncate_channel).unwrap_or_default();
        info!(channel = %channel, "pull connection online");
        self.emit_status(true, "Connected to Bitrix");
        self.emit(PullEvent::Debug(format!("Connected with channel ID: {channel}")));

        let subscribe = RpcRequest::subscribe(self.ids.next_id(), &self.resolved.config.channels.ids()).to_json();
        if let Err(e) = self.send_frame(&mut write, subscribe).await {
            return Outcome::Error(e.to_string());
        }
        for user_id in self.shared.statuses.users() {
            let frame = RpcRequest::subscribe_status_change(self.ids.next_id(), user_id).to_json();
            if let Err(e) = self.send_frame(&mut write, frame).await {
                return Outcome::Error(e.to_string());
            }
        }

        let mut liveness = Liveness::start(&self.settings.liveness);

        loop {
            tokio::select! {
                inbound = read.next() => {
                    let message = match inbound {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Outcome::Error(e.to_string()),
                        None => return Outcome::Error("connection reset".to_string()),
                    };
                    let frame = match message {
                        Message::Text(text) => {
                            liveness.observe_inbound();
                            self.run_state.diagnostics.record_received(text.len());
                            Frame::decode_text(text.as_str())
                        }
                        Message::Binary(bytes) => {
                            liveness.observe_inbound();
                            self.run_state.diagnostics.record_received(bytes.len());
                            Frame::decode_binary(&bytes)
                        }
                        Message::Ping(_) | Message::Pong(_) => {
                            liveness.observe_inbound();
                            continue;
                        }
                        Message::Close(frame) => {
                            return Outcome::Remote(frame.map(|f| u16::from(f.code)));
                        }
                        Message::Frame(_) => continue,
                    };

                    let effects = self.dispatcher.handle(frame, &mut self.ids);
                    if let Some(outcome) = self.apply(effects, &mut write).await {
                        return outcome;
                    }
                }
                tick = liveness.tick() => match tick {
                    LivenessTick::Keepalive => {
                        let ping = RpcRequest::ping(self.ids.next_id()).to_json();
                        if let Err(e) = self.send_frame(&mut write, ping).await {
                            return Outcome::Error(e.to_string());
                        }
                    }
                    LivenessTick::Stuck => {
                        warn!(wait = ?self.settings.liveness.ping_wait, "no traffic from pull server, connection stuck");
                        self.emit(PullEvent::Debug("Connection stuck, reconnecting".to_string()));
                        close(&mut write, CloseCode::Stuck, "stuck").await;
                        return Outcome::Forced(ReconnectReason::Stuck);
                    }
                },
                command = self.commands.recv() => {
                    if let Some(outcome) = self.handle_command(command, &mut write).await {
                        return outcome;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Option<Command>, write: &mut WsSink) -> Option<Outcome> {
        let result = match command {
            None | Some(Command::Stop) => {
                close(write, CloseCode::Manual, "client stopped").await;
                return Some(Outcome::Stopped);
            }
            Some(Command::Disconnect { code, reason }) => {
                info!(code = u16::from(code), reason = %reason, "manual disconnect");
                self.manual = true;
                close(write, code, &reason).await;
                return Some(Outcome::Manual);
            }
            Some(Command::Connect) => Ok(()),
            Some(Command::Publish { publication, reply }) => {
                let frame = RpcRequest::publish(
                    self.ids.next_id(),
                    &publication.channels,
                    &publication.body,
                    publication.extra,
                )
                .to_json();
                let result = self.send_frame(write, frame).await;
                let _ = reply.send(matches!(result, Ok(true)));
                if result.is_ok() {
                    debug!(channels = ?publication.channels, "published");
                }
                result.map(drop)
            }
            Some(Command::Request { method, params, reply }) => {
                let id = self.ids.next_id();
                match RpcRequest::new(id, method, params).to_json() {
                    Ok(json) => {
                        self.pending.insert(id, reply);
                        self.write_text(write, json).await
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                        Ok(())
                    }
                }
            }
            Some(Command::SubscribeStatus(user_id)) => {
                let frame = RpcRequest::subscribe_status_change(self.ids.next_id(), user_id).to_json();
                self.send_frame(write, frame).await.map(drop)
            }
            Some(Command::UnsubscribeStatus(user_id)) => {
                let frame = RpcRequest::unsubscribe_status_change(self.ids.next_id(), user_id).to_json();
                self.send_frame(write, frame).await.map(drop)
            }
        };
        result.err().map(|e| Outcome::Error(e.to_string()))
    }

    async fn apply(&mut self, effects: Vec<Effect>, write: &mut WsSink) -> Option<Outcome> {
        for effect in effects {
            match effect {
                Effect::Send(text) => {
                    if let Err(e) = self.write_text(write, text).await {
                        return Some(Outcome::Error(e.to_string()));
                    }
                }
                Effect::Emit(event) => self.emit(event),
                Effect::AdoptChannel(id) => {
                    self.resolved
                        .config
                        .channels
                        .replace_primary(&id, Utc::now().timestamp());
                    self.run_state.diagnostics.set_channel(Some(&id));
                    self.emit(PullEvent::Debug(format!(
                        "Channel replaced, new channel ID: {}",
                        truncate_channel(&id)
                    )));
                }
                Effect::ReloadConfig => self.reload_config(),
                Effect::SetRevision(revision) => {
                    info!(revision, "protocol revision changed");
                    self.run_state.diagnostics.set_revision(revision);
                }
                Effect::MirrorStatus(state) => {
                    self.run_state.state.store(state);
                    self.emit_status(
                        state == ConnectionState::Online,
                        format!("Server reported status: {state}"),
                    );
                }
                Effect::UserStatus(status) => {
                    let delivered = self.shared.statuses.notify(status);
                    debug!(user_id = status.user_id, online = status.online, delivered, "user status changed");
                }
                Effect::Resolve(response) => {
                    self.pending.resolve(&response);
                }
                Effect::Reconnect(reason) => {
                    info!(reason = %reason, "server requested reconnect");
                    close(write, reason.close_code(), &reason.to_string()).await;
                    return Some(Outcome::Forced(reason));
                }
            }
        }
        None
    }

    /// Write an encoded frame. `Ok(false)` if encoding failed.
    async fn send_frame(&mut self, write: &mut WsSink, frame: Result<String, ProtoError>) -> Result<bool, WsError> {
        match frame {
            Ok(json) => self.write_text(write, json).await.map(|()| true),
            Err(e) => {
                warn!(error = %e, "failed to encode outbound frame");
                Ok(false)
            }
        }
    }

    async fn write_text(&mut self, write: &mut WsSink, text: String) -> Result<(), WsError> {
        let len = text.len();
        write.send(Message::Text(text.into())).await?;
        self.run_state.diagnostics.record_sent(len);
        self.run_state.diagnostics.set_rpc_id(self.ids.current());
        Ok(())
    }

    fn after_close(&mut self, outcome: Outcome) -> Next {
        self.run_state.state.store(ConnectionState::Offline);
        self.run_state.diagnostics.set_connected(false);
        self.pending.fail_all();

        match outcome {
            Outcome::Stopped => {
                self.emit_status(false, "Disconnected");
                Next::Exit
            }
            Outcome::Manual => {
                self.emit_status(false, "Disconnected");
                Next::Idle
            }
            Outcome::Forced(reason) => {
                self.emit_status(false, format!("Disconnected: {reason}"));
                self.schedule(reason)
            }
            Outcome::Remote(code) => {
                let code = code.map(CloseCode::from);
                info!(code = ?code, "pull server closed the connection");
                self.emit_status(false, "Connection closed");
                if self.manual || code.is_some_and(|code| !code.reconnects()) {
                    Next::Idle
                } else {
                    self.schedule(ReconnectReason::Transient)
                }
            }
            Outcome::Error(text) => self.on_failure(PullError::WebSocket(text)),
        }
    }

    fn on_failure(&mut self, error: PullError) -> Next {
        self.run_state.state.store(ConnectionState::Offline);
        let text = error.to_string();
        warn!(error = %text, "pull connection failed");
        self.emit_status(false, format!("Connection error: {text}"));

        if error.is_auth_failure() {
            self.auth.invalidate();
            self.run_state.diagnostics.set_auth(None);
            self.emit(PullEvent::AuthenticationFailed { reason: text });
            self.emit(PullEvent::Debug(
                "Authentication failed. Please re-authenticate.".to_string(),
            ));
            return Next::Idle;
        }
        self.schedule(ReconnectReason::Transient)
    }

    fn schedule(&mut self, reason: ReconnectReason) -> Next {
        if !self.is_running() || self.manual {
            return Next::Idle;
        }
        match self.reconnect.plan(&self.settings.reconnect, reason) {
            ReconnectPlan::Retry { attempt, delay } => {
                info!(attempt, delay = ?delay, reason = %reason, "reconnect scheduled");
                self.run_state.diagnostics.set_reconnect_attempts(attempt);
                self.emit(PullEvent::Reconnecting { attempt, delay });
                Next::Retry(delay)
            }
            ReconnectPlan::Exhausted { attempts } => {
                warn!(attempts, "giving up on reconnecting");
                self.emit(PullEvent::ReconnectExhausted { attempts });
                self.emit(PullEvent::Debug("Max reconnection attempts reached".to_string()));
                Next::Idle
            }
        }
    }

    fn shutdown(&mut self) {
        self.run_state.state.store(ConnectionState::Offline);
        self.run_state.diagnostics.set_connected(false);
        self.pending.fail_all();
        debug!("connection task finished");
    }
}

/// Classify a refused handshake. Only 401 and 403 mean the credentials
/// were rejected.
fn handshake_rejected(status: StatusCode) -> PullError {
    let text = format!("HTTP error: {status}");
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        PullError::Auth(text)
    } else {
        PullError::WebSocket(text)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, PullError> {
    HeaderValue::from_str(value).map_err(|e| PullError::Config(format!("invalid header value: {e}")))
}

async fn close(write: &mut WsSink, code: CloseCode, reason: &str) {
    let frame = CloseFrame {
        code: WsCloseCode::from(u16::from(code)),
        reason: reason.to_string().into(),
    };
    if let Err(e) = write.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "close frame not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMode;
    use std::collections::BTreeMap;
    use test_case::test_case;

    fn manager(settings: ClientSettings, bundle: CredentialBundle) -> (ConnectionManager, mpsc::UnboundedReceiver<PullEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (_commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new());
        let run_state = shared.begin_run();
        let manager = ConnectionManager::new(
            settings,
            bundle,
            Arc::new(AuthProvider::new(AuthMode::Cookie, BTreeMap::new())),
            shared,
            run_state,
            Arc::new(AtomicBool::new(true)),
            events_tx,
            commands_rx,
        );
        (manager, events_rx)
    }

    #[test]
    fn test_request_carries_query_and_headers() {
        let bundle = CredentialBundle::new(7).with_cookie("PHPSESSID", "abc");
        let (manager, _events) = manager(ClientSettings::default(), bundle);
        let material = AuthMaterial::Cookie {
            header: Some("PHPSESSID=abc".to_string()),
        };

        let request = manager.build_request(&material).unwrap();
        let url = Url::parse(&request.uri().to_string()).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("ugautodetal.ru"));

        let query: BTreeMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["user_id"], "7");
        assert_eq!(query["site_id"], "ap");
        assert_eq!(query["hostname"], "www.ugavtopart.ru");
        assert_eq!(query["binaryMode"], "true");
        assert_eq!(query["cookies"], "PHPSESSID=abc");
        assert!(query["CHANNEL_ID"].contains(':'));
        assert!(query.contains_key("timestamp"));
        assert!(!query.contains_key("api_token"));

        let headers = request.headers();
        assert_eq!(headers["x-bitrix-user-id"], "7");
        assert_eq!(headers["cookie"], "PHPSESSID=abc");
        assert_eq!(headers["user-agent"], "Rust-Bitrix-Pull-Client/0.1");
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn test_token_request_uses_bearer() {
        let (manager, _events) = manager(ClientSettings::default(), CredentialBundle::new(7));
        let material = AuthMaterial::Token {
            token: "secret".to_string(),
            cookie_header: None,
        };

        let request = manager.build_request(&material).unwrap();
        assert_eq!(request.headers()["authorization"], "Bearer secret");
        assert!(request.headers().get("cookie").is_none());
        assert!(request.uri().to_string().contains("api_token=secret"));
    }

    #[test]
    fn test_synthesized_channel_reported() {
        let (_manager, mut events) = manager(ClientSettings::default(), CredentialBundle::new(7));
        assert!(matches!(events.try_recv(), Ok(PullEvent::Debug(text)) if text.contains("synthesized")));
    }

    #[test]
    fn test_auth_failure_goes_idle() {
        let (mut manager, mut events) = manager(ClientSettings::default(), CredentialBundle::new(7));
        while events.try_recv().is_ok() {}

        let next = manager.on_failure(handshake_rejected(StatusCode::UNAUTHORIZED));
        assert!(matches!(next, Next::Idle));
        assert_eq!(manager.reconnect.attempts(), 0);

        let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(received.iter().any(|e| matches!(e, PullEvent::AuthenticationFailed { .. })));
        assert!(received.contains(&PullEvent::Debug("Authentication failed. Please re-authenticate.".to_string())));
    }

    #[test]
    fn test_transient_failure_schedules_backoff() {
        let (mut manager, mut events) = manager(ClientSettings::default(), CredentialBundle::new(7));
        while events.try_recv().is_ok() {}

        let next = manager.on_failure(PullError::WebSocket("connection refused".to_string()));
        assert!(matches!(next, Next::Retry(delay) if delay == Duration::from_secs(5)));
        let next = manager.on_failure(PullError::WebSocket("connection refused".to_string()));
        assert!(matches!(next, Next::Retry(delay) if delay == Duration::from_secs(10)));
        assert_eq!(manager.reconnect.attempts(), 2);
    }

    #[test]
    fn test_ceiling_stops_scheduling() {
        let settings = ClientSettings {
            reconnect: crate::pull::ReconnectPolicy {
                max_attempts: 2,
                ..crate::pull::ReconnectPolicy::default()
            },
            ..ClientSettings::default()
        };
        let (mut manager, mut events) = manager(settings, CredentialBundle::new(7));
        while events.try_recv().is_ok() {}

        assert!(matches!(manager.schedule(ReconnectReason::Transient), Next::Retry(_)));
        assert!(matches!(manager.schedule(ReconnectReason::Transient), Next::Retry(_)));
        assert!(matches!(manager.schedule(ReconnectReason::Transient), Next::Idle));

        let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(received.contains(&PullEvent::ReconnectExhausted { attempts: 2 }));
        assert!(received.contains(&PullEvent::Debug("Max reconnection attempts reached".to_string())));
    }

    #[test]
    fn test_manual_disconnect_never_schedules() {
        let (mut manager, _events) = manager(ClientSettings::default(), CredentialBundle::new(7));
        manager.manual = true;
        assert!(matches!(manager.after_close(Outcome::Remote(Some(1006))), Next::Idle));
        assert!(matches!(manager.schedule(ReconnectReason::Transient), Next::Idle));
    }

    #[test]
    fn test_normal_closure_not_retried() {
        let (mut manager, _events) = manager(ClientSettings::default(), CredentialBundle::new(7));
        assert!(matches!(manager.after_close(Outcome::Remote(Some(1000))), Next::Idle));
        assert!(matches!(manager.after_close(Outcome::Remote(Some(1006))), Next::Retry(_)));
        assert!(matches!(manager.after_close(Outcome::Remote(None)), Next::Retry(_)));
    }

    #[test]
    fn test_forced_reason_uses_fixed_delay() {
        let (mut manager, _events) = manager(ClientSettings::default(), CredentialBundle::new(7));
        assert!(matches!(
            manager.after_close(Outcome::Forced(ReconnectReason::ChannelReplaced)),
            Next::Retry(delay) if delay == Duration::from_secs(1)
        ));
    }

    #[tokio::test]
    async fn test_pending_fail_on_close() {
        let (mut manager, _events) = manager(ClientSettings::default(), CredentialBundle::new(7));
        let (tx, rx) = oneshot::channel();
        manager.pending.insert(1, tx);
        let _ = manager.after_close(Outcome::Manual);
        assert!(matches!(rx.await.unwrap(), Err(PullError::ConnectionClosed)));
    }

    #[test]
    fn test_stopped_run_does_not_touch_restarted_state() {
        let shared = Arc::new(Shared::new());
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (_commands_tx, commands_rx) = mpsc::unbounded_channel();
        let mut stale = ConnectionManager::new(
            ClientSettings::default(),
            CredentialBundle::new(7),
            Arc::new(AuthProvider::new(AuthMode::Cookie, BTreeMap::new())),
            Arc::clone(&shared),
            shared.begin_run(),
            Arc::new(AtomicBool::new(false)),
            events_tx,
            commands_rx,
        );

        let current = shared.begin_run();
        current.state.store(ConnectionState::Online);
        current.diagnostics.set_connected(true);

        let _ = stale.after_close(Outcome::Error("broken pipe".to_string()));
        stale.shutdown();

        let run = shared.run();
        assert_eq!(run.state.load(), ConnectionState::Online);
        let identity = crate::pull::SnapshotIdentity {
            user_id: 7,
            site_id: "ap",
            use_api_token: false,
        };
        assert!(run.diagnostics.snapshot(&identity, run.state.load()).connected);
    }

    #[test_case(StatusCode::UNAUTHORIZED, true ; "unauthorized")]
    #[test_case(StatusCode::FORBIDDEN, true ; "forbidden")]
    #[test_case(StatusCode::BAD_GATEWAY, false ; "bad gateway")]
    #[test_case(StatusCode::NOT_FOUND, false ; "not found")]
    fn test_handshake_rejection_classified(status: StatusCode, auth: bool) {
        let error = handshake_rejected(status);
        assert_eq!(error.is_auth_failure(), auth);
        assert!(error.to_string().contains(status.as_str()));
    }

    #[test]
    fn test_status_digits_in_url_are_not_auth_failures() {
        let (mut manager, mut events) = manager(ClientSettings::default(), CredentialBundle::new(7));
        while events.try_recv().is_ok() {}

        let error = PullError::Config("invalid websocket url 'ws://pull.test:4030/bitrix/subws/'".to_string());
        assert!(matches!(manager.on_failure(error), Next::Retry(_)));

        let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(!received.iter().any(|e| matches!(e, PullEvent::AuthenticationFailed { .. })));
    }
}
