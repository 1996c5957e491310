//! Public handle for the Pull client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bx_pull_proto::CloseCode;
use chrono::Local;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::auth::{AuthMode, AuthProvider, TokenSource};
use crate::config::CredentialBundle;
use crate::error::PullError;
use crate::settings::ClientSettings;

use super::connection::{Command, ConnectionManager, Shared, WorkerLink};
use super::debug::{DebugSnapshot, SnapshotIdentity};
use super::events::PullEvent;
use super::presence::UserStatusSubscription;
use super::publish::{Composer, Publication};
use super::state::ConnectionState;

/// Realtime push client for one portal user.
///
/// [`start`](Self::start) spawns the connection task on the current Tokio
/// runtime and returns the event stream. Every other method is a cheap
/// handoff to that task; none of them block on the network except the
/// awaited replies of [`send`](Self::send) and [`request`](Self::request).
///
/// Dropping the client stops it.
pub struct PullClient {
    settings: ClientSettings,
    bundle: CredentialBundle,
    auth: Arc<AuthProvider>,
    composer: Composer,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PullClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullClient")
            .field("user_id", &self.bundle.user_id)
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl PullClient {
    /// Create a stopped client.
    #[must_use]
    pub fn new(settings: ClientSettings, bundle: CredentialBundle) -> Self {
        let auth = AuthProvider::new(auth_mode(&settings), bundle.cookies.clone());
        let composer = Composer::new(&settings, bundle.user_id);
        Self {
            settings,
            bundle,
            auth: Arc::new(auth),
            composer,
            shared: Arc::new(Shared::new()),
        }
    }

    /// Use `source` to obtain API tokens in token mode.
    #[must_use]
    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        let auth = AuthProvider::new(auth_mode(&self.settings), self.bundle.cookies.clone())
            .with_token_source(source);
        self.auth = Arc::new(auth);
        self
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Portal user id.
    #[must_use]
    pub const fn user_id(&self) -> u64 {
        self.bundle.user_id
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.run().state.load()
    }

    /// Whether a connection task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Resolve the configuration and connect in the background.
    ///
    /// A previous run is stopped first. Must be called within a Tokio
    /// runtime.
    pub fn start(&self) -> mpsc::UnboundedReceiver<PullEvent> {
        self.stop();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let run_state = self.shared.begin_run();

        let manager = ConnectionManager::new(
            self.settings.clone(),
            self.bundle.clone(),
            Arc::clone(&self.auth),
            Arc::clone(&self.shared),
            run_state,
            Arc::clone(&running),
            events_tx,
            commands_rx,
        );
        self.shared.attach(WorkerLink {
            commands: commands_tx,
            running,
        });
        tokio::spawn(manager.run());

        info!(user_id = self.bundle.user_id, "pull client started");
        events_rx
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub fn stop(&self) {
        if let Some(link) = self.shared.detach() {
            link.running.store(false, Ordering::SeqCst);
            let _ = link.commands.send(Command::Stop);
            self.shared.run().state.store(ConnectionState::Offline);
            info!(user_id = self.bundle.user_id, "pull client stopped");
        }
    }

    /// Close the socket with `code` without stopping the client. No
    /// reconnect follows until [`connect`](Self::connect).
    pub fn disconnect(&self, code: CloseCode, reason: &str) {
        self.shared.command(Command::Disconnect {
            code,
            reason: reason.to_string(),
        });
    }

    /// Reconnect after [`disconnect`](Self::disconnect) or after the
    /// reconnect ceiling was reached.
    pub fn connect(&self) {
        self.shared.command(Command::Connect);
    }

    /// Publish `text` to chat `chat_id`. Returns `false` unless online and
    /// the frame was written.
    pub async fn send(&self, chat_id: u64, text: &str) -> bool {
        let revision = self.shared.run().diagnostics.revision();
        let publication = self.composer.chat_message(chat_id, text, revision, Local::now());
        let sent = self.publish(publication).await;
        debug!(chat_id, sent, "chat message");
        sent
    }

    /// Publish a typing indicator to chat `chat_id`.
    pub async fn send_typing(&self, chat_id: u64, typing: bool) -> bool {
        self.publish(Composer::typing(chat_id, typing)).await
    }

    async fn publish(&self, publication: Publication) -> bool {
        if self.state() != ConnectionState::Online {
            return false;
        }
        let (reply, rx) = oneshot::channel();
        if !self.shared.command(Command::Publish { publication, reply }) {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Send an RPC and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns [`PullError::NotConnected`] when offline,
    /// [`PullError::Timeout`] when no reply arrives within the configured
    /// request timeout, [`PullError::ConnectionClosed`] when the socket
    /// closes first, and [`PullError::Rpc`] when the server answers with
    /// an error.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, PullError> {
        if self.state() != ConnectionState::Online {
            return Err(PullError::NotConnected);
        }
        let (reply, rx) = oneshot::channel();
        let queued = self.shared.command(Command::Request {
            method: method.to_string(),
            params,
            reply,
        });
        if !queued {
            return Err(PullError::NotConnected);
        }

        match tokio::time::timeout(self.settings.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PullError::ConnectionClosed),
            Err(_) => Err(PullError::Timeout),
        }
    }

    /// Watch presence changes of `user_id`.
    #[must_use]
    pub fn subscribe_user_status(&self, user_id: u64) -> UserStatusSubscription {
        UserStatusSubscription::new(Arc::clone(&self.shared), user_id)
    }

    /// Read-only diagnostic snapshot.
    #[must_use]
    pub fn debug_info(&self) -> DebugSnapshot {
        let identity = SnapshotIdentity {
            user_id: self.bundle.user_id,
            site_id: &self.settings.site_id,
            use_api_token: self.settings.use_api_token,
        };
        let run = self.shared.run();
        run.diagnostics.snapshot(&identity, run.state.load())
    }
}

impl Drop for PullClient {
    fn drop(&mut self) {
        self.stop();
    }
}

const fn auth_mode(settings: &ClientSettings) -> AuthMode {
    if settings.use_api_token {
        AuthMode::Token
    } else {
        AuthMode::Cookie
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PullClient {
        PullClient::new(ClientSettings::default(), CredentialBundle::new(7))
    }

    #[test]
    fn test_new_client_is_offline() {
        let client = client();
        assert_eq!(client.state(), ConnectionState::Offline);
        assert!(!client.is_running());
        assert_eq!(client.user_id(), 7);
    }

    #[test]
    fn test_stop_is_idempotent_without_start() {
        let client = client();
        client.stop();
        client.stop();
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_send_requires_online() {
        let client = client();
        assert!(!client.send(42, "hello").await);
        assert!(!client.send_typing(42, true).await);
        assert!(matches!(
            client.request("server.time", Value::Null).await,
            Err(PullError::NotConnected)
        ));
    }

    #[test]
    fn test_debug_info_before_start() {
        let client = client();
        let info = client.debug_info();
        assert_eq!(info.status, "offline");
        assert!(!info.connected);
        assert_eq!(info.user_id, 7);
        assert_eq!(info.site_id, "ap");
        assert!(!info.use_api_token);
    }

    #[test]
    fn test_auth_mode_follows_settings() {
        let settings = ClientSettings {
            use_api_token: true,
            ..ClientSettings::default()
        };
        assert_eq!(auth_mode(&settings), AuthMode::Token);
        assert_eq!(auth_mode(&ClientSettings::default()), AuthMode::Cookie);
    }
}
