//! # bx-pull
//!
//! Realtime push client for the Bitrix24 Pull protocol.
//!
//! Given a [`CredentialBundle`] captured from a browser session, the
//! client resolves a Pull configuration, authenticates with cookies or an
//! API token, and keeps a WebSocket to the Pull server alive: it answers
//! keepalives, acknowledges pushed messages exactly once, follows
//! server-initiated channel changes, and reconnects with exponential
//! backoff when the connection drops.
//!
//! ```no_run
//! use bx_pull::{ClientSettings, CredentialBundle, PullClient, PullEvent};
//!
//! # async fn demo() -> Result<(), bx_pull::PullError> {
//! let bundle = CredentialBundle::from_file("bundle.json")?;
//! let client = PullClient::new(ClientSettings::default(), bundle);
//! let mut events = client.start();
//! while let Some(event) = events.recv().await {
//!     if let PullEvent::Message(message) = event {
//!         println!("{}: {}", message.event_type, message.params);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod error;
pub mod pull;
pub mod rest;
pub mod settings;

pub use auth::{AuthMaterial, AuthMode, AuthProvider, TokenSource};
pub use config::{ConfigResolver, CredentialBundle, PullConfig, ResolvedConfig};
pub use error::PullError;
pub use pull::{
    ConnectionState, DebugSnapshot, PullClient, PullEvent, PushEvent, UserStatus,
    UserStatusSubscription,
};
pub use rest::RestClient;
pub use settings::ClientSettings;
