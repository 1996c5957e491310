//! Pull connection configuration.
//!
//! A [`CredentialBundle`] is the captured browser session handed to the
//! client. The [`ConfigResolver`] turns it into a [`PullConfig`]: the
//! bundle's own configuration when present, otherwise one embedded in the
//! storage snapshots, otherwise a synthesized fallback. Resolution never
//! fails.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use bx_pull_proto::{MOBILE_REVISION, REVISION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::error::PullError;
use crate::settings::ClientSettings;

/// Validity of a synthesized channel, in seconds.
pub const CHANNEL_TTL_SECS: i64 = 12 * 60 * 60;

/// Captured session state for one portal user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialBundle {
    /// Portal user id.
    #[serde(alias = "userId", deserialize_with = "deserialize_user_id")]
    pub user_id: u64,
    /// Browser cookies by name.
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    /// `localStorage` snapshot.
    #[serde(default, alias = "localStorage")]
    pub local_storage: BTreeMap<String, String>,
    /// `sessionStorage` snapshot.
    #[serde(default, alias = "sessionStorage")]
    pub session_storage: BTreeMap<String, String>,
    /// Pre-parsed Pull configuration.
    #[serde(default, alias = "pullConfig", skip_serializing_if = "Option::is_none")]
    pub pull_config: Option<PullConfig>,
}

impl CredentialBundle {
    /// Create a bundle with only a user id.
    #[must_use]
    pub fn new(user_id: u64) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }

    /// Add a cookie.
    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Attach a Pull configuration.
    #[must_use]
    pub fn with_pull_config(mut self, config: PullConfig) -> Self {
        self.pull_config = Some(config);
        self
    }

    /// Parse a bundle from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON does not describe a bundle.
    pub fn from_json(json: &str) -> Result<Self, PullError> {
        serde_json::from_str(json)
            .map_err(|e| PullError::Config(format!("invalid credential bundle: {e}")))
    }

    /// Load a bundle from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PullError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PullError::Config(format!(
                "failed to read credential bundle '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }
}

fn deserialize_user_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Server section of a Pull configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Plain WebSocket endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket: Option<String>,
    /// Secure WebSocket endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket_secure: Option<String>,
    /// Plain long-polling endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_polling: Option<String>,
    /// Secure long-polling endpoint.
    #[serde(
        default,
        alias = "long_pooling_secure",
        skip_serializing_if = "Option::is_none"
    )]
    pub long_polling_secure: Option<String>,
    /// Plain publish endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<String>,
    /// Secure publish endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_secure: Option<String>,
    /// Hostname reported to the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Whether the WebSocket transport is enabled.
    #[serde(default = "enabled")]
    pub websocket_enabled: bool,
}

const fn enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            websocket: None,
            websocket_secure: None,
            long_polling: None,
            long_polling_secure: None,
            publish: None,
            publish_secure: None,
            hostname: None,
            websocket_enabled: true,
        }
    }
}

impl ServerConfig {
    /// Endpoints derived from a portal host.
    #[must_use]
    pub fn for_portal(portal: &str, hostname: &str) -> Self {
        Self {
            websocket: Some(format!("ws://{portal}/bitrix/subws/")),
            websocket_secure: Some(format!("wss://{portal}/bitrix/subws/")),
            long_polling: Some(format!("http://{portal}/bitrix/sub/")),
            long_polling_secure: Some(format!("https://{portal}/bitrix/sub/")),
            publish: Some(format!("http://{portal}/bitrix/rest/")),
            publish_secure: Some(format!("https://{portal}/bitrix/rest/")),
            hostname: Some(hostname.to_string()),
            websocket_enabled: true,
        }
    }

    /// WebSocket endpoint to connect to. The secure one wins.
    #[must_use]
    pub fn websocket_url(&self) -> Option<&str> {
        [&self.websocket_secure, &self.websocket]
            .into_iter()
            .filter_map(Option::as_deref)
            .find(|url| !url.trim().is_empty())
    }
}

/// Kind of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Per-user channel.
    #[default]
    Private,
    /// Channel shared between users.
    Shared,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => write!(f, "private"),
            Self::Shared => write!(f, "shared"),
        }
    }
}

/// A time-bounded channel identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Opaque channel id.
    pub id: String,
    /// Start of validity, Unix seconds.
    #[serde(default, deserialize_with = "deserialize_epoch")]
    pub start: i64,
    /// End of validity, Unix seconds.
    #[serde(default, deserialize_with = "deserialize_epoch")]
    pub end: i64,
    /// Channel kind.
    #[serde(rename = "type", default)]
    pub kind: ChannelKind,
}

fn deserialize_epoch<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(n) => Ok(n),
        Raw::Float(f) => Ok(f as i64),
        Raw::Text(s) => {
            if let Ok(n) = s.trim().parse::<i64>() {
                return Ok(n);
            }
            DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.timestamp())
                .map_err(serde::de::Error::custom)
        }
    }
}

/// Channels by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channels {
    /// Private channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<ChannelDescriptor>,
    /// Shared channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<ChannelDescriptor>,
}

impl Channels {
    /// Channel the connection binds to: private first, then shared.
    #[must_use]
    pub fn primary(&self) -> Option<&ChannelDescriptor> {
        self.private.as_ref().or(self.shared.as_ref())
    }

    /// Ids of every known channel, private first.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        [&self.private, &self.shared]
            .into_iter()
            .flatten()
            .map(|channel| channel.id.clone())
            .collect()
    }

    /// Replace the id of the primary channel, creating a private one if
    /// none exists.
    pub fn replace_primary(&mut self, id: &str, now: i64) {
        let slot = if self.private.is_some() || self.shared.is_none() {
            &mut self.private
        } else {
            &mut self.shared
        };
        match slot {
            Some(channel) => id.clone_into(&mut channel.id),
            None => {
                *slot = Some(ChannelDescriptor {
                    id: id.to_string(),
                    start: now,
                    end: now + CHANNEL_TTL_SECS,
                    kind: ChannelKind::Private,
                });
            }
        }
    }
}

/// Protocol revisions advertised by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRevisions {
    /// Web revision.
    #[serde(default = "web_revision")]
    pub revision_web: u32,
    /// Mobile revision.
    #[serde(default = "mobile_revision")]
    pub revision_mobile: u32,
}

const fn web_revision() -> u32 {
    REVISION
}

const fn mobile_revision() -> u32 {
    MOBILE_REVISION
}

impl Default for ApiRevisions {
    fn default() -> Self {
        Self {
            revision_web: REVISION,
            revision_mobile: MOBILE_REVISION,
        }
    }
}

/// Pull connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullConfig {
    /// Server endpoints.
    #[serde(default)]
    pub server: ServerConfig,
    /// Channel identities.
    #[serde(default)]
    pub channels: Channels,
    /// Protocol revisions.
    #[serde(default)]
    pub api: ApiRevisions,
}

/// Where a resolved configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "key")]
pub enum ConfigSource {
    /// The bundle's `pull_config`.
    Bundle,
    /// A storage snapshot entry with the given key.
    Storage(String),
    /// Built from defaults.
    Synthesized,
}

/// Output of [`ConfigResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedConfig {
    /// The configuration to connect with.
    pub config: PullConfig,
    /// Origin of `config`.
    pub source: ConfigSource,
    /// Whether the channel was synthesized.
    pub synthesized_channel: bool,
    /// Resolution time, Unix seconds.
    pub resolved_at: i64,
}

/// Builds a [`PullConfig`] from a [`CredentialBundle`].
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    portal: String,
    hostname: String,
}

impl ConfigResolver {
    /// Create a resolver that synthesizes endpoints on `portal`.
    #[must_use]
    pub fn new(portal: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            portal: portal.into(),
            hostname: hostname.into(),
        }
    }

    /// Create a resolver from client settings.
    #[must_use]
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(settings.portal.clone(), settings.hostname.clone())
    }

    /// Resolve a configuration at the current time.
    #[must_use]
    pub fn resolve(&self, bundle: &CredentialBundle) -> ResolvedConfig {
        self.resolve_at(bundle, Utc::now().timestamp())
    }

    /// Resolve a configuration as of `now` (Unix seconds).
    #[must_use]
    pub fn resolve_at(&self, bundle: &CredentialBundle, now: i64) -> ResolvedConfig {
        let found = bundle
            .pull_config
            .clone()
            .map(|config| (config, ConfigSource::Bundle))
            .or_else(|| Self::find_embedded(bundle));

        let (mut config, source) = found.unwrap_or_else(|| {
            info!(user_id = bundle.user_id, "no pull config captured, synthesizing");
            (PullConfig::default(), ConfigSource::Synthesized)
        });

        if config.server.websocket_url().is_none() {
            debug!(portal = %self.portal, "config has no websocket endpoint, using portal defaults");
            let hostname = config.server.hostname.take();
            config.server = ServerConfig::for_portal(&self.portal, &self.hostname);
            if hostname.is_some() {
                config.server.hostname = hostname;
            }
        }

        let synthesized_channel = config.channels.primary().is_none();
        if synthesized_channel {
            config.channels.private = Some(Self::synthesize_channel(bundle.user_id, now));
        }

        ResolvedConfig {
            config,
            source,
            synthesized_channel,
            resolved_at: now,
        }
    }

    fn find_embedded(bundle: &CredentialBundle) -> Option<(PullConfig, ConfigSource)> {
        bundle
            .local_storage
            .iter()
            .chain(bundle.session_storage.iter())
            .filter(|(key, _)| key.contains("bx-pull") && key.contains("config"))
            .find_map(|(key, value)| match serde_json::from_str::<PullConfig>(value) {
                Ok(config) => Some((config, ConfigSource::Storage(key.clone()))),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unparsable stored pull config");
                    None
                }
            })
    }

    /// Synthesize a private channel for `user_id`, valid for 12 hours from
    /// `now`.
    ///
    /// The id is `md5(user_id ++ now ++ random) ":" sha1("private" ++ user_id)`.
    #[must_use]
    pub fn synthesize_channel(user_id: u64, now: i64) -> ChannelDescriptor {
        let salt: f64 = rand::random();
        let random_part = format!("{:x}", md5::compute(format!("{user_id}{now}{salt}")));
        let user_part = hex::encode(Sha1::digest(format!("private{user_id}").as_bytes()));

        ChannelDescriptor {
            id: format!("{random_part}:{user_part}"),
            start: now,
            end: now + CHANNEL_TTL_SECS,
            kind: ChannelKind::Private,
        }
    }
}
