//! Client settings.
//!
//! User-facing configuration for the Pull client, loaded from TOML:
//! - Portal identity (site id, portal host, reported hostname)
//! - Authentication mode and REST endpoint for token retrieval
//! - Publishing defaults (display name, chat module)
//! - Reconnect and liveness timing

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PullError;
use crate::pull::{LivenessConfig, ReconnectPolicy};

/// Default site id.
pub const DEFAULT_SITE_ID: &str = "ap";
/// Default portal host the Pull endpoints live on.
pub const DEFAULT_PORTAL: &str = "ugautodetal.ru";
/// Default hostname reported to the Pull server.
pub const DEFAULT_HOSTNAME: &str = "www.ugavtopart.ru";
/// Default `User-Agent` header.
pub const DEFAULT_USER_AGENT: &str = "Rust-Bitrix-Pull-Client/0.1";
/// Default module for published chat messages.
pub const DEFAULT_CHAT_MODULE: &str = "uad.shop.chat";

/// Settings for a [`crate::PullClient`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientSettings {
    /// Site id sent with every connection.
    pub site_id: String,
    /// Portal host used to synthesize endpoint URLs.
    pub portal: String,
    /// Hostname reported to the Pull server when the config has none.
    pub hostname: String,
    /// `User-Agent` for WebSocket and REST requests.
    pub user_agent: String,
    /// Authenticate with an API token instead of cookies.
    pub use_api_token: bool,
    /// Base URL of the REST collaborator.
    pub rest_url: Option<String>,
    /// Author name on published messages.
    pub display_name: Option<String>,
    /// Module id for published chat messages.
    pub chat_module: String,
    /// Upper bound on awaiting an RPC reply.
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,
    /// Reconnect policy.
    pub reconnect: ReconnectPolicy,
    /// Keepalive and stuck detection.
    pub liveness: LivenessConfig,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            site_id: DEFAULT_SITE_ID.to_string(),
            portal: DEFAULT_PORTAL.to_string(),
            hostname: DEFAULT_HOSTNAME.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            use_api_token: false,
            rest_url: None,
            display_name: None,
            chat_module: DEFAULT_CHAT_MODULE.to_string(),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            liveness: LivenessConfig::default(),
        }
    }
}

impl ClientSettings {
    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PullError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PullError::Config(format!(
                "failed to read settings file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse settings from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, PullError> {
        let settings: Self = toml::from_str(content)
            .map_err(|e| PullError::Config(format!("invalid TOML: {e}")))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), PullError> {
        for (name, value) in [
            ("site_id", &self.site_id),
            ("portal", &self.portal),
            ("hostname", &self.hostname),
            ("chat_module", &self.chat_module),
        ] {
            if value.trim().is_empty() {
                return Err(PullError::Config(format!("{name} cannot be empty")));
            }
        }

        if let Some(rest_url) = &self.rest_url {
            url::Url::parse(rest_url)
                .map_err(|e| PullError::Config(format!("invalid rest_url '{rest_url}': {e}")))?;
        }

        if self.request_timeout.is_zero() {
            return Err(PullError::Config(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }

        self.reconnect.validate()?;
        self.liveness.validate()?;
        Ok(())
    }

    /// Author name used on published messages.
    #[must_use]
    pub fn author_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or("Unknown")
    }
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = ClientSettings::default();
        assert_eq!(settings.site_id, "ap");
        assert_eq!(settings.chat_module, "uad.shop.chat");
        assert!(!settings.use_api_token);
        assert_eq!(settings.author_name(), "Unknown");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let settings = ClientSettings::from_toml("").unwrap();
        assert_eq!(settings, ClientSettings::default());
    }

    #[test]
    fn test_from_toml_overrides() {
        let toml = r#"
            site_id = "s1"
            use_api_token = true
            rest_url = "https://portal.example.com/rest/1/hook"
            display_name = "Operator"
            request_timeout_ms = 2500

            [reconnect]
            base_delay_ms = 100
            max_attempts = 3

            [liveness]
            ping_wait_ms = 500
        "#;

        let settings = ClientSettings::from_toml(toml).unwrap();
        assert_eq!(settings.site_id, "s1");
        assert!(settings.use_api_token);
        assert_eq!(settings.author_name(), "Operator");
        assert_eq!(settings.request_timeout, Duration::from_millis(2500));
        assert_eq!(settings.reconnect.base_delay, Duration::from_millis(100));
        assert_eq!(settings.reconnect.max_attempts, 3);
        assert_eq!(settings.reconnect.max_delay, Duration::from_secs(60));
        assert_eq!(settings.liveness.ping_wait, Duration::from_millis(500));
        assert_eq!(settings.liveness.keepalive_interval, Duration::from_secs(25));
    }

    #[test]
    fn test_invalid_toml() {
        let err = ClientSettings::from_toml("site_id = [").unwrap_err();
        assert!(err.to_string().contains("invalid TOML"));
    }

    #[test]
    fn test_validate_rejects_empty_site() {
        let err = ClientSettings::from_toml("site_id = \"\"").unwrap_err();
        assert!(err.to_string().contains("site_id"));
    }

    #[test]
    fn test_validate_rejects_bad_rest_url() {
        let err = ClientSettings::from_toml("rest_url = \"not a url\"").unwrap_err();
        assert!(err.to_string().contains("rest_url"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "portal = \"example.bitrix24.ru\"").unwrap();

        let settings = ClientSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.portal, "example.bitrix24.ru");
    }

    #[test]
    fn test_from_missing_file() {
        let err = ClientSettings::from_file("/nonexistent/bx-pull.toml").unwrap_err();
        assert!(matches!(err, PullError::Config(_)));
    }
}
