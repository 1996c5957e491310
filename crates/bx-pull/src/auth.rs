//! Authentication material for the Pull connection.
//!
//! Cookie mode forwards the session cookies captured from the browser.
//! Token mode obtains an API token from a [`TokenSource`] and falls back
//! to cookie mode when no token can be had. Resolution never fails.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::PullError;

/// Boxed future returned by [`TokenSource`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Cookie name fragments that carry session identity.
pub const AUTH_COOKIE_FRAGMENTS: [&str; 4] = ["bitrix_sm_", "phpsessid", "uid", "login"];

/// Lifetime requested for newly created tokens.
pub const TOKEN_EXPIRY_DAYS: u32 = 365;

/// Join the identity-relevant cookies into a `Cookie` header value.
///
/// Names are matched case-insensitively against [`AUTH_COOKIE_FRAGMENTS`].
/// Returns `None` when nothing matches.
#[must_use]
pub fn filter_cookies(cookies: &BTreeMap<String, String>) -> Option<String> {
    let header = cookies
        .iter()
        .filter(|(name, _)| {
            let name = name.to_ascii_lowercase();
            AUTH_COOKIE_FRAGMENTS.iter().any(|fragment| name.contains(fragment))
        })
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ");

    (!header.is_empty()).then_some(header)
}

/// Name given to tokens this client creates.
#[must_use]
pub fn token_name(date: NaiveDate) -> String {
    format!("Rust Bitrix Pull Client - {}", date.format("%Y-%m-%d"))
}

/// How the connection authenticates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMode {
    /// Session cookies.
    #[default]
    Cookie,
    /// Bearer API token.
    Token,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cookie => write!(f, "cookie"),
            Self::Token => write!(f, "token"),
        }
    }
}

/// Resolved credentials embedded into the connection request.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMaterial {
    /// Authenticate with cookies only.
    Cookie {
        /// Filtered `Cookie` header, if any cookie matched.
        header: Option<String>,
    },
    /// Authenticate with an API token.
    Token {
        /// The token.
        token: String,
        /// Filtered `Cookie` header sent alongside, if any.
        cookie_header: Option<String>,
    },
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cookie { header } => f
                .debug_struct("Cookie")
                .field("cookies", &header.as_ref().map(|h| h.split("; ").count()))
                .finish(),
            Self::Token { .. } => f.debug_struct("Token").finish_non_exhaustive(),
        }
    }
}

impl AuthMaterial {
    /// Mode in effect.
    #[must_use]
    pub const fn mode(&self) -> AuthMode {
        match self {
            Self::Cookie { .. } => AuthMode::Cookie,
            Self::Token { .. } => AuthMode::Token,
        }
    }

    /// The API token, in token mode.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Token { token, .. } => Some(token),
            Self::Cookie { .. } => None,
        }
    }

    /// The filtered `Cookie` header, if any.
    #[must_use]
    pub fn cookie_header(&self) -> Option<&str> {
        match self {
            Self::Cookie { header } => header.as_deref(),
            Self::Token { cookie_header, .. } => cookie_header.as_deref(),
        }
    }

    /// Query parameters carrying the credentials.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Token { token, .. } => vec![("api_token", token.clone())],
            Self::Cookie { header: Some(header) } => vec![("cookies", header.clone())],
            Self::Cookie { header: None } => Vec::new(),
        }
    }
}

/// Source of API tokens, normally the portal's REST API.
pub trait TokenSource: Send + Sync {
    /// Fetch the user's existing token, if any.
    fn get_token(&self) -> BoxFuture<'_, Result<Option<String>, PullError>>;

    /// Create a token named `name` valid for `expires_in_days`.
    fn create_token<'a>(
        &'a self,
        name: &'a str,
        expires_in_days: u32,
    ) -> BoxFuture<'a, Result<Option<String>, PullError>>;
}

/// Resolves and caches [`AuthMaterial`].
pub struct AuthProvider {
    mode: AuthMode,
    cookies: BTreeMap<String, String>,
    source: Option<Arc<dyn TokenSource>>,
    cached: Mutex<Option<AuthMaterial>>,
}

impl fmt::Debug for AuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthProvider")
            .field("mode", &self.mode)
            .field("has_token_source", &self.source.is_some())
            .field("cached", &self.cached.lock().is_some())
            .finish()
    }
}

impl AuthProvider {
    /// Create a provider.
    #[must_use]
    pub fn new(mode: AuthMode, cookies: BTreeMap<String, String>) -> Self {
        Self {
            mode,
            cookies,
            source: None,
            cached: Mutex::new(None),
        }
    }

    /// Use `source` for token mode.
    #[must_use]
    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Requested mode.
    #[must_use]
    pub const fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Currently cached material.
    #[must_use]
    pub fn cached(&self) -> Option<AuthMaterial> {
        self.cached.lock().clone()
    }

    /// Drop cached material so the next [`resolve`](Self::resolve) starts
    /// over.
    pub fn invalidate(&self) {
        if self.cached.lock().take().is_some() {
            info!("cached credentials invalidated");
        }
    }

    /// Resolve credentials, reusing the cached value when present.
    pub async fn resolve(&self) -> AuthMaterial {
        if let Some(material) = self.cached() {
            return material;
        }

        let material = match self.mode {
            AuthMode::Token => self.resolve_token().await,
            AuthMode::Cookie => None,
        }
        .unwrap_or_else(|| self.cookie_material());

        debug!(mode = %material.mode(), "credentials resolved");
        *self.cached.lock() = Some(material.clone());
        material
    }

    fn cookie_material(&self) -> AuthMaterial {
        AuthMaterial::Cookie {
            header: filter_cookies(&self.cookies),
        }
    }

    async fn resolve_token(&self) -> Option<AuthMaterial> {
        let Some(source) = self.source.as_ref() else {
            warn!("token mode requested without a token source, using cookies");
            return None;
        };

        let token = match source.get_token().await {
            Ok(Some(token)) if !token.is_empty() => Some(token),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "failed to fetch existing api token");
                None
            }
        };

        let token = match token {
            Some(token) => token,
            None => {
                let name = token_name(Local::now().date_naive());
                match source.create_token(&name, TOKEN_EXPIRY_DAYS).await {
                    Ok(Some(token)) if !token.is_empty() => {
                        info!(name = %name, "created api token");
                        token
                    }
                    Ok(_) => {
                        warn!("token creation returned no token, using cookies");
                        return None;
                    }
                    Err(e) => {
                        warn!(error = %e, "token creation failed, using cookies");
                        return None;
                    }
                }
            }
        };

        Some(AuthMaterial::Token {
            token,
            cookie_header: filter_cookies(&self.cookies),
        })
    }
}
