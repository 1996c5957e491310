//! REST collaborator used to fetch or create API tokens.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE, USER_AGENT};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::auth::{BoxFuture, TokenSource};
use crate::error::PullError;

/// REST method returning the user's existing token.
pub const GET_TOKEN_METHOD: &str = "base.api.user.getTokenApi";
/// REST method creating a new token.
pub const CREATE_TOKEN_METHOD: &str = "base.api.user.createTokenApi";

/// JSON-over-POST client for the portal REST API.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base: Url,
}

impl RestClient {
    /// Create a client for `base_url`, sending `cookie_header` with every
    /// call.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL or a header value is invalid.
    pub fn new(
        base_url: &str,
        cookie_header: Option<&str>,
        user_agent: &str,
    ) -> Result<Self, PullError> {
        let mut base = Url::parse(base_url)
            .map_err(|e| PullError::Config(format!("invalid rest url '{base_url}': {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent)
                .map_err(|e| PullError::Config(format!("invalid user agent: {e}")))?,
        );
        if let Some(cookies) = cookie_header {
            headers.insert(
                COOKIE,
                HeaderValue::from_str(cookies)
                    .map_err(|e| PullError::Config(format!("invalid cookie header: {e}")))?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| PullError::Rest(e.to_string()))?;

        Ok(Self { http, base })
    }

    /// Base URL methods are resolved against.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Call `method` with `params` and return the `result` member.
    ///
    /// # Errors
    ///
    /// Returns [`PullError::Auth`] on 401/403, [`PullError::Rest`] on any
    /// other transport failure or an `error` member in the reply.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, PullError> {
        let url = self
            .base
            .join(method)
            .map_err(|e| PullError::Rest(format!("invalid method '{method}': {e}")))?;

        debug!(method = %method, "rest call");
        let response = self
            .http
            .post(url)
            .json(&params)
            .send()
            .await
            .map_err(|e| PullError::Rest(e.to_string()))?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(PullError::Auth(format!("{method} returned {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PullError::Rest(format!("{method} returned invalid JSON ({status}): {e}")))?;

        Self::unwrap_result(body)
    }

    fn unwrap_result(body: Value) -> Result<Value, PullError> {
        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            let description = body
                .get("error_description")
                .and_then(Value::as_str)
                .map_or_else(|| error_text(error), str::to_string);
            return Err(PullError::Rest(description));
        }
        Ok(body.get("result").cloned().unwrap_or(body))
    }
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pull a token string out of a REST `result`.
///
/// Accepts `{token}`, `{PASSWORD}`, `{data}` objects and a bare string.
#[must_use]
pub fn extract_token(result: &Value) -> Option<String> {
    let token = match result {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => ["token", "PASSWORD", "data"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str)),
        _ => None,
    }?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

impl TokenSource for RestClient {
    fn get_token(&self) -> BoxFuture<'_, Result<Option<String>, PullError>> {
        Box::pin(async move {
            let result = self.call(GET_TOKEN_METHOD, json!({})).await?;
            Ok(extract_token(&result))
        })
    }

    fn create_token<'a>(
        &'a self,
        name: &'a str,
        expires_in_days: u32,
    ) -> BoxFuture<'a, Result<Option<String>, PullError>> {
        Box::pin(async move {
            let params = json!({ "name": name, "expires_in_days": expires_in_days });
            let result = self.call(CREATE_TOKEN_METHOD, params).await?;
            Ok(extract_token(&result))
        })
    }
}
