//! OAuth client-credentials token client.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::Credentials;

pub const TOKEN_PATH: &str = "/services/oauth2/token";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TokenClientDefaults;

impl TokenClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

#[derive(Clone, Debug)]
pub struct TokenClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for TokenClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: TokenClientDefaults::CONNECT_TIMEOUT,
            request_timeout: TokenClientDefaults::REQUEST_TIMEOUT,
        }
    }
}

/// Bearer token and the org instance it is valid for.
#[derive(Clone, Debug)]
pub struct AccessToken {
    pub access_token: SecretString,
    pub instance_url: String,
}

impl AccessToken {
    /// Extracts `access_token` and `instance_url` from a token payload.
    ///
    /// Both fields must be present and non-empty strings.
    pub fn from_payload(payload: Option<&Value>) -> Result<Self, TokenError> {
        let field = |name: &str| {
            payload
                .and_then(|value| value.get(name))
                .and_then(Value::as_str)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        match (field("access_token"), field("instance_url")) {
            (Some(access_token), Some(instance_url)) => Ok(Self {
                access_token: SecretString::new(access_token),
                instance_url,
            }),
            _ => Err(TokenError::IncompleteResponse),
        }
    }
}

#[derive(Clone, Debug, Error)]
pub enum TokenError {
    #[error("invalid Salesforce base url {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("token request failed: {0}")]
    Transport(Arc<reqwest::Error>),

    #[error("failed to obtain Salesforce access token: http status {status}")]
    UpstreamAuth {
        status: StatusCode,
        payload: Option<Value>,
    },

    #[error("Salesforce responded with invalid JSON: {0}")]
    MalformedResponse(String),

    #[error("Salesforce access token response missing access_token or instance_url")]
    IncompleteResponse,
}

impl From<reqwest::Error> for TokenError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(Arc::new(err))
    }
}

#[derive(Clone)]
pub struct TokenClient {
    http: Client,
    request_timeout: Duration,
}

impl TokenClient {
    pub fn new() -> Result<Self, TokenError> {
        Self::with_options(TokenClientOptions::default())
    }

    pub fn with_options(options: TokenClientOptions) -> Result<Self, TokenError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()?;

        Ok(Self {
            http,
            request_timeout: options.request_timeout,
        })
    }

    /// Runs the client-credentials grant and returns the raw token payload.
    ///
    /// An empty response body yields `Ok(None)`.
    pub async fn request_token(
        &self,
        credentials: &Credentials,
    ) -> Result<Option<Value>, TokenError> {
        let endpoint = token_endpoint(&credentials.base_url)?;
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.expose_secret().as_str()),
        ];

        debug!(event = "token_request", endpoint = %endpoint);
        let response = self
            .http
            .post(endpoint)
            .timeout(self.request_timeout)
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        let payload = parse_json_body(&body)
            .map_err(|err| TokenError::MalformedResponse(err.to_string()))?;

        if !status.is_success() {
            return Err(TokenError::UpstreamAuth { status, payload });
        }

        Ok(payload)
    }

    /// Runs the client-credentials grant and requires a complete token.
    pub async fn acquire_token(&self, credentials: &Credentials) -> Result<AccessToken, TokenError> {
        let payload = self.request_token(credentials).await?;
        AccessToken::from_payload(payload.as_ref())
    }
}

pub(crate) fn token_endpoint(base_url: &str) -> Result<Url, TokenError> {
    resolve_path(base_url, TOKEN_PATH)
}

/// Resolves an absolute path against the origin of `base_url`.
pub(crate) fn resolve_path(base_url: &str, path: &str) -> Result<Url, TokenError> {
    let invalid = |reason: String| TokenError::InvalidBaseUrl {
        url: base_url.to_string(),
        reason,
    };
    Url::parse(base_url)
        .map_err(|err| invalid(err.to_string()))?
        .join(path)
        .map_err(|err| invalid(err.to_string()))
}

/// Parses a response body as JSON, treating an empty body as no payload.
pub(crate) fn parse_json_body(body: &str) -> Result<Option<Value>, serde_json::Error> {
    if body.is_empty() {
        return Ok(None);
    }

    serde_json::from_str(body).map(Some)
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;
    use serde_json::json;

    use super::{parse_json_body, token_endpoint, AccessToken, TokenError};

    #[test]
    fn token_endpoint_replaces_base_path() {
        let url = token_endpoint("https://example.my.salesforce.com/some/path").expect("url");
        assert_eq!(
            url.as_str(),
            "https://example.my.salesforce.com/services/oauth2/token"
        );
    }

    #[test]
    fn token_endpoint_rejects_relative_base() {
        assert!(matches!(
            token_endpoint("not a url"),
            Err(TokenError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn empty_body_is_null_payload() {
        assert!(parse_json_body("").expect("empty body").is_none());
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(parse_json_body("<html>oops</html>").is_err());
    }

    #[test]
    fn complete_payload_yields_token() {
        let payload = json!({
            "access_token": "00D-token",
            "instance_url": "https://example.my.salesforce.com",
            "token_type": "Bearer"
        });
        let token = AccessToken::from_payload(Some(&payload)).expect("token");
        assert_eq!(token.access_token.expose_secret(), "00D-token");
        assert_eq!(token.instance_url, "https://example.my.salesforce.com");
    }

    #[test]
    fn payload_missing_either_field_is_incomplete() {
        let no_token = json!({ "instance_url": "https://example.my.salesforce.com" });
        let no_instance = json!({ "access_token": "00D-token" });

        for payload in [Some(&no_token), Some(&no_instance), None] {
            assert!(matches!(
                AccessToken::from_payload(payload),
                Err(TokenError::IncompleteResponse)
            ));
        }
    }

    #[test]
    fn debug_output_hides_access_token() {
        let payload = json!({
            "access_token": "super-secret",
            "instance_url": "https://example.my.salesforce.com"
        });
        let token = AccessToken::from_payload(Some(&payload)).expect("token");
        assert!(!format!("{token:?}").contains("super-secret"));
    }
}
