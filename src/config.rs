//! Static Salesforce configuration.
//!
//! Credentials and listener settings are read through [`ConfigSource`] so the
//! session manager can re-read listener settings on every start call.
//! [`SalesforceSettings`] is the bundled source: it deserializes the
//! `salesforce.*` keys from a JSON document or loads them from environment
//! variables.

use std::env;

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

pub const ENV_BASE_URL: &str = "SALESFORCE_BASE_URL";
pub const ENV_CLIENT_ID: &str = "SALESFORCE_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "SALESFORCE_CLIENT_SECRET";
pub const ENV_LISTENER_ENABLED: &str = "SALESFORCE_LISTENER_ENABLED";
pub const ENV_STREAMING_CHANNEL: &str = "SALESFORCE_STREAMING_CHANNEL";
pub const ENV_API_VERSION: &str = "SALESFORCE_API_VERSION";

/// OAuth client credentials plus the org base URL.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
}

/// Listener toggles, read each time the listener is started.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenerConfig {
    pub enabled: bool,
    pub channel: Option<String>,
    pub api_version: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "Salesforce configuration is incomplete: `{key}` is not set. Ensure base URL, client id and secret are set."
    )]
    Missing { key: &'static str },

    #[error("invalid value for `{key}`: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("failed to parse configuration document: {0}")]
    Parse(String),
}

/// Read-only provider of credentials and listener settings.
pub trait ConfigSource: Send + Sync {
    /// Returns the OAuth credentials, failing when any field is absent.
    fn credentials(&self) -> Result<Credentials, ConfigError>;

    /// Returns the current listener settings.
    fn listener(&self) -> ListenerConfig;
}

/// The `salesforce.*` configuration keys.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesforceSettings {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<SecretString>,
    #[serde(default)]
    pub listener_enabled: bool,
    #[serde(default)]
    pub streaming_channel: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SettingsDocument {
    #[serde(default)]
    salesforce: SalesforceSettings,
}

impl SalesforceSettings {
    /// Parses a JSON document whose top-level `salesforce` object carries the
    /// settings.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        serde_json::from_str::<SettingsDocument>(document)
            .map(|doc| doc.salesforce)
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads settings from the `SALESFORCE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listener_enabled = match non_blank(lookup(ENV_LISTENER_ENABLED)) {
            Some(value) => parse_flag(ENV_LISTENER_ENABLED, &value)?,
            None => false,
        };

        Ok(Self {
            base_url: lookup(ENV_BASE_URL),
            client_id: lookup(ENV_CLIENT_ID),
            client_secret: lookup(ENV_CLIENT_SECRET).map(SecretString::new),
            listener_enabled,
            streaming_channel: lookup(ENV_STREAMING_CHANNEL),
            api_version: lookup(ENV_API_VERSION),
        })
    }
}

impl ConfigSource for SalesforceSettings {
    fn credentials(&self) -> Result<Credentials, ConfigError> {
        use secrecy::ExposeSecret;

        let base_url = non_blank(self.base_url.clone()).ok_or(ConfigError::Missing {
            key: "salesforce.baseUrl",
        })?;
        let client_id = non_blank(self.client_id.clone()).ok_or(ConfigError::Missing {
            key: "salesforce.clientId",
        })?;
        let client_secret = self
            .client_secret
            .clone()
            .filter(|secret| !secret.expose_secret().trim().is_empty())
            .ok_or(ConfigError::Missing {
                key: "salesforce.clientSecret",
            })?;

        Ok(Credentials {
            base_url,
            client_id,
            client_secret,
        })
    }

    fn listener(&self) -> ListenerConfig {
        ListenerConfig {
            enabled: self.listener_enabled,
            channel: non_blank(self.streaming_channel.clone()),
            api_version: non_blank(self.api_version.clone()),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}
