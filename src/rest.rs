//! REST data API client for creating customers (Contact records).
//!
//! The client reuses tokens issued by [`crate::auth::TokenClient`]; it does
//! not authenticate on its own.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::auth::{parse_json_body, resolve_path, TokenError};
use crate::stream::normalize_api_version;

pub const DEFAULT_REST_API_VERSION: &str = "v58.0";

#[derive(Clone, Debug)]
pub struct CustomerClientOptions {
    pub api_version: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for CustomerClientOptions {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_REST_API_VERSION.to_string(),
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Inbound customer payload.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CustomerPayload {
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct ContactRecord<'a> {
    #[serde(rename = "LastName")]
    last_name: &'a str,
}

/// Upstream status and body of a successful create call.
#[derive(Clone, Debug, PartialEq)]
pub struct CreatedCustomer {
    pub status: StatusCode,
    pub body: Option<Value>,
}

#[derive(Clone, Debug, Error)]
pub enum RestError {
    #[error("Missing Salesforce access token")]
    MissingAccessToken,

    #[error("lastName is required to create a Salesforce customer")]
    MissingLastName,

    #[error(transparent)]
    InvalidBaseUrl(TokenError),

    #[error("customer request failed: {0}")]
    Transport(Arc<reqwest::Error>),

    #[error("Salesforce responded with invalid JSON: {0}")]
    MalformedResponse(String),

    #[error("failed to create Salesforce customer: http status {status}")]
    Upstream {
        status: StatusCode,
        payload: Option<Value>,
    },
}

impl From<reqwest::Error> for RestError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(Arc::new(err))
    }
}

#[derive(Clone)]
pub struct CustomerClient {
    http: Client,
    base_url: String,
    api_version: String,
    request_timeout: Duration,
}

impl CustomerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RestError> {
        Self::with_options(base_url, CustomerClientOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        options: CustomerClientOptions,
    ) -> Result<Self, RestError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            api_version: normalize_api_version(Some(&options.api_version)),
            request_timeout: options.request_timeout,
        })
    }

    /// Creates a Contact whose `LastName` is the payload's trimmed last name.
    pub async fn create_customer(
        &self,
        payload: &CustomerPayload,
        access_token: Option<&SecretString>,
    ) -> Result<CreatedCustomer, RestError> {
        let access_token = access_token
            .filter(|token| !token.expose_secret().is_empty())
            .ok_or(RestError::MissingAccessToken)?;
        let last_name = payload
            .last_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or(RestError::MissingLastName)?;

        let endpoint = self.contact_endpoint()?;
        debug!(event = "create_customer", endpoint = %endpoint);

        let response = self
            .http
            .post(endpoint)
            .timeout(self.request_timeout)
            .bearer_auth(access_token.expose_secret())
            .json(&ContactRecord { last_name })
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        let body =
            parse_json_body(&text).map_err(|err| RestError::MalformedResponse(err.to_string()))?;

        if !status.is_success() {
            return Err(RestError::Upstream {
                status,
                payload: body,
            });
        }

        Ok(CreatedCustomer { status, body })
    }

    fn contact_endpoint(&self) -> Result<reqwest::Url, RestError> {
        let path = format!("/services/data/{}/sobjects/Contact", self.api_version);
        resolve_path(&self.base_url, &path).map_err(RestError::InvalidBaseUrl)
    }
}
