//! Streaming endpoint and transport configuration derived from a token.

use secrecy::{ExposeSecret, SecretString};

use crate::auth::AccessToken;
use crate::stream::transport::{ConnectionType, TransportConfig};

/// API version used when none is configured.
pub const DEFAULT_STREAMING_API_VERSION: &str = "v61.0";

/// Normalizes a configured API version into a `vNN.N` path segment.
///
/// One leading `/` is stripped and a `v` prefix is added when missing.
/// An absent version yields [`DEFAULT_STREAMING_API_VERSION`].
pub fn normalize_api_version(version: Option<&str>) -> String {
    let Some(version) = version else {
        return DEFAULT_STREAMING_API_VERSION.to_string();
    };

    let version = version.strip_prefix('/').unwrap_or(version);
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{version}")
    }
}

/// Builds `{instance_url}/cometd/{version}/`.
pub fn streaming_endpoint(instance_url: &str, api_version: Option<&str>) -> String {
    format!(
        "{}/cometd/{}/",
        instance_url.trim_end_matches('/'),
        normalize_api_version(api_version)
    )
}

/// Transport settings required by the Salesforce streaming API.
///
/// Long polling is the only allowed connection type; websocket is excluded
/// because the upstream does not support it.
pub fn salesforce_transport_config(token: &AccessToken, api_version: Option<&str>) -> TransportConfig {
    TransportConfig::new(streaming_endpoint(&token.instance_url, api_version))
        .with_header(
            "Authorization",
            SecretString::new(format!("Bearer {}", token.access_token.expose_secret())),
        )
        .with_append_message_type_to_url(false)
        .with_connection_types(vec![ConnectionType::LongPolling])
}
