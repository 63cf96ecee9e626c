//! Bayeux protocol messages exchanged with the CometD endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const BAYEUX_VERSION: &str = "1.0";

pub const META_PREFIX: &str = "/meta/";
pub const META_HANDSHAKE: &str = "/meta/handshake";
pub const META_CONNECT: &str = "/meta/connect";
pub const META_SUBSCRIBE: &str = "/meta/subscribe";
pub const META_DISCONNECT: &str = "/meta/disconnect";

/// Server reconnect instruction carried in `advice.reconnect`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    Retry,
    Handshake,
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Advice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<Reconnect>,
    /// Milliseconds to wait before the next connect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Milliseconds the server may hold a connect open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// A single Bayeux message. Requests and replies share one shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BayeuxMessage {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    /// Local failure details attached to synthetic replies; never sent.
    #[serde(default, skip_serializing)]
    pub failure: Option<Value>,
}

impl BayeuxMessage {
    pub fn handshake(id: String, connection_types: Vec<String>) -> Self {
        Self {
            channel: META_HANDSHAKE.to_string(),
            id: Some(id),
            version: Some(BAYEUX_VERSION.to_string()),
            minimum_version: Some(BAYEUX_VERSION.to_string()),
            supported_connection_types: Some(connection_types),
            ..Self::default()
        }
    }

    pub fn connect(id: String, client_id: String, connection_type: &str) -> Self {
        Self {
            channel: META_CONNECT.to_string(),
            id: Some(id),
            client_id: Some(client_id),
            connection_type: Some(connection_type.to_string()),
            ..Self::default()
        }
    }

    pub fn subscribe(id: String, client_id: String, subscription: &str) -> Self {
        Self {
            channel: META_SUBSCRIBE.to_string(),
            id: Some(id),
            client_id: Some(client_id),
            subscription: Some(subscription.to_string()),
            ..Self::default()
        }
    }

    pub fn disconnect(id: String, client_id: String) -> Self {
        Self {
            channel: META_DISCONNECT.to_string(),
            id: Some(id),
            client_id: Some(client_id),
            ..Self::default()
        }
    }

    /// Builds an unsuccessful reply for `request` describing a local failure.
    pub fn failed_reply(request: &BayeuxMessage, reason: impl Into<String>) -> Self {
        Self {
            channel: request.channel.clone(),
            id: request.id.clone(),
            client_id: request.client_id.clone(),
            subscription: request.subscription.clone(),
            successful: Some(false),
            failure: Some(serde_json::json!({
                "reason": reason.into(),
                "message": request,
            })),
            ..Self::default()
        }
    }

    pub fn is_meta(&self) -> bool {
        self.channel.starts_with(META_PREFIX)
    }

    pub fn is_successful(&self) -> bool {
        self.successful.unwrap_or(false)
    }

    pub fn reconnect_advice(&self) -> Option<Reconnect> {
        self.advice.as_ref().and_then(|advice| advice.reconnect)
    }

    /// Renders the message for structured logs.
    pub fn to_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let (Some(failure), Value::Object(map)) = (&self.failure, &mut value) {
            map.insert("failure".to_string(), failure.clone());
        }
        value
    }
}

/// Returns the meta message type (`handshake`, `connect`, ...) for a channel.
pub fn meta_type(channel: &str) -> Option<&str> {
    channel.strip_prefix(META_PREFIX)
}

/// Matches a channel name against a Bayeux channel pattern.
///
/// `*` matches exactly one trailing segment, `**` matches one or more.
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    if pattern == channel {
        return true;
    }

    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let channel_segments: Vec<&str> = channel.split('/').collect();
    let Some((last, prefix)) = pattern_segments.split_last() else {
        return false;
    };

    let prefix_matches = |count: usize| {
        channel_segments.len() >= count
            && prefix
                .iter()
                .zip(channel_segments.iter())
                .all(|(expected, actual)| expected == actual)
    };

    match *last {
        "*" => channel_segments.len() == pattern_segments.len() && prefix_matches(prefix.len()),
        "**" => channel_segments.len() >= pattern_segments.len() && prefix_matches(prefix.len()),
        _ => false,
    }
}
