//! Streaming API modules.
//!
//! - `proto`: Bayeux messages and channel matching.
//! - `transport`: the transport seam the session manager drives.
//! - `long_polling`: HTTP long-polling transport with advice-driven
//!   reconnects.
//! - `endpoint`: API version normalization and Salesforce transport settings.

/// Streaming endpoint derivation.
pub mod endpoint;
/// Long-polling Bayeux transport.
pub mod long_polling;
/// Bayeux protocol messages.
pub mod proto;
/// Transport traits and shared types.
pub mod transport;

pub use endpoint::{normalize_api_version, streaming_endpoint, DEFAULT_STREAMING_API_VERSION};
