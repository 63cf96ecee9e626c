//! Log sink handed to the session manager.

use serde_json::Value;
use tracing::{error, info, warn};

/// Structured log sink with the three severities the listener emits.
///
/// Implementations are called from transport delivery tasks as well as from
/// the caller of `start`, so they must be safe to use concurrently.
pub trait ListenerLogger: Send + Sync {
    fn info(&self, message: &str, fields: Value);
    fn warn(&self, message: &str, fields: Value);
    fn error(&self, message: &str, fields: Value);
}

/// Default sink forwarding to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl ListenerLogger for TracingLogger {
    fn info(&self, message: &str, fields: Value) {
        info!(target: "salesforce_listener", fields = %fields, "{message}");
    }

    fn warn(&self, message: &str, fields: Value) {
        warn!(target: "salesforce_listener", fields = %fields, "{message}");
    }

    fn error(&self, message: &str, fields: Value) {
        error!(target: "salesforce_listener", fields = %fields, "{message}");
    }
}
