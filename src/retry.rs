//! Reconnect backoff for the streaming transport.
//!
//! The long-polling transport owns its own recovery: every consecutive
//! failed connect or re-handshake waits for [`ReconnectPolicy::delay_for_attempt`]
//! before trying again. A successful exchange resets the attempt counter.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Exponential backoff with lightweight jitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Wait after the first consecutive failure.
    pub initial_backoff: Duration,
    /// Ceiling for the doubled wait.
    pub max_backoff: Duration,
    /// Upper bound of the random offset added to every wait.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// CometD-style defaults: start at one second, cap at one minute.
    pub fn long_polling() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: Duration::from_millis(250),
        }
    }

    /// Wait before reconnect number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31) as u32;
        let base = self
            .initial_backoff
            .checked_mul(1 << doublings)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);
        base + jitter_duration(self.jitter, attempt)
    }

    /// Sleeps for the delay of `attempt`.
    pub async fn wait(&self, attempt: usize) {
        let delay = self.delay_for_attempt(attempt);
        debug!(
            event = "reconnect_backoff",
            attempt,
            delay_ms = delay.as_millis() as u64
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::long_polling()
    }
}

/// Clock-seeded offset in `[0, max]`, at millisecond resolution.
fn jitter_duration(max: Duration, attempt: usize) -> Duration {
    let max_ms = max.as_millis().min(u128::from(u32::MAX)) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| u64::from(since.subsec_micros()))
        .unwrap_or(0);
    let spread = seed.wrapping_add((attempt as u64).wrapping_mul(7_919)) % (max_ms + 1);
    Duration::from_millis(spread)
}
