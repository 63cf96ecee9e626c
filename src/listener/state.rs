//! Session state and the registry that owns it.
//!
//! The registry is the only writer of [`SessionState`]. Every transition
//! happens under its lock, and the outcome of a startup attempt is published
//! on a `watch` channel so any number of callers can await the same attempt.

use tokio::sync::{watch, Mutex};
use tracing::warn;

use crate::listener::{ListenerError, SessionHandle};

pub(crate) type AttemptResult = Result<SessionHandle, ListenerError>;
pub(crate) type AttemptSender = watch::Sender<Option<AttemptResult>>;
pub(crate) type AttemptReceiver = watch::Receiver<Option<AttemptResult>>;

/// Lifecycle of the streaming session.
///
/// A failed attempt passes straight back to `Idle`, so a later start call
/// retries from scratch.
#[derive(Debug)]
pub enum SessionState {
    Idle,
    Starting(AttemptReceiver),
    Connected(SessionHandle),
}

/// Observable summary of [`SessionState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Starting,
    Connected,
}

pub(crate) enum Claim {
    Connected(SessionHandle),
    Attach(AttemptReceiver),
    Begin(AttemptSender, AttemptReceiver),
}

/// Exclusive owner of the process-wide session state.
#[derive(Debug)]
pub struct SessionRegistry {
    state: Mutex<SessionState>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        match &*self.state.lock().await {
            SessionState::Starting(receiver) if !is_abandoned(receiver) => SessionStatus::Starting,
            SessionState::Starting(_) | SessionState::Idle => SessionStatus::Idle,
            SessionState::Connected(_) => SessionStatus::Connected,
        }
    }

    /// Resolves what a start call should do, moving `Idle` to `Starting` when
    /// the caller is the one to begin a new attempt.
    ///
    /// An attempt whose task went away without publishing an outcome counts
    /// as `Idle`.
    pub(crate) async fn claim(&self) -> Claim {
        let mut state = self.state.lock().await;
        match &*state {
            SessionState::Connected(handle) => return Claim::Connected(handle.clone()),
            SessionState::Starting(receiver) if !is_abandoned(receiver) => {
                return Claim::Attach(receiver.clone());
            }
            SessionState::Starting(_) => {
                warn!(event = "startup_attempt_abandoned", "replacing dropped startup attempt");
            }
            SessionState::Idle => {}
        }

        let (sender, receiver) = watch::channel(None);
        *state = SessionState::Starting(receiver.clone());
        Claim::Begin(sender, receiver)
    }

    /// Records the outcome of the in-flight attempt and wakes its waiters.
    pub(crate) async fn complete(&self, sender: AttemptSender, result: AttemptResult) {
        let mut state = self.state.lock().await;
        *state = match &result {
            Ok(handle) => SessionState::Connected(handle.clone()),
            Err(_) => SessionState::Idle,
        };
        sender.send_replace(Some(result));
    }

    /// Waits for an attempt to publish its outcome.
    pub(crate) async fn wait(mut receiver: AttemptReceiver) -> AttemptResult {
        match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or_else(|| {
                Err(ListenerError::Aborted("attempt finished without outcome".to_string()))
            }),
            Err(_) => Err(ListenerError::Aborted(
                "startup attempt dropped before completing".to_string(),
            )),
        }
    }
}

/// True when the attempt's sender is gone and nothing was published.
fn is_abandoned(receiver: &AttemptReceiver) -> bool {
    receiver.has_changed().is_err() && receiver.borrow().is_none()
}

#[cfg(test)]
mod tests {
    use super::{Claim, SessionRegistry, SessionStatus};
    use crate::config::ConfigError;
    use crate::listener::ListenerError;

    #[tokio::test]
    async fn second_claim_attaches_to_first_attempt() {
        let registry = SessionRegistry::new();

        let Claim::Begin(sender, first) = registry.claim().await else {
            panic!("first claim should begin an attempt");
        };
        assert_eq!(registry.status().await, SessionStatus::Starting);

        let Claim::Attach(second) = registry.claim().await else {
            panic!("second claim should attach");
        };

        let error = ListenerError::Configuration(ConfigError::Missing {
            key: "salesforce.baseUrl",
        });
        registry.complete(sender, Err(error)).await;

        for receiver in [first, second] {
            assert!(matches!(
                SessionRegistry::wait(receiver).await,
                Err(ListenerError::Configuration(_))
            ));
        }
    }

    #[tokio::test]
    async fn failed_attempt_returns_to_idle() {
        let registry = SessionRegistry::new();
        let Claim::Begin(sender, _) = registry.claim().await else {
            panic!("expected to begin");
        };

        registry
            .complete(sender, Err(ListenerError::Aborted("boom".to_string())))
            .await;

        assert_eq!(registry.status().await, SessionStatus::Idle);
        assert!(matches!(registry.claim().await, Claim::Begin(..)));
    }

    #[tokio::test]
    async fn dropped_sender_reports_abort() {
        let registry = SessionRegistry::new();
        let Claim::Begin(sender, receiver) = registry.claim().await else {
            panic!("expected to begin");
        };
        drop(sender);

        assert!(matches!(
            SessionRegistry::wait(receiver).await,
            Err(ListenerError::Aborted(_))
        ));
    }

    #[tokio::test]
    async fn dropped_attempt_is_replaced_by_next_claim() {
        let registry = SessionRegistry::new();
        let Claim::Begin(sender, stale) = registry.claim().await else {
            panic!("expected to begin");
        };
        drop(sender);

        assert_eq!(registry.status().await, SessionStatus::Idle);

        let Claim::Begin(sender, fresh) = registry.claim().await else {
            panic!("abandoned attempt should not be joined");
        };
        assert_eq!(registry.status().await, SessionStatus::Starting);
        assert!(matches!(registry.claim().await, Claim::Attach(_)));

        registry
            .complete(sender, Err(ListenerError::Aborted("boom".to_string())))
            .await;
        assert!(matches!(
            SessionRegistry::wait(fresh).await,
            Err(ListenerError::Aborted(reason)) if reason == "boom"
        ));
        assert!(matches!(
            SessionRegistry::wait(stale).await,
            Err(ListenerError::Aborted(_))
        ));
    }
}
