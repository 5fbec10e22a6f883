//! Classifies failures, tracks retry counts, emits recovery actions (C2).
//!
//! Callers push work in (`report`), the engine decides what happens next
//! and hands the decision back out through explicit subscriber closures
//! rather than a global event bus (no process-global callback refs).

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{BackoffState, ErrorContext, ErrorKind, RecoveryAction, RecoveryKey, Severity};

/// Longest the in-memory error history buffer is allowed to grow (§4.2).
const HISTORY_CAPACITY: usize = 50;

/// Strategy entry for one [`ErrorKind`]: what to do on first/subsequent
/// reports, and what to do once `max_retries` is exceeded.
struct Strategy {
    /// Action to emit while `retry_count < max_retries`.
    primary: RecoveryAction,
    /// Action(s) to emit once retries are exhausted (or immediately, for
    /// terminal kinds where `max_retries == 0`).
    on_exceeded: &'static [RecoveryAction],
    /// Maximum retries before `on_exceeded` takes over.
    max_retries: u32,
    /// Base backoff delay.
    base_delay: Duration,
    /// Backoff delay ceiling.
    max_delay: Duration,
    /// Whether delay grows exponentially (`base * 2^n`) or stays flat at `base`.
    exponential: bool,
}

/// Strategy table from §4.2, encoded as a function rather than static data
/// since `Duration::from_secs` isn't const-friendly across all the fields we need.
fn strategy_for(kind: ErrorKind) -> Strategy {
    use ErrorKind::*;
    match kind {
        NamespaceConnectFailed => Strategy {
            primary: RecoveryAction::RetryConnect,
            on_exceeded: &[RecoveryAction::FallbackDegraded, RecoveryAction::ReturnToLobby],
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential: true,
        },
        WebRtcFailed => Strategy {
            primary: RecoveryAction::RetryConnect,
            on_exceeded: &[RecoveryAction::NoAction],
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            exponential: true,
        },
        AudioInitFailed => Strategy {
            primary: RecoveryAction::RetryConnect,
            on_exceeded: &[RecoveryAction::ShowUserPrompt],
            max_retries: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            exponential: true,
        },
        StateInconsistency => Strategy {
            primary: RecoveryAction::ForceReconnect,
            on_exceeded: &[RecoveryAction::ClearState],
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            exponential: true,
        },
        ApprovalTimeout => Strategy {
            primary: RecoveryAction::ReturnToLobby,
            on_exceeded: &[RecoveryAction::ReturnToLobby],
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential: false,
        },
        GracePeriodExpired => Strategy {
            primary: RecoveryAction::ForceReconnect,
            on_exceeded: &[RecoveryAction::ReturnToLobby],
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            exponential: true,
        },
        Network => Strategy {
            primary: RecoveryAction::RetryConnect,
            on_exceeded: &[RecoveryAction::ShowUserPrompt],
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential: true,
        },
        PermissionDenied => Strategy {
            primary: RecoveryAction::ShowUserPrompt,
            on_exceeded: &[RecoveryAction::ShowUserPrompt],
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential: false,
        },
        Unknown => Strategy {
            primary: RecoveryAction::ShowUserPrompt,
            on_exceeded: &[RecoveryAction::ShowUserPrompt],
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential: false,
        },
    }
}

/// Human status message for the global status feed, keyed by kind and
/// whether retries are exhausted.
fn feedback_for(kind: ErrorKind, exhausted: bool) -> (String, Severity) {
    use ErrorKind::*;
    match (kind, exhausted) {
        (ApprovalTimeout, _) => ("Approval request timed out".to_owned(), Severity::Error),
        (NamespaceConnectFailed, false) => ("Reconnecting…".to_owned(), Severity::Warning),
        (NamespaceConnectFailed, true) => {
            ("Unable to reconnect, returning to the lobby".to_owned(), Severity::Error)
        }
        (WebRtcFailed, false) => ("Reconnecting voice…".to_owned(), Severity::Info),
        (WebRtcFailed, true) => ("Voice connection unavailable".to_owned(), Severity::Warning),
        (AudioInitFailed, false) => ("Retrying audio setup…".to_owned(), Severity::Warning),
        (AudioInitFailed, true) => ("Audio failed to initialize".to_owned(), Severity::Error),
        (StateInconsistency, false) => ("Reconnecting…".to_owned(), Severity::Warning),
        (StateInconsistency, true) => ("Session state reset".to_owned(), Severity::Error),
        (GracePeriodExpired, false) => ("Attempting to reconnect…".to_owned(), Severity::Warning),
        (GracePeriodExpired, true) => {
            ("Connection lost, returning to the lobby".to_owned(), Severity::Error)
        }
        (Network, false) => ("Network issue, retrying…".to_owned(), Severity::Warning),
        (Network, true) => ("Network connection unavailable".to_owned(), Severity::Error),
        (PermissionDenied, _) => ("You don't have permission to do that".to_owned(), Severity::Error),
        (Unknown, _) => ("Something went wrong".to_owned(), Severity::Error),
    }
}

/// Decision handed to `onRecovery` subscribers: which action(s) to take,
/// with what delay, at what retry count.
#[derive(Debug, Clone)]
pub struct RecoveryDecision {
    /// Action(s) to perform, in order. Usually one; `NamespaceConnectFailed`
    /// exhaustion emits a `FallbackDegraded` immediately followed by a
    /// `ReturnToLobby`, per §4.2.
    pub actions: Vec<RecoveryAction>,
    /// Backoff delay to apply before the first action (if it retries).
    pub delay: Option<Duration>,
    /// Retry attempt number this decision represents.
    pub retry_count: u32,
    /// Whether this report was suppressed because a recovery for the same
    /// key was already active (invariant 2).
    pub suppressed: bool,
}

/// Subscriber invoked once per (non-suppressed) recovery decision.
pub type RecoveryHandler = Box<dyn Fn(&RecoveryKey, &RecoveryDecision, &ErrorContext) + Send + Sync>;
/// Subscriber invoked for the user-facing status feed.
pub type FeedbackHandler = Box<dyn Fn(&str, Severity) + Send + Sync>;

/// Classifies failures and drives recovery decisions (C2).
pub struct RecoveryEngine {
    /// Retry counters, indexed by [`RecoveryKey`].
    retry_counts: HashMap<RecoveryKey, u32>,
    /// Keys with a recovery currently in flight (invariant 2: cardinality <= 1 per key, enforced by HashSet semantics).
    active: HashMap<RecoveryKey, Instant>,
    /// Last [`HISTORY_CAPACITY`] reported errors, oldest first.
    history: VecDeque<ErrorContext>,
    /// Registered `onRecovery` subscriber.
    on_recovery: Option<RecoveryHandler>,
    /// Registered `onUserFeedback` subscriber.
    on_user_feedback: Option<FeedbackHandler>,
}

impl RecoveryEngine {
    /// Construct an engine with no subscribers yet.
    pub fn new() -> Self {
        Self {
            retry_counts: HashMap::new(),
            active: HashMap::new(),
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            on_recovery: None,
            on_user_feedback: None,
        }
    }

    /// Register the recovery-action subscriber. Replaces any previous one.
    pub fn on_recovery(&mut self, handler: RecoveryHandler) {
        self.on_recovery = Some(handler);
    }

    /// Register the user-feedback subscriber. Replaces any previous one.
    pub fn on_user_feedback(&mut self, handler: FeedbackHandler) {
        self.on_user_feedback = Some(handler);
    }

    /// Report a failure. Classifies it, updates retry/active bookkeeping,
    /// appends to history, and notifies subscribers unless a recovery for
    /// the same key is already in flight.
    pub fn report(&mut self, ctx: ErrorContext) -> RecoveryDecision {
        self.push_history(ctx.clone());

        let key = RecoveryKey::from_context(&ctx);

        if self.active.contains_key(&key) {
            debug!(?key, "recovery suppressed: one already active for this key");
            return RecoveryDecision {
                actions: vec![RecoveryAction::NoAction],
                delay: None,
                retry_count: *self.retry_counts.get(&key).unwrap_or(&0),
                suppressed: true,
            };
        }

        let strategy = strategy_for(ctx.kind);
        let count = self.retry_counts.entry(key.clone()).or_insert(0);
        let exhausted = *count >= strategy.max_retries;

        let decision = if exhausted {
            self.active.remove(&key);
            RecoveryDecision {
                actions: strategy.on_exceeded.to_vec(),
                delay: None,
                retry_count: *count,
                suppressed: false,
            }
        } else {
            let retry_count = *count;
            *count += 1;
            let delay = if strategy.exponential {
                BackoffState::exponential_delay(retry_count, strategy.base_delay, strategy.max_delay)
            } else {
                strategy.base_delay
            };
            let marks_in_flight = matches!(
                strategy.primary,
                RecoveryAction::RetryConnect | RecoveryAction::ForceReconnect
            );
            if marks_in_flight {
                self.active.insert(key.clone(), Instant::now());
            }
            RecoveryDecision {
                actions: vec![strategy.primary],
                delay: Some(delay),
                retry_count,
                suppressed: false,
            }
        };

        if let Some(handler) = &self.on_recovery {
            handler(&key, &decision, &ctx);
        }
        if let Some(handler) = &self.on_user_feedback {
            let (message, severity) = feedback_for(ctx.kind, exhausted);
            handler(&message, severity);
        }

        decision
    }

    /// Mark a recovery for `key` as successfully completed: zeroes the
    /// retry count and clears the in-flight marker (invariants (b), 2, 7).
    pub fn mark_recovered(&mut self, key: &RecoveryKey) {
        self.retry_counts.remove(key);
        self.active.remove(key);
    }

    /// Whether a recovery is currently in flight for `key`.
    pub fn is_active(&self, key: &RecoveryKey) -> bool {
        self.active.contains_key(key)
    }

    /// Whether any recovery is currently in flight, for a coarse health summary.
    pub fn has_active_recoveries(&self) -> bool {
        !self.active.is_empty()
    }

    /// Current retry count for `key` (0 if never reported).
    pub fn retry_count(&self, key: &RecoveryKey) -> u32 {
        *self.retry_counts.get(key).unwrap_or(&0)
    }

    /// Read-only view of the bounded error history (oldest first).
    pub fn history(&self) -> &VecDeque<ErrorContext> {
        &self.history
    }

    /// Number of reports retained in history.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Append to the ring buffer, evicting the oldest entry past capacity.
    fn push_history(&mut self, ctx: ErrorContext) {
        if self.history.len() >= HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(ctx);
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn ctx(kind: ErrorKind) -> ErrorContext {
        ErrorContext::new(kind, "boom").with_room("R1".into()).with_user("U1".into())
    }

    #[test]
    fn at_most_one_active_recovery_per_key() {
        let mut engine = RecoveryEngine::new();
        let first = engine.report(ctx(ErrorKind::NamespaceConnectFailed));
        assert!(!first.suppressed);
        let second = engine.report(ctx(ErrorKind::NamespaceConnectFailed));
        assert!(second.suppressed);
    }

    #[test]
    fn successful_reconnect_resets_retry_count() {
        let mut engine = RecoveryEngine::new();
        let key = RecoveryKey::new(ErrorKind::NamespaceConnectFailed, Some(&"R1".into()), Some(&"U1".into()));
        engine.report(ctx(ErrorKind::NamespaceConnectFailed));
        assert_eq!(engine.retry_count(&key), 1);
        engine.mark_recovered(&key);
        assert_eq!(engine.retry_count(&key), 0);
        assert!(!engine.is_active(&key));
    }

    #[test]
    fn namespace_connect_failed_exhausts_to_fallback_then_lobby() {
        let key = RecoveryKey::new(ErrorKind::NamespaceConnectFailed, Some(&"R1".into()), Some(&"U1".into()));
        let mut engine = RecoveryEngine::new();
        // Drive 5 retry attempts, clearing the in-flight marker between each
        // as TransportManager would after an attempt concludes (success or failure).
        for _ in 0..5 {
            let decision = engine.report(ctx(ErrorKind::NamespaceConnectFailed));
            assert_eq!(decision.actions, vec![RecoveryAction::RetryConnect]);
            engine.active.remove(&key);
        }
        let exhausted = engine.report(ctx(ErrorKind::NamespaceConnectFailed));
        assert_eq!(
            exhausted.actions,
            vec![RecoveryAction::FallbackDegraded, RecoveryAction::ReturnToLobby]
        );
    }

    #[test]
    fn approval_timeout_is_terminal_with_exact_message() {
        let mut engine = RecoveryEngine::new();
        let messages = Arc::new(Mutex::new(Vec::new()));
        let messages_clone = messages.clone();
        engine.on_user_feedback(Box::new(move |msg, sev| {
            messages_clone.lock().unwrap().push((msg.to_owned(), sev));
        }));
        let decision = engine.report(ctx(ErrorKind::ApprovalTimeout));
        assert_eq!(decision.actions, vec![RecoveryAction::ReturnToLobby]);
        let recorded = messages.lock().unwrap();
        assert_eq!(recorded[0].0, "Approval request timed out");
    }

    #[test]
    fn history_is_bounded() {
        let mut engine = RecoveryEngine::new();
        for _ in 0..(HISTORY_CAPACITY + 10) {
            engine.report(ctx(ErrorKind::Unknown));
        }
        assert_eq!(engine.history_len(), HISTORY_CAPACITY);
    }
}
