//! Error taxonomy shared by every component that reports into [`crate::recovery::RecoveryEngine`].

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::ids::{RoomId, UserId};

/// Every kind of failure the engine can classify (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Failed to open or keep open a namespace socket.
    #[error("namespace connect failed")]
    NamespaceConnectFailed,
    /// WebRTC/voice signalling failed (signalling only; media plumbing is external).
    #[error("webrtc signalling failed")]
    WebRtcFailed,
    /// Host audio context failed to initialize or resume.
    #[error("audio init failed")]
    AudioInitFailed,
    /// Local state diverged from what the transport observes (e.g. InRoom with no live socket).
    #[error("state inconsistency")]
    StateInconsistency,
    /// The 30s approval window expired with no grant/deny.
    #[error("approval timeout")]
    ApprovalTimeout,
    /// The grace-period reconnection window expired without reconnecting.
    #[error("grace period expired")]
    GracePeriodExpired,
    /// Generic network failure not otherwise classified.
    #[error("network error")]
    Network,
    /// Server rejected the action as unauthorized.
    #[error("permission denied")]
    PermissionDenied,
    /// Anything that doesn't fit the above.
    #[error("unknown error")]
    Unknown,
}

/// Severity used to pick a status-feed rendering for `onUserFeedback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Terminal/blocking failure.
    Error,
    /// Non-blocking but noteworthy.
    Warning,
    /// Informational.
    Info,
    /// Positive confirmation (e.g. reconnect succeeded).
    Success,
}

/// Recovery action RecoveryEngine asks a consumer (usually TransportManager) to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Retry the connection attempt with exponential backoff.
    RetryConnect,
    /// Keep running with reduced functionality rather than retrying further.
    FallbackDegraded,
    /// Tear down and reconnect immediately, bypassing backoff.
    ForceReconnect,
    /// Discard persisted/in-memory session state.
    ClearState,
    /// Abandon the current room/approval and return to the lobby.
    ReturnToLobby,
    /// Surface a prompt asking the user to decide (reload, retry, etc).
    ShowUserPrompt,
    /// Ask the host to reload entirely (last resort).
    ReloadHost,
    /// Nothing to do; degrade silently.
    NoAction,
}

/// Context captured for a single reported failure (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// What kind of failure this is.
    pub kind: ErrorKind,
    /// Human-readable message, suitable for logs and (filtered) user display.
    pub message: String,
    /// Stringified source error, if one was available.
    pub original_error: Option<String>,
    /// Connection state at the time of the failure, if relevant.
    pub connection_state: Option<crate::types::ConnectionState>,
    /// Room the failure pertains to, if any.
    pub room_id: Option<RoomId>,
    /// User the failure pertains to, if any.
    pub user_id: Option<UserId>,
    /// Wall-clock time the failure was reported.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Retry attempt number this report represents, if retries apply.
    pub retry_count: Option<u32>,
    /// Free-form structured extras (fallback instrument id, rejected payload, etc).
    #[serde(default)]
    pub extras: std::collections::BTreeMap<String, String>,
}

impl ErrorContext {
    /// Build a minimal context for `kind`/`message`; fill in the rest via
    /// the builder-style `with_*` methods below.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            original_error: None,
            connection_state: None,
            room_id: None,
            user_id: None,
            timestamp: chrono::Utc::now(),
            retry_count: None,
            extras: Default::default(),
        }
    }

    /// Attach the room this error pertains to.
    pub fn with_room(mut self, room_id: RoomId) -> Self {
        self.room_id = Some(room_id);
        self
    }

    /// Attach the user this error pertains to.
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Attach the connection state observed at report time.
    pub fn with_state(mut self, state: crate::types::ConnectionState) -> Self {
        self.connection_state = Some(state);
        self
    }

    /// Attach a source error's `Display` rendering.
    pub fn with_source(mut self, error: impl std::fmt::Display) -> Self {
        self.original_error = Some(error.to_string());
        self
    }

    /// Attach a free-form extra (e.g. `"fallback_instrument" -> "acoustic_grand_piano"`).
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }
}

/// Key indexing retry counts and the active-recovery set: `(kind, room, user)`
/// where an absent room/user collapses to the literal sentinels
/// `"global"` / `"anon"` rather than `Option::None`, so the key's identity
/// is defined purely in terms of those sentinels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecoveryKey {
    /// Error kind this key buckets retries for.
    pub kind: ErrorKind,
    /// Room scope, or the literal `"global"`.
    pub room: String,
    /// User scope, or the literal `"anon"`.
    pub user: String,
}

impl RecoveryKey {
    /// Build a key from optional room/user ids, substituting the literal sentinels.
    pub fn new(kind: ErrorKind, room_id: Option<&RoomId>, user_id: Option<&UserId>) -> Self {
        Self {
            kind,
            room: room_id.map(|r| r.0.clone()).unwrap_or_else(|| "global".to_owned()),
            user: user_id.map(|u| u.0.clone()).unwrap_or_else(|| "anon".to_owned()),
        }
    }

    /// Build a key directly from an [`ErrorContext`].
    pub fn from_context(ctx: &ErrorContext) -> Self {
        Self::new(ctx.kind, ctx.room_id.as_ref(), ctx.user_id.as_ref())
    }
}

/// Tracks exponential backoff state for one [`RecoveryKey`].
#[derive(Debug, Clone)]
pub struct BackoffState {
    /// Number of attempts made so far (zeroed on successful recovery).
    pub retry_count: u32,
    /// When the current/last recovery attempt started, for `activeRecoveries` bookkeeping.
    pub started_at: Instant,
}

impl BackoffState {
    /// Compute `delay = min(maxDelay, baseDelay * 2^retryCount)`.
    pub fn exponential_delay(
        retry_count: u32,
        base: std::time::Duration,
        max: std::time::Duration,
    ) -> std::time::Duration {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        base.checked_mul(factor as u32).map(|d| d.min(max)).unwrap_or(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn recovery_key_uses_sentinels_for_absent_scope() {
        let key = RecoveryKey::new(ErrorKind::Network, None, None);
        assert_eq!(key.room, "global");
        assert_eq!(key.user, "anon");
    }

    #[test]
    fn exponential_delay_is_capped() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(10);
        assert_eq!(BackoffState::exponential_delay(0, base, max), Duration::from_secs(1));
        assert_eq!(BackoffState::exponential_delay(1, base, max), Duration::from_secs(2));
        assert_eq!(BackoffState::exponential_delay(2, base, max), Duration::from_secs(4));
        assert_eq!(BackoffState::exponential_delay(10, base, max), Duration::from_secs(10));
    }
}
