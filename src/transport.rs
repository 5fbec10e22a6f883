//! Transport state machine over namespace sockets (§4.3, GLOSSARY "Namespace").
//!
//! The live socket itself is abstracted behind [`RawTransport`] so the state
//! machine can be driven by a fake in tests; the real implementation sits in
//! [`ws`] and is backed by `tokio-tungstenite`, keeping the actual network
//! device behind a trait boundary reached only through a request channel.

pub mod ws;

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::ErrorContext;
use crate::ids::{RoomId, UserId};
use crate::protocol::{Namespace, SocketFrame};
use crate::types::{ConnectionConfig, ConnectionState, Role};

/// How long a join request may sit in an approval namespace before timing out.
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the transport keeps attempting reconnection after an unexpected drop
/// before giving up and falling back to the lobby.
pub const GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Reconnection attempts made during the grace period before it's left to expire.
pub const GRACE_MAX_ATTEMPTS: u32 = 3;

/// Base delay for grace-period reconnect backoff.
pub const GRACE_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Cap for grace-period reconnect backoff.
pub const GRACE_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// How often the transport checks that its believed state matches reality.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Errors a [`RawTransport`] can surface. Kept deliberately thin: the state
/// machine only needs to know "it failed", the concrete cause lives in the
/// `source` string for logging.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    /// Wrap any displayable error as a [`TransportError`].
    pub fn from_display(err: impl std::fmt::Display) -> Self {
        Self(err.to_string())
    }
}

/// A live socket bound to one namespace. One instance is held at a time;
/// switching namespaces means closing the old one and opening a new one.
///
/// Object-safe via `async_trait` so [`TransportManager`] can hold a
/// `Box<dyn RawTransport>` without committing to a concrete socket type.
#[async_trait]
pub trait RawTransport: Send {
    /// Send a single frame, encoded as the socket.io-shaped envelope.
    async fn send(&mut self, frame: SocketFrame) -> Result<(), TransportError>;

    /// Wait for the next inbound frame, or `None` once the socket has closed
    /// with no error (a clean, expected close).
    async fn recv(&mut self) -> Option<Result<SocketFrame, TransportError>>;

    /// Close the socket. Idempotent.
    async fn close(&mut self);
}

/// Opens namespace sockets. Exists so tests can substitute a fake factory
/// without touching any networking code.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a socket bound to `namespace` at `ws_origin`.
    async fn connect(&self, ws_origin: &str, namespace: &Namespace) -> Result<Box<dyn RawTransport>, TransportError>;
}

/// State change notification: `(previous, current, config)`.
pub type StateChangeHandler = Box<dyn Fn(ConnectionState, ConnectionState, &ConnectionConfig) + Send + Sync>;

/// Transport-originated failure notification.
pub type TransportErrorHandler = Box<dyn Fn(&ErrorContext) + Send + Sync>;

/// Fired once a grace-period reconnection attempt actually succeeds.
pub type ReconnectionHandler = Box<dyn Fn(&ConnectionConfig) + Send + Sync>;

/// Bookkeeping for an in-progress grace-period reconnection sequence.
struct GraceState {
    /// When the drop that started this sequence was observed.
    started_at: Instant,
    /// Reconnection attempts made so far.
    attempts: u32,
    /// The config we're trying to get back to.
    target: ConnectionConfig,
}

/// How the caller should classify an inbound frame before handing it further
/// up the pipeline (§4.3's inbound error classification table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundClassification {
    /// A genuine fault; report `kind` to recovery.
    Fault(crate::error::ErrorKind),
    /// Carries the validation signature: never retried, never escalated.
    ValidationOnly(String),
    /// Server is rate-limiting; surfaced to the user, not a recovery trigger.
    RateLimited(String),
    /// Server rejected the action as unauthorized.
    PermissionDenied(String),
    /// An expected, non-faulty event (e.g. a clean `Kicked`).
    Intentional,
    /// Not an error at all.
    NotAFault,
}

/// Drives the four-state connection machine (§4.3) over a single live
/// [`RawTransport`] at a time. Owns the socket; nothing else is allowed to
/// reach into it.
pub struct TransportManager {
    /// Current believed state + namespace/room/role it's bound to.
    config: ConnectionConfig,
    /// The live socket, if any.
    socket: Option<Box<dyn RawTransport>>,
    /// How new sockets get opened.
    factory: Box<dyn TransportFactory>,
    /// `ws://`/`wss://` origin sockets are opened against.
    ws_origin: String,
    /// Deadline for a pending approval request.
    approval_deadline: Option<Instant>,
    /// In-progress grace-period reconnection, if a drop is being worked through.
    grace: Option<GraceState>,
    /// Last time `check_health` ran, for interval gating by callers that poll eagerly.
    last_health_check: Instant,
    /// Subscriber for state transitions.
    on_state_change: Option<StateChangeHandler>,
    /// Subscriber for transport-originated faults.
    on_error: Option<TransportErrorHandler>,
    /// Subscriber fired when a grace reconnect actually succeeds.
    on_reconnection: Option<ReconnectionHandler>,
}

impl TransportManager {
    /// Construct a manager bound to `ws_origin`, starting `Disconnected`.
    pub fn new(ws_origin: impl Into<String>, factory: Box<dyn TransportFactory>) -> Self {
        Self {
            config: ConnectionConfig::default(),
            socket: None,
            factory,
            ws_origin: ws_origin.into(),
            approval_deadline: None,
            grace: None,
            last_health_check: Instant::now(),
            on_state_change: None,
            on_error: None,
            on_reconnection: None,
        }
    }

    /// Current config snapshot.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.config.state
    }

    /// Whether a socket is currently held.
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Deadline for the active approval request, if any.
    pub fn approval_deadline(&self) -> Option<Instant> {
        self.approval_deadline
    }

    /// Deadline for the active grace-period reconnection, if any.
    pub fn grace_deadline(&self) -> Option<Instant> {
        self.grace.as_ref().map(|g| g.started_at + GRACE_PERIOD)
    }

    /// Register the state-change subscriber, replacing any previous one.
    pub fn on_state_change(&mut self, handler: StateChangeHandler) {
        self.on_state_change = Some(handler);
    }

    /// Register the error subscriber, replacing any previous one.
    pub fn on_error(&mut self, handler: TransportErrorHandler) {
        self.on_error = Some(handler);
    }

    /// Register the reconnection-success subscriber, replacing any previous one.
    pub fn on_reconnection(&mut self, handler: ReconnectionHandler) {
        self.on_reconnection = Some(handler);
    }

    fn set_config(&mut self, next: ConnectionConfig) {
        let previous = self.config.state;
        let current = next.state;
        self.config = next;
        if let Some(handler) = &self.on_state_change {
            handler(previous, current, &self.config);
        }
    }

    fn emit_error(&self, ctx: ErrorContext) {
        if let Some(handler) = &self.on_error {
            handler(&ctx);
        }
    }

    async fn open(&mut self, namespace: Namespace) -> Result<(), TransportError> {
        if let Some(mut old) = self.socket.take() {
            old.close().await;
        }
        let socket = self.factory.connect(&self.ws_origin, &namespace).await?;
        self.socket = Some(socket);
        Ok(())
    }

    /// Connect to the lobby-monitor namespace. Valid from any state; drops
    /// whatever socket was previously held (transition contract a).
    pub async fn connect_to_lobby(&mut self) -> Result<(), TransportError> {
        self.approval_deadline = None;
        self.grace = None;
        let result = self.open(Namespace::LobbyMonitor).await;
        if let Err(err) = &result {
            self.socket = None;
            self.emit_error(
                ErrorContext::new(crate::error::ErrorKind::NamespaceConnectFailed, err.0.clone())
                    .with_state(ConnectionState::Lobby),
            );
            return result;
        }
        self.set_config(ConnectionConfig {
            state: ConnectionState::Lobby,
            namespace: Some(Namespace::LobbyMonitor.path()),
            room_id: None,
            role: None,
        });
        Ok(())
    }

    /// Connect to an approval namespace and start the 30s timer (transition b).
    pub async fn connect_to_approval(&mut self, room_id: RoomId, role: Role) -> Result<(), TransportError> {
        let namespace = Namespace::Approval(room_id.clone());
        let result = self.open(namespace.clone()).await;
        if let Err(err) = &result {
            self.socket = None;
            self.emit_error(
                ErrorContext::new(crate::error::ErrorKind::NamespaceConnectFailed, err.0.clone())
                    .with_room(room_id)
                    .with_state(ConnectionState::Requesting),
            );
            return result;
        }
        self.approval_deadline = Some(Instant::now() + APPROVAL_TIMEOUT);
        self.set_config(ConnectionConfig {
            state: ConnectionState::Requesting,
            namespace: Some(namespace.path()),
            room_id: Some(room_id),
            role: Some(role),
        });
        Ok(())
    }

    /// Connect directly to a room namespace, either as a direct join or
    /// post-approval admission (transition c/d).
    pub async fn connect_to_room(&mut self, room_id: RoomId, role: Role) -> Result<(), TransportError> {
        self.approval_deadline = None;
        let namespace = Namespace::Room(room_id.clone());
        let result = self.open(namespace.clone()).await;
        if let Err(err) = &result {
            self.socket = None;
            self.emit_error(
                ErrorContext::new(crate::error::ErrorKind::NamespaceConnectFailed, err.0.clone())
                    .with_room(room_id)
                    .with_state(ConnectionState::InRoom),
            );
            return result;
        }
        self.grace = None;
        self.set_config(ConnectionConfig {
            state: ConnectionState::InRoom,
            namespace: Some(namespace.path()),
            room_id: Some(room_id),
            role: Some(role),
        });
        Ok(())
    }

    /// Reconnect directly to the last known room config, bypassing grace
    /// bookkeeping. Used when `RecoveryAction::ForceReconnect` is issued.
    pub async fn force_reconnect(&mut self) -> Result<(), TransportError> {
        let Some(room_id) = self.config.room_id.clone() else {
            return self.connect_to_lobby().await;
        };
        let role = self.config.role.unwrap_or(Role::Audience);
        self.connect_to_room(room_id, role).await
    }

    /// Cancel a pending approval request and fall back to the lobby (transition e).
    pub async fn cancel_approval_request(&mut self) -> Result<(), TransportError> {
        self.approval_deadline = None;
        self.connect_to_lobby().await
    }

    /// Leave the current room deliberately and fall back to the lobby.
    pub async fn leave_room(&mut self) -> Result<(), TransportError> {
        self.grace = None;
        self.connect_to_lobby().await
    }

    /// Drop any socket and go fully `Disconnected`. Used on shutdown.
    pub async fn disconnect(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
        self.approval_deadline = None;
        self.grace = None;
        self.set_config(ConnectionConfig::default());
    }

    /// Send a frame over the active socket, if any.
    pub async fn send(&mut self, frame: SocketFrame) -> Result<(), TransportError> {
        match &mut self.socket {
            Some(socket) => socket.send(frame).await,
            None => Err(TransportError("no active socket".into())),
        }
    }

    /// Await the next inbound frame on the active socket. Resolves to `None`
    /// forever (never completes) when there is no socket, so it's safe to
    /// `select!` against unconditionally.
    pub async fn recv(&mut self) -> Option<Result<SocketFrame, TransportError>> {
        match &mut self.socket {
            Some(socket) => socket.recv().await,
            None => std::future::pending().await,
        }
    }

    /// The approval window expired with no grant/deny. Walks back to the
    /// lobby and reports the fault.
    pub async fn on_approval_timeout(&mut self) -> Result<(), TransportError> {
        let room_id = self.config.room_id.clone();
        self.approval_deadline = None;
        self.emit_error({
            let mut ctx = ErrorContext::new(crate::error::ErrorKind::ApprovalTimeout, "approval request timed out")
                .with_state(ConnectionState::Requesting);
            if let Some(room_id) = room_id {
                ctx = ctx.with_room(room_id);
            }
            ctx
        });
        self.connect_to_lobby().await
    }

    /// An unexpected drop occurred while `InRoom`: begin (or continue) a
    /// grace-period reconnection sequence rather than bouncing to the lobby
    /// immediately.
    pub fn begin_grace(&mut self) {
        if self.grace.is_some() {
            return;
        }
        self.socket = None;
        self.grace = Some(GraceState { started_at: Instant::now(), attempts: 0, target: self.config.clone() });
    }

    /// Delay before the next grace-period reconnect attempt, or `None` if no
    /// grace sequence is active or attempts are exhausted.
    pub fn next_grace_attempt_delay(&self) -> Option<Duration> {
        let grace = self.grace.as_ref()?;
        if grace.attempts >= GRACE_MAX_ATTEMPTS {
            return None;
        }
        let exp = 2u32.saturating_pow(grace.attempts);
        Some(std::cmp::min(GRACE_BACKOFF_MAX, GRACE_BACKOFF_BASE.saturating_mul(exp.max(1))))
    }

    /// Attempt one grace-period reconnect. On success the sequence ends and
    /// `on_reconnection` fires; on failure the attempt counter advances.
    pub async fn attempt_grace_reconnect(&mut self) -> Result<(), TransportError> {
        let Some(grace) = &self.grace else {
            return Err(TransportError("no grace sequence active".into()));
        };
        let target = grace.target.clone();
        let Some(room_id) = target.room_id.clone() else {
            self.grace = None;
            return self.connect_to_lobby().await;
        };
        let role = target.role.unwrap_or(Role::Audience);
        match self.connect_to_room(room_id, role).await {
            Ok(()) => {
                self.grace = None;
                if let Some(handler) = &self.on_reconnection {
                    handler(&self.config);
                }
                Ok(())
            }
            Err(err) => {
                if let Some(grace) = &mut self.grace {
                    grace.attempts += 1;
                }
                Err(err)
            }
        }
    }

    /// The grace period elapsed without a successful reconnect. Reports the
    /// fault and clears grace bookkeeping; the caller (via `RecoveryEngine`)
    /// decides whether to retry further or return to the lobby.
    pub fn on_grace_expired(&mut self) -> ErrorContext {
        let room_id = self.grace.as_ref().and_then(|g| g.target.room_id.clone());
        self.grace = None;
        let mut ctx = ErrorContext::new(crate::error::ErrorKind::GracePeriodExpired, "grace period reconnection expired")
            .with_state(ConnectionState::InRoom);
        if let Some(room_id) = room_id {
            ctx = ctx.with_room(room_id);
        }
        self.emit_error(ctx.clone());
        ctx
    }

    /// Periodic consistency check (every [`HEALTH_CHECK_INTERVAL`]): catches
    /// a believed-connected state with no live socket, and a grace sequence
    /// that has quietly overrun its deadline.
    pub fn check_health(&mut self, now: Instant) -> Option<ErrorContext> {
        self.last_health_check = now;
        if self.config.state != ConnectionState::Disconnected && self.socket.is_none() && self.grace.is_none() {
            return Some(
                ErrorContext::new(crate::error::ErrorKind::StateInconsistency, "no live socket for believed-connected state")
                    .with_state(self.config.state),
            );
        }
        if let Some(grace) = &self.grace {
            if now.saturating_duration_since(grace.started_at) > GRACE_PERIOD + Duration::from_secs(5) {
                return Some(self.on_grace_expired());
            }
        }
        None
    }

    /// Classify an inbound message per §4.3's fault/non-fault table.
    pub fn classify_inbound(&self, msg: &crate::protocol::InboundMessage) -> InboundClassification {
        use crate::protocol::InboundMessage as M;
        match msg {
            M::ValidationError { reason } => InboundClassification::ValidationOnly(reason.clone()),
            M::RateLimited { reason } => InboundClassification::RateLimited(reason.clone()),
            M::PermissionDenied { reason } => InboundClassification::PermissionDenied(reason.clone()),
            M::Kicked { .. } | M::ApprovalDenied { .. } => InboundClassification::Intentional,
            _ => InboundClassification::NotAFault,
        }
    }

    /// A validation-signature error arrived while `InRoom`: walk back to the
    /// lobby to stop the client from looping the same rejected emission,
    /// without ever reporting it to `RecoveryEngine`.
    pub async fn handle_validation_error(&mut self) -> Result<(), TransportError> {
        if self.config.state == ConnectionState::InRoom {
            self.connect_to_lobby().await
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct FakeTransport {
        outbox: mpsc::UnboundedSender<SocketFrame>,
        inbox: mpsc::UnboundedReceiver<Result<SocketFrame, TransportError>>,
    }

    #[async_trait]
    impl RawTransport for FakeTransport {
        async fn send(&mut self, frame: SocketFrame) -> Result<(), TransportError> {
            self.outbox.send(frame).map_err(|_| TransportError("closed".into()))
        }

        async fn recv(&mut self) -> Option<Result<SocketFrame, TransportError>> {
            self.inbox.recv().await
        }

        async fn close(&mut self) {
            self.inbox.close();
        }
    }

    struct FakeFactory {
        fail_next: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        async fn connect(&self, _ws_origin: &str, _namespace: &Namespace) -> Result<Box<dyn RawTransport>, TransportError> {
            if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(TransportError("simulated failure".into()));
            }
            let (out_tx, _out_rx) = mpsc::unbounded_channel();
            let (_in_tx, in_rx) = mpsc::unbounded_channel();
            Ok(Box::new(FakeTransport { outbox: out_tx, inbox: in_rx }))
        }
    }

    fn factory(fail_next: bool) -> Box<dyn TransportFactory> {
        Box::new(FakeFactory { fail_next: std::sync::atomic::AtomicBool::new(fail_next) })
    }

    #[tokio::test]
    async fn connect_to_lobby_transitions_state() {
        let mut transport = TransportManager::new("ws://localhost:3001", factory(false));
        transport.connect_to_lobby().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Lobby);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn connect_to_approval_sets_deadline() {
        let mut transport = TransportManager::new("ws://localhost:3001", factory(false));
        transport.connect_to_approval(RoomId::from("room-1"), Role::BandMember).await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Requesting);
        assert!(transport.approval_deadline().is_some());
    }

    #[tokio::test]
    async fn approval_timeout_walks_back_to_lobby() {
        let mut transport = TransportManager::new("ws://localhost:3001", factory(false));
        transport.connect_to_approval(RoomId::from("room-1"), Role::BandMember).await.unwrap();
        transport.on_approval_timeout().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Lobby);
        assert!(transport.approval_deadline().is_none());
    }

    #[tokio::test]
    async fn failed_connect_reports_error_and_stays_disconnected() {
        let mut transport = TransportManager::new("ws://localhost:3001", factory(true));
        let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
        let errors_clone = errors.clone();
        transport.on_error(Box::new(move |ctx| errors_clone.lock().unwrap().push(ctx.kind)));
        let err = transport.connect_to_lobby().await;
        assert!(err.is_err());
        assert!(!transport.is_connected());
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn grace_sequence_succeeds_and_fires_reconnection() {
        let mut transport = TransportManager::new("ws://localhost:3001", factory(false));
        transport.connect_to_room(RoomId::from("room-1"), Role::BandMember).await.unwrap();
        transport.begin_grace();
        assert!(!transport.is_connected());
        assert!(transport.grace_deadline().is_some());
        let reconnected = Arc::new(std::sync::Mutex::new(false));
        let reconnected_clone = reconnected.clone();
        transport.on_reconnection(Box::new(move |_| *reconnected_clone.lock().unwrap() = true));
        transport.attempt_grace_reconnect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::InRoom);
        assert!(*reconnected.lock().unwrap());
        assert!(transport.grace_deadline().is_none());
    }

    #[tokio::test]
    async fn health_check_flags_inconsistent_state() {
        let mut transport = TransportManager::new("ws://localhost:3001", factory(false));
        transport.connect_to_room(RoomId::from("room-1"), Role::BandMember).await.unwrap();
        transport.socket = None;
        let ctx = transport.check_health(Instant::now());
        assert!(ctx.is_some());
        assert_eq!(ctx.unwrap().kind, crate::error::ErrorKind::StateInconsistency);
    }

    #[test]
    fn classifies_validation_error_as_validation_only() {
        let transport = TransportManager::new("ws://localhost:3001", factory(false));
        let msg = crate::protocol::InboundMessage::ValidationError { reason: "Invalid data format: bad note".into() };
        assert_eq!(
            transport.classify_inbound(&msg),
            InboundClassification::ValidationOnly("Invalid data format: bad note".into())
        );
    }
}
