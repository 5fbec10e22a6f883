//! Single entry point for UI and host audio (§4.8).
//!
//! Split into a cheap, cloneable [`SessionHandle`] (holds an action sender)
//! and an owned [`SessionFacade`] engine that runs the cooperative `select!`
//! loop described in §5 as the task actually driving the state machine. The
//! handle is what a host actually keeps around; the engine is moved into a
//! spawned task via [`SessionFacade::run`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::audio_manager::{AudioManager, InstrumentCompatibility, InstrumentEngine};
use crate::daw::collab::DAWCollab;
use crate::daw::entities::{EffectChain, Marker, Note, Region, Track};
use crate::daw::lock::LockTarget;
use crate::error::{ErrorContext, Severity};
use crate::ids::{EffectChainId, InstrumentId, MarkerId, NoteId, RegionId, RoomId, TrackId, UserId};
use crate::pipeline::{EventPipeline, PipelineAction};
use crate::protocol::{InboundMessage, NoteEventType, OutboundMessage};
use crate::record::{RecordCoord, RecordingKind, StartRecording};
use crate::recovery::RecoveryEngine;
use crate::session_store::{RoomSession, SessionStore};
use crate::transport::{InboundClassification, TransportFactory, TransportManager};
use crate::types::{ConnectionState, Role, User};

/// Error surfaced by [`SessionHandle`] calls made after the engine has shut down.
#[derive(Debug, Clone, thiserror::Error)]
#[error("session engine is no longer running")]
pub struct EngineGone;

/// Outward-facing, strongly typed notification. Consolidates what would be
/// many individually-named callbacks (`onNoteReceived`, `onInstrumentChanged`,
/// `onRoomOwnerScaleChanged`, ...) into one enum delivered through a single
/// subscriber slot, following the single-callback-slot shape already
/// established by [`crate::recovery::RecoveryEngine`]'s handlers.
#[derive(Debug, Clone)]
pub enum FacadeEvent {
    /// The connection state machine transitioned.
    StateChanged {
        /// State before the transition.
        previous: ConnectionState,
        /// State after the transition.
        current: ConnectionState,
    },
    /// Full room snapshot arrived on join.
    RoomJoined {
        /// Room joined.
        room_id: RoomId,
        /// Members present at join time.
        users: Vec<User>,
    },
    /// A user joined after the initial snapshot.
    UserJoined(User),
    /// A user left the room.
    UserLeft(UserId),
    /// The local user was removed by a band member.
    Kicked {
        /// Reason given, if any.
        reason: Option<String>,
    },
    /// A join request was granted.
    ApprovalGranted(RoomId),
    /// A join request was denied.
    ApprovalDenied {
        /// Room the request targeted.
        room_id: RoomId,
        /// Reason given, if any.
        reason: Option<String>,
    },
    /// The approval request is still pending.
    ApprovalPending(RoomId),
    /// Another user requested to join the room (band members only); the host
    /// should present it and reply via [`SessionHandle::respond_to_join_request`].
    IncomingJoinRequest {
        /// Room the request targets.
        room_id: RoomId,
        /// Requesting user.
        user_id: UserId,
        /// Requested display name.
        username: String,
    },
    /// A remote note on/off/sustain event.
    NoteReceived {
        /// Originating user.
        user_id: UserId,
        /// Pitches involved.
        notes: Vec<u8>,
        /// Velocity.
        velocity: u8,
        /// Event transition.
        event_type: NoteEventType,
    },
    /// A remote user's instrument changed.
    InstrumentChanged {
        /// User whose instrument changed.
        user_id: UserId,
        /// New instrument.
        instrument: InstrumentId,
    },
    /// A remote user's live synth parameters changed.
    SynthParamsChanged {
        /// User whose parameters changed.
        user_id: UserId,
        /// Opaque parameter blob.
        params: serde_json::Value,
    },
    /// A remote user's live effect chain changed.
    EffectsChainChanged {
        /// User whose chain changed.
        user_id: UserId,
        /// Opaque chain description.
        chains: serde_json::Value,
    },
    /// The room's shared scale changed.
    RoomOwnerScaleChanged {
        /// New root note.
        root_note: String,
        /// New scale name.
        scale: String,
    },
    /// A chat message arrived.
    ChatMessage {
        /// Sender.
        user_id: UserId,
        /// Message text.
        message: String,
    },
    /// A lock's holder changed.
    LockChanged {
        /// Entity affected.
        target: LockTarget,
        /// New holder, if any.
        holder: Option<UserId>,
    },
    /// The full DAW snapshot was (re)applied.
    DawSnapshotApplied,
    /// A remote user's recording indicator changed.
    RemoteRecordingStateChanged {
        /// User whose state changed.
        user_id: UserId,
        /// Whether they're now recording.
        recording: bool,
    },
    /// A status message for a global feed (§7): concise, category-appropriate,
    /// with severity driving auto-hide vs. persistence in the UI.
    StatusMessage {
        /// Message text.
        message: String,
        /// Severity, driving display persistence.
        severity: Severity,
    },
    /// A transport-or-audio-originated fault was reported to recovery.
    ErrorReported(ErrorContext),
}

/// Snapshot of engine health for host UIs (§4.8, extended per the
/// recovery-history-length addition).
#[derive(Debug, Clone, Copy)]
pub struct HealthSnapshot {
    /// Whether the engine currently believes it's in a healthy state.
    pub is_healthy: bool,
    /// Total faults reported to recovery this session.
    pub total_errors: u32,
    /// Whether any RecoveryKey currently has an active (unresolved) recovery.
    pub has_active_recoveries: bool,
    /// Number of entries in the bounded recovery history buffer.
    pub recovery_history_len: usize,
}

/// Host seam for the audio-clip upload HTTP surface (§6): entirely outside
/// this crate's networking scope (no HTTP client dependency is added here).
#[async_trait]
pub trait AudioUploader: Send + Sync {
    /// Upload a captured audio recording, returning its url and duration (in beats).
    async fn upload(
        &self,
        room_id: &RoomId,
        region_id: &RegionId,
        track_id: &TrackId,
        user_id: &UserId,
        bytes: Vec<u8>,
    ) -> Result<(String, f64), String>;
}

/// Host-issued commands, sent over the handle/engine channel. One variant
/// per public operation a UI can invoke; DAW mutation commands mirror
/// `DAWCollab`'s own method surface directly.
enum Command {
    ConnectToLobby,
    RequestJoin { room_id: RoomId, username: String, role: Role, respond_to: oneshot::Sender<Result<(), String>> },
    CancelJoinRequest,
    ConnectToRoomDirect { room_id: RoomId, role: Role, respond_to: oneshot::Sender<Result<(), String>> },
    RespondToJoinRequest { user_id: UserId, approve: bool },
    LeaveRoom,
    PlayNote { notes: Vec<u8>, velocity: u8, instrument: InstrumentId, category: String, event_type: NoteEventType, is_key_held: Option<bool> },
    ChangeInstrument { instrument: InstrumentId, category: String },
    StopAllNotes { instrument: InstrumentId, category: String },
    UpdateSynthParams { params: serde_json::Value },
    UpdateEffectsChain { chains: serde_json::Value },
    ChatMessage { message: String },
    RoomOwnerScaleChange { root_note: String, scale: String },
    LockAcquire { target: LockTarget },
    LockRelease { target: LockTarget },
    CreateTrack { track: Track },
    UpdateTrack { track: Track },
    DeleteTrack { track_id: TrackId },
    CreateRegion { region: Region },
    UpdateRegion { region: Region },
    DeleteRegion { region_id: RegionId },
    AddNote { region_id: RegionId, note: Note },
    UpdateNote { region_id: RegionId, note: Note },
    DeleteNote { region_id: RegionId, note_id: NoteId },
    UpsertMarker { marker: Marker },
    DeleteMarker { marker_id: MarkerId },
    UpsertEffectChain { chain: EffectChain },
    DeleteEffectChain { chain_id: EffectChainId },
    DragStart { region_ids: Vec<RegionId>, respond_to: oneshot::Sender<Result<(), String>> },
    DragPreview { region_id: RegionId, new_start: f64, target_track: TrackId },
    DragEnd,
    DragAbort,
    SplitRegion { region_id: RegionId, position: f64, respond_to: oneshot::Sender<Result<(RegionId, RegionId), String>> },
    HeadResize { region_id: RegionId, delta: f64, respond_to: oneshot::Sender<Result<(), String>> },
    StartRecording { request: StartRecording },
    StopRecording { upload: Option<Vec<u8>>, respond_to: oneshot::Sender<Option<Region>> },
    CancelRecording,
    ResumeAudioOnInteraction,
    Health { respond_to: oneshot::Sender<HealthSnapshot> },
    Shutdown,
}

/// Cheap, `Clone`-able reference to a running [`SessionFacade`] engine.
/// All mutating calls enqueue a [`Command`] and, where a result matters,
/// await a `oneshot` reply — the engine itself never runs two commands
/// concurrently (§5 non-reentrance).
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Connect to the lobby-monitor namespace.
    pub fn connect_to_lobby(&self) -> Result<(), EngineGone> {
        self.commands.send(Command::ConnectToLobby).map_err(|_| EngineGone)
    }

    /// Request to join a room. Validates `room_id` (must parse as a UUID)
    /// and `username` (must be non-empty) before reaching the socket (§4.8).
    pub async fn request_join(&self, room_id: RoomId, username: String, role: Role) -> Result<(), String> {
        validate_join(&room_id, &username)?;
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::RequestJoin { room_id, username, role, respond_to: tx })
            .map_err(|_| EngineGone.to_string())?;
        rx.await.map_err(|_| EngineGone.to_string())?
    }

    /// Connect directly to a room namespace without an approval handshake.
    pub async fn connect_to_room_direct(&self, room_id: RoomId, role: Role) -> Result<(), String> {
        validate_join(&room_id, "_")?;
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ConnectToRoomDirect { room_id, role, respond_to: tx })
            .map_err(|_| EngineGone.to_string())?;
        rx.await.map_err(|_| EngineGone.to_string())?
    }

    /// Cancel a pending approval request and fall back to the lobby.
    pub fn cancel_join_request(&self) -> Result<(), EngineGone> {
        self.commands.send(Command::CancelJoinRequest).map_err(|_| EngineGone)
    }

    /// Grant or deny a pending join request (band members only): sends
    /// `approve_member`/`reject_member` over the room socket.
    pub fn respond_to_join_request(&self, user_id: UserId, approve: bool) -> Result<(), EngineGone> {
        self.commands.send(Command::RespondToJoinRequest { user_id, approve }).map_err(|_| EngineGone)
    }

    /// Leave the current room deliberately.
    pub fn leave_room(&self) -> Result<(), EngineGone> {
        self.commands.send(Command::LeaveRoom).map_err(|_| EngineGone)
    }

    /// Emit a note on/off/sustain event for the local user's active instrument.
    pub fn play_note(
        &self,
        notes: Vec<u8>,
        velocity: u8,
        instrument: InstrumentId,
        category: String,
        event_type: NoteEventType,
        is_key_held: Option<bool>,
    ) -> Result<(), EngineGone> {
        self.commands
            .send(Command::PlayNote { notes, velocity, instrument, category, event_type, is_key_held })
            .map_err(|_| EngineGone)
    }

    /// Switch the local user's active instrument.
    pub fn change_instrument(&self, instrument: InstrumentId, category: String) -> Result<(), EngineGone> {
        self.commands.send(Command::ChangeInstrument { instrument, category }).map_err(|_| EngineGone)
    }

    /// Silence every currently-sounding note for an instrument.
    pub fn stop_all_notes(&self, instrument: InstrumentId, category: String) -> Result<(), EngineGone> {
        self.commands.send(Command::StopAllNotes { instrument, category }).map_err(|_| EngineGone)
    }

    /// Stream a live synth parameter update (throttled 10ms).
    pub fn update_synth_params(&self, params: serde_json::Value) -> Result<(), EngineGone> {
        self.commands.send(Command::UpdateSynthParams { params }).map_err(|_| EngineGone)
    }

    /// Stream a live effects chain update (throttled 200ms).
    pub fn update_effects_chain(&self, chains: serde_json::Value) -> Result<(), EngineGone> {
        self.commands.send(Command::UpdateEffectsChain { chains }).map_err(|_| EngineGone)
    }

    /// Broadcast a chat message (batched).
    pub fn chat_message(&self, message: String) -> Result<(), EngineGone> {
        self.commands.send(Command::ChatMessage { message }).map_err(|_| EngineGone)
    }

    /// Change the room's shared root note/scale.
    pub fn room_owner_scale_change(&self, root_note: String, scale: String) -> Result<(), EngineGone> {
        self.commands.send(Command::RoomOwnerScaleChange { root_note, scale }).map_err(|_| EngineGone)
    }

    /// Acquire an edit lock on a DAW entity.
    pub fn lock_acquire(&self, target: LockTarget) -> Result<(), EngineGone> {
        self.commands.send(Command::LockAcquire { target }).map_err(|_| EngineGone)
    }

    /// Release a previously claimed lock.
    pub fn lock_release(&self, target: LockTarget) -> Result<(), EngineGone> {
        self.commands.send(Command::LockRelease { target }).map_err(|_| EngineGone)
    }

    /// Create a track, locally and over the wire.
    pub fn create_track(&self, track: Track) -> Result<(), EngineGone> {
        self.commands.send(Command::CreateTrack { track }).map_err(|_| EngineGone)
    }

    /// Update an existing track.
    pub fn update_track(&self, track: Track) -> Result<(), EngineGone> {
        self.commands.send(Command::UpdateTrack { track }).map_err(|_| EngineGone)
    }

    /// Delete a track.
    pub fn delete_track(&self, track_id: TrackId) -> Result<(), EngineGone> {
        self.commands.send(Command::DeleteTrack { track_id }).map_err(|_| EngineGone)
    }

    /// Create a region.
    pub fn create_region(&self, region: Region) -> Result<(), EngineGone> {
        self.commands.send(Command::CreateRegion { region }).map_err(|_| EngineGone)
    }

    /// Update a region directly (not a drag/resize stream).
    pub fn update_region(&self, region: Region) -> Result<(), EngineGone> {
        self.commands.send(Command::UpdateRegion { region }).map_err(|_| EngineGone)
    }

    /// Delete a region.
    pub fn delete_region(&self, region_id: RegionId) -> Result<(), EngineGone> {
        self.commands.send(Command::DeleteRegion { region_id }).map_err(|_| EngineGone)
    }

    /// Add a note to a MIDI region.
    pub fn add_note(&self, region_id: RegionId, note: Note) -> Result<(), EngineGone> {
        self.commands.send(Command::AddNote { region_id, note }).map_err(|_| EngineGone)
    }

    /// Update a note within a MIDI region.
    pub fn update_note(&self, region_id: RegionId, note: Note) -> Result<(), EngineGone> {
        self.commands.send(Command::UpdateNote { region_id, note }).map_err(|_| EngineGone)
    }

    /// Delete a note from a MIDI region.
    pub fn delete_note(&self, region_id: RegionId, note_id: NoteId) -> Result<(), EngineGone> {
        self.commands.send(Command::DeleteNote { region_id, note_id }).map_err(|_| EngineGone)
    }

    /// Create or update a marker.
    pub fn upsert_marker(&self, marker: Marker) -> Result<(), EngineGone> {
        self.commands.send(Command::UpsertMarker { marker }).map_err(|_| EngineGone)
    }

    /// Delete a marker.
    pub fn delete_marker(&self, marker_id: MarkerId) -> Result<(), EngineGone> {
        self.commands.send(Command::DeleteMarker { marker_id }).map_err(|_| EngineGone)
    }

    /// Create or update a persisted effect chain.
    pub fn upsert_effect_chain(&self, chain: EffectChain) -> Result<(), EngineGone> {
        self.commands.send(Command::UpsertEffectChain { chain }).map_err(|_| EngineGone)
    }

    /// Delete a persisted effect chain.
    pub fn delete_effect_chain(&self, chain_id: EffectChainId) -> Result<(), EngineGone> {
        self.commands.send(Command::DeleteEffectChain { chain_id }).map_err(|_| EngineGone)
    }

    /// Begin an atomic multi-region drag, acquiring a lock on every region.
    pub async fn drag_start(&self, region_ids: Vec<RegionId>) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::DragStart { region_ids, respond_to: tx }).map_err(|_| EngineGone.to_string())?;
        rx.await.map_err(|_| EngineGone.to_string())?
    }

    /// Stream an in-progress drag/resize preview.
    pub fn drag_preview(&self, region_id: RegionId, new_start: f64, target_track: TrackId) -> Result<(), EngineGone> {
        self.commands.send(Command::DragPreview { region_id, new_start, target_track }).map_err(|_| EngineGone)
    }

    /// Commit the in-progress drag and release its locks.
    pub fn drag_end(&self) -> Result<(), EngineGone> {
        self.commands.send(Command::DragEnd).map_err(|_| EngineGone)
    }

    /// Abort the in-progress drag without committing.
    pub fn drag_abort(&self) -> Result<(), EngineGone> {
        self.commands.send(Command::DragAbort).map_err(|_| EngineGone)
    }

    /// Split a region at `position`, returning the left/right ids.
    pub async fn split_region(&self, region_id: RegionId, position: f64) -> Result<(RegionId, RegionId), String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SplitRegion { region_id, position, respond_to: tx })
            .map_err(|_| EngineGone.to_string())?;
        rx.await.map_err(|_| EngineGone.to_string())?
    }

    /// Resize a region's head by `delta` beats.
    pub async fn head_resize(&self, region_id: RegionId, delta: f64) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::HeadResize { region_id, delta, respond_to: tx }).map_err(|_| EngineGone.to_string())?;
        rx.await.map_err(|_| EngineGone.to_string())?
    }

    /// Begin local recording.
    pub fn start_recording(&self, request: StartRecording) -> Result<(), EngineGone> {
        self.commands.send(Command::StartRecording { request }).map_err(|_| EngineGone)
    }

    /// Stop local recording, uploading `upload` bytes first for audio recordings.
    pub async fn stop_recording(&self, upload: Option<Vec<u8>>) -> Result<Option<Region>, EngineGone> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::StopRecording { upload, respond_to: tx }).map_err(|_| EngineGone)?;
        rx.await.map_err(|_| EngineGone)
    }

    /// Discard the in-progress recording without emitting a region.
    pub fn cancel_recording(&self) -> Result<(), EngineGone> {
        self.commands.send(Command::CancelRecording).map_err(|_| EngineGone)
    }

    /// Resume the audio context in response to a user gesture.
    pub fn resume_audio_on_interaction(&self) -> Result<(), EngineGone> {
        self.commands.send(Command::ResumeAudioOnInteraction).map_err(|_| EngineGone)
    }

    /// Query current health (§4.8).
    pub async fn health(&self) -> Result<HealthSnapshot, EngineGone> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Health { respond_to: tx }).map_err(|_| EngineGone)?;
        rx.await.map_err(|_| EngineGone)
    }

    /// Tear the engine down: cancels every timer, drops the socket, clears
    /// the pending-operations queue (§5 cancellation contract).
    pub fn shutdown(&self) -> Result<(), EngineGone> {
        self.commands.send(Command::Shutdown).map_err(|_| EngineGone)
    }
}

fn validate_join(room_id: &RoomId, username: &str) -> Result<(), String> {
    if uuid::Uuid::parse_str(&room_id.0).is_err() {
        return Err(format!("room id {:?} is not a valid UUID", room_id.0));
    }
    if username.trim().is_empty() {
        return Err("username must not be empty".to_owned());
    }
    Ok(())
}

/// Signal fed from component callbacks back into the engine's own loop,
/// bridging the synchronous `Fn` callback boundary to the async follow-up
/// work (persisting sessions, reporting to recovery, acting on decisions).
enum EngineSignal {
    StateChanged { previous: ConnectionState, current: ConnectionState, config: crate::types::ConnectionConfig },
    TransportFault(ErrorContext),
    Reconnected,
}

/// The owned engine: every component, wired together, driving one
/// cooperative `select!` loop (§5).
pub struct SessionFacade {
    local_user: UserId,
    local_username: String,
    transport: TransportManager,
    pipeline: EventPipeline,
    recovery: RecoveryEngine,
    audio: AudioManager,
    daw: DAWCollab,
    record: RecordCoord,
    session_store: SessionStore,
    uploader: Arc<dyn AudioUploader>,
    commands: mpsc::UnboundedReceiver<Command>,
    signals_tx: mpsc::UnboundedSender<EngineSignal>,
    signals_rx: mpsc::UnboundedReceiver<EngineSignal>,
    on_event: Option<Box<dyn Fn(FacadeEvent) + Send + Sync>>,
    total_errors: Arc<Mutex<u32>>,
}

impl SessionFacade {
    /// Construct the engine and its handle. `ws_origin` is the `ws(s)://`
    /// origin namespace sockets are opened against (see [`crate::config`]).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_user: UserId,
        local_username: String,
        ws_origin: impl Into<String>,
        factory: Box<dyn TransportFactory>,
        engine: Arc<dyn InstrumentEngine>,
        compatibility: Arc<dyn InstrumentCompatibility>,
        uploader: Arc<dyn AudioUploader>,
        session_store: SessionStore,
    ) -> (Self, SessionHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let mut transport = TransportManager::new(ws_origin, factory);
        let sig = signals_tx.clone();
        transport.on_state_change(Box::new(move |previous, current, config| {
            let _ = sig.send(EngineSignal::StateChanged { previous, current, config: config.clone() });
        }));
        let sig = signals_tx.clone();
        transport.on_error(Box::new(move |ctx| {
            let _ = sig.send(EngineSignal::TransportFault(ctx.clone()));
        }));
        let sig = signals_tx.clone();
        transport.on_reconnection(Box::new(move |_config| {
            let _ = sig.send(EngineSignal::Reconnected);
        }));

        let engine_struct = Self {
            local_user: local_user.clone(),
            local_username: local_username.clone(),
            transport,
            pipeline: EventPipeline::new(local_user.clone()),
            recovery: RecoveryEngine::new(),
            audio: AudioManager::new(engine, compatibility),
            daw: DAWCollab::new(local_user.clone(), local_username.clone()),
            record: RecordCoord::new(),
            session_store,
            uploader,
            commands: command_rx,
            signals_tx,
            signals_rx,
            on_event: None,
            total_errors: Arc::new(Mutex::new(0)),
        };
        (engine_struct, SessionHandle { commands: command_tx })
    }

    /// Register the single event subscriber, replacing any previous one.
    pub fn on_event(&mut self, handler: Box<dyn Fn(FacadeEvent) + Send + Sync>) {
        self.on_event = Some(handler);
    }

    fn emit(&self, event: FacadeEvent) {
        if let Some(handler) = &self.on_event {
            handler(event);
        }
    }

    async fn send_immediate(&mut self, msg: OutboundMessage) {
        let action = self.pipeline.submit(msg, Instant::now());
        if let PipelineAction::Send(frame) = action {
            // Fire-and-forget: a dropped socket surfaces through the health
            // check / recv loop, not through this call path.
            let _ = self.transport.send(frame).await;
        }
    }

    async fn send_stream(&mut self, msg: OutboundMessage) {
        let action = self.pipeline.submit_stream(msg, Instant::now());
        if let PipelineAction::Send(frame) = action {
            self.send_frame_now(frame).await;
        }
    }

    async fn send_frame_now(&mut self, frame: crate::protocol::SocketFrame) {
        let _ = self.transport.send(frame).await;
    }

    fn persist_session(&self) {
        let config = self.transport.config();
        if config.state != ConnectionState::InRoom {
            return;
        }
        let Some(room_id) = config.room_id.clone() else { return };
        self.session_store.store(RoomSession {
            room_id,
            role: config.role.unwrap_or(Role::Audience),
            user_id: self.local_user.clone(),
            username: self.local_username.clone(),
            instrument_id: None,
            instrument_category: None,
            synth_params: None,
            stored_at: chrono::Utc::now(),
        });
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::ConnectToLobby => {
                let _ = self.transport.connect_to_lobby().await;
            }
            Command::RequestJoin { room_id, username, role, respond_to } => {
                self.local_username = username;
                let result = self.transport.connect_to_approval(room_id, role).await.map_err(|e| e.0);
                let _ = respond_to.send(result);
            }
            Command::ConnectToRoomDirect { room_id, role, respond_to } => {
                let result = self.transport.connect_to_room(room_id.clone(), role).await.map_err(|e| e.0);
                if result.is_ok() {
                    self.persist_session();
                    self.send_immediate(OutboundMessage::JoinRoom {
                        room_id,
                        username: self.local_username.clone(),
                        user_id: self.local_user.clone(),
                        role,
                    })
                    .await;
                }
                let _ = respond_to.send(result);
            }
            Command::RespondToJoinRequest { user_id, approve } => {
                self.send_immediate(OutboundMessage::RespondToJoinRequest { user_id, approve }).await;
            }
            Command::CancelJoinRequest => {
                let _ = self.transport.cancel_approval_request().await;
            }
            Command::LeaveRoom => {
                self.send_immediate(OutboundMessage::LeaveRoom { is_intended_leave: true }).await;
                let _ = self.transport.leave_room().await;
                self.session_store.clear();
            }
            Command::PlayNote { notes, velocity, instrument, category, event_type, is_key_held } => {
                self.send_immediate(OutboundMessage::PlayNote { notes, velocity, instrument, category, event_type, is_key_held }).await;
            }
            Command::ChangeInstrument { instrument, category } => {
                self.send_immediate(OutboundMessage::ChangeInstrument { instrument, category }).await;
            }
            Command::StopAllNotes { instrument, category } => {
                self.send_immediate(OutboundMessage::StopAllNotes { instrument, category }).await;
            }
            Command::UpdateSynthParams { params } => {
                self.send_stream(OutboundMessage::UpdateSynthParams { params }).await;
            }
            Command::UpdateEffectsChain { chains } => {
                self.send_stream(OutboundMessage::UpdateEffectsChain { chains }).await;
            }
            Command::ChatMessage { message } => {
                let room_id = self.transport.config().room_id.clone().unwrap_or_else(|| RoomId::from(""));
                self.send_stream(OutboundMessage::ChatMessage { room_id, message }).await;
            }
            Command::RoomOwnerScaleChange { root_note, scale } => {
                self.send_immediate(OutboundMessage::RoomOwnerScaleChange { root_note, scale }).await;
            }
            Command::LockAcquire { target } => {
                if self.daw.acquire_lock(target, Instant::now()).is_ok() {
                    self.send_immediate(OutboundMessage::LockAcquire { element_id: target.into() }).await;
                }
            }
            Command::LockRelease { target } => {
                if self.daw.release_lock(target).is_ok() {
                    self.send_immediate(OutboundMessage::LockRelease { element_id: target.into() }).await;
                }
            }
            Command::CreateTrack { track } => {
                self.daw.add_track(track.clone());
                self.send_immediate(OutboundMessage::CreateTrack { track }).await;
            }
            Command::UpdateTrack { track } => {
                if self.daw.update_track(track.clone()).is_ok() {
                    self.send_immediate(OutboundMessage::UpdateTrack { track }).await;
                }
            }
            Command::DeleteTrack { track_id } => {
                self.daw.delete_track(track_id.clone());
                self.send_immediate(OutboundMessage::DeleteTrack { track_id }).await;
            }
            Command::CreateRegion { region } => {
                if self.daw.add_region(region.clone()).is_ok() {
                    self.send_immediate(OutboundMessage::CreateRegion { region }).await;
                }
            }
            Command::UpdateRegion { region } => {
                if self.daw.update_region(region.clone()).is_ok() {
                    self.send_immediate(OutboundMessage::UpdateRegion { region }).await;
                }
            }
            Command::DeleteRegion { region_id } => {
                self.daw.delete_region(region_id.clone());
                self.send_immediate(OutboundMessage::DeleteRegion { region_id }).await;
            }
            Command::AddNote { region_id, note } => {
                if self.daw.add_note(region_id.clone(), note.clone()).is_ok() {
                    self.send_immediate(OutboundMessage::AddNote { region_id, note }).await;
                }
            }
            Command::UpdateNote { region_id, note } => {
                if self.daw.update_note(region_id.clone(), note.clone()).is_ok() {
                    self.send_immediate(OutboundMessage::UpdateNote { region_id, note }).await;
                }
            }
            Command::DeleteNote { region_id, note_id } => {
                if self.daw.delete_note(region_id.clone(), note_id).is_ok() {
                    self.send_immediate(OutboundMessage::DeleteNote { region_id, note_id }).await;
                }
            }
            Command::UpsertMarker { marker } => {
                self.daw.upsert_marker(marker.clone());
                self.send_immediate(OutboundMessage::UpsertMarker { marker }).await;
            }
            Command::DeleteMarker { marker_id } => {
                self.daw.delete_marker(marker_id.clone());
                self.send_immediate(OutboundMessage::DeleteMarker { marker_id }).await;
            }
            Command::UpsertEffectChain { chain } => {
                self.daw.upsert_effect_chain(chain.clone());
                self.send_immediate(OutboundMessage::UpsertEffectChain { chain }).await;
            }
            Command::DeleteEffectChain { chain_id } => {
                self.daw.delete_effect_chain(chain_id.clone());
                self.send_immediate(OutboundMessage::DeleteEffectChain { chain_id }).await;
            }
            Command::DragStart { region_ids, respond_to } => {
                let result = self.daw.drag_start(region_ids, Instant::now()).map_err(|e| e.to_string());
                let _ = respond_to.send(result);
            }
            Command::DragPreview { region_id, new_start, target_track } => {
                self.daw.drag_preview(region_id.clone(), new_start, target_track.clone());
                if let Some(region) = self.daw.region(region_id.clone()).cloned() {
                    self.send_stream(OutboundMessage::RegionDragUpdate { region_id, region }).await;
                }
            }
            Command::DragEnd => {
                let region_ids = self.daw.drag_end();
                for region_id in region_ids {
                    if let Some(region) = self.daw.region(region_id.clone()).cloned() {
                        self.send_immediate(OutboundMessage::RegionDragEnd { region_id, region }).await;
                    }
                }
            }
            Command::DragAbort => {
                self.daw.drag_abort();
            }
            Command::SplitRegion { region_id, position, respond_to } => {
                let result = self.daw.split_region(region_id, position).map_err(|e| e.to_string());
                if let Ok((left, right)) = &result {
                    if let Some(region) = self.daw.region(left.clone()).cloned() {
                        self.send_immediate(OutboundMessage::UpdateRegion { region }).await;
                    }
                    if let Some(region) = self.daw.region(right.clone()).cloned() {
                        self.send_immediate(OutboundMessage::CreateRegion { region }).await;
                    }
                }
                let _ = respond_to.send(result);
            }
            Command::HeadResize { region_id, delta, respond_to } => {
                let result = self.daw.head_resize(region_id.clone(), delta).map_err(|e| e.to_string());
                if result.is_ok() {
                    if let Some(region) = self.daw.region(region_id).cloned() {
                        self.send_immediate(OutboundMessage::UpdateRegion { region }).await;
                    }
                }
                let _ = respond_to.send(result);
            }
            Command::StartRecording { request } => {
                self.record.start(request);
                self.send_immediate(OutboundMessage::RecordingStateChanged { recording: true }).await;
            }
            Command::StopRecording { upload, respond_to } => {
                let asset = if let Some(bytes) = upload {
                    let room_id = self.transport.config().room_id.clone();
                    if let Some(room_id) = room_id {
                        let region_id = RegionId::new();
                        let track_id = TrackId::new();
                        self.uploader.upload(&room_id, &region_id, &track_id, &self.local_user, bytes).await.ok()
                    } else {
                        None
                    }
                } else {
                    None
                };
                let region = self.record.stop(asset);
                self.send_immediate(OutboundMessage::RecordingStateChanged { recording: false }).await;
                if let Some(region) = region.clone() {
                    self.send_immediate(OutboundMessage::CreateRegion { region }).await;
                }
                let _ = respond_to.send(region);
            }
            Command::CancelRecording => {
                self.record.cancel();
            }
            Command::ResumeAudioOnInteraction => {
                if let Some(ctx) = self.audio.resume_on_interaction().await {
                    self.report_fault(ctx).await;
                }
            }
            Command::Health { respond_to } => {
                let snapshot = HealthSnapshot {
                    is_healthy: self.transport.state() != ConnectionState::Disconnected
                        || self.recovery.history_len() == 0,
                    total_errors: *self.total_errors.lock().unwrap(),
                    has_active_recoveries: self.recovery.has_active_recoveries(),
                    recovery_history_len: self.recovery.history_len(),
                };
                let _ = respond_to.send(snapshot);
            }
            Command::Shutdown => {
                self.transport.disconnect().await;
                self.record.cancel();
                return true;
            }
        }
        false
    }

    async fn report_fault(&mut self, ctx: ErrorContext) {
        *self.total_errors.lock().unwrap() += 1;
        let decision = self.recovery.report(ctx.clone());
        self.emit(FacadeEvent::ErrorReported(ctx));
        for action in &decision.actions {
            match action {
                crate::error::RecoveryAction::ReturnToLobby => {
                    let _ = self.transport.connect_to_lobby().await;
                }
                crate::error::RecoveryAction::ClearState => {
                    self.session_store.clear();
                }
                crate::error::RecoveryAction::ForceReconnect => {
                    let _ = self.transport.force_reconnect().await;
                }
                _ => {}
            }
        }
    }

    async fn drain_signals(&mut self) {
        while let Ok(signal) = self.signals_rx.try_recv() {
            match signal {
                EngineSignal::StateChanged { previous, current, .. } => {
                    if current == ConnectionState::InRoom {
                        self.persist_session();
                    }
                    self.pipeline.set_connected(current != ConnectionState::Disconnected);
                    self.emit(FacadeEvent::StateChanged { previous, current });
                }
                EngineSignal::TransportFault(ctx) => self.report_fault(ctx).await,
                EngineSignal::Reconnected => {
                    self.emit(FacadeEvent::StatusMessage { message: "reconnected".into(), severity: Severity::Info });
                }
            }
        }
    }

    async fn dispatch_inbound(&mut self, msg: InboundMessage) {
        let classification = self.transport.classify_inbound(&msg);
        match classification {
            InboundClassification::ValidationOnly(reason) => {
                let _ = self.transport.handle_validation_error().await;
                self.emit(FacadeEvent::StatusMessage { message: reason, severity: Severity::Warning });
                return;
            }
            InboundClassification::RateLimited(reason) | InboundClassification::PermissionDenied(reason) => {
                self.emit(FacadeEvent::StatusMessage { message: reason, severity: Severity::Warning });
                return;
            }
            InboundClassification::Intentional | InboundClassification::Fault(_) | InboundClassification::NotAFault => {}
        }

        let now = Instant::now();
        match msg {
            InboundMessage::RoomJoined { room_id, users } => {
                let (_, errors) = self.audio.initialize_for_room(users.clone()).await;
                for ctx in errors {
                    self.report_fault(ctx).await;
                }
                self.emit(FacadeEvent::RoomJoined { room_id, users });
            }
            InboundMessage::ApprovalGranted { room_id } => {
                let role = self.transport.config().role.unwrap_or(Role::Audience);
                if self.transport.connect_to_room(room_id.clone(), role).await.is_ok() {
                    self.persist_session();
                    self.send_immediate(OutboundMessage::JoinRoom {
                        room_id: room_id.clone(),
                        username: self.local_username.clone(),
                        user_id: self.local_user.clone(),
                        role,
                    })
                    .await;
                }
                self.emit(FacadeEvent::ApprovalGranted(room_id));
            }
            InboundMessage::ApprovalDenied { room_id, reason } => {
                let _ = self.transport.connect_to_lobby().await;
                self.emit(FacadeEvent::ApprovalDenied { room_id, reason });
            }
            InboundMessage::ApprovalPending { room_id } => self.emit(FacadeEvent::ApprovalPending(room_id)),
            InboundMessage::ApprovalTimedOut { .. } => {
                let _ = self.transport.on_approval_timeout().await;
            }
            InboundMessage::IncomingJoinRequest { room_id, user_id, username } => {
                self.emit(FacadeEvent::IncomingJoinRequest { room_id, user_id, username });
            }
            InboundMessage::UserJoined { user } => self.emit(FacadeEvent::UserJoined(user)),
            InboundMessage::UserLeft { user_id } => {
                self.audio.handle_user_left(&user_id).await;
                self.record.clear_user(&user_id);
                self.emit(FacadeEvent::UserLeft(user_id));
            }
            InboundMessage::Kicked { reason } => {
                let _ = self.transport.connect_to_lobby().await;
                self.session_store.clear();
                self.emit(FacadeEvent::Kicked { reason });
            }
            InboundMessage::NoteReceived { user_id, notes, velocity, instrument: _, category: _, event_type } => {
                self.emit(FacadeEvent::NoteReceived { user_id, notes, velocity, event_type });
            }
            InboundMessage::InstrumentChanged { user_id, instrument, category } => {
                let err = self
                    .audio
                    .handle_user_instrument_change(user_id.clone(), "", instrument.clone(), category)
                    .await;
                if let Some(ctx) = err {
                    self.report_fault(ctx).await;
                }
                self.emit(FacadeEvent::InstrumentChanged { user_id, instrument });
            }
            InboundMessage::SynthParamsChanged { user_id, params } => {
                self.emit(FacadeEvent::SynthParamsChanged { user_id, params });
            }
            InboundMessage::EffectsChainChanged { user_id, chains } => {
                self.emit(FacadeEvent::EffectsChainChanged { user_id, chains });
            }
            InboundMessage::RoomOwnerScaleChanged { root_note, scale } => {
                self.emit(FacadeEvent::RoomOwnerScaleChanged { root_note, scale });
            }
            InboundMessage::LockChanged { element_id, holder } => {
                let target = LockTarget::from(element_id);
                self.daw.apply_inbound(&InboundMessage::LockChanged { element_id, holder: holder.clone() }, now);
                self.emit(FacadeEvent::LockChanged { target, holder });
            }
            InboundMessage::RegionTransformPreview { region_id, region, user_id } => {
                self.daw.apply_inbound(&InboundMessage::RegionTransformPreview { region_id, region, user_id }, now);
            }
            InboundMessage::RegionTransformCommit { region_id, region } => {
                self.daw.apply_inbound(&InboundMessage::RegionTransformCommit { region_id, region }, now);
            }
            InboundMessage::DawSnapshot { tracks, regions, markers, effect_chains } => {
                self.daw.apply_snapshot(tracks, regions, markers, effect_chains);
                self.emit(FacadeEvent::DawSnapshotApplied);
            }
            InboundMessage::TrackChanged { track, track_id } => {
                self.daw.apply_inbound(&InboundMessage::TrackChanged { track, track_id }, now);
            }
            InboundMessage::RegionChanged { region, region_id } => {
                self.daw.apply_inbound(&InboundMessage::RegionChanged { region, region_id }, now);
            }
            InboundMessage::NoteChanged { region_id, note, note_id } => {
                self.daw.apply_inbound(&InboundMessage::NoteChanged { region_id, note, note_id }, now);
            }
            InboundMessage::MarkerChanged { marker, marker_id } => {
                self.daw.apply_inbound(&InboundMessage::MarkerChanged { marker, marker_id }, now);
            }
            InboundMessage::EffectChainChanged { chain, chain_id } => {
                self.daw.apply_inbound(&InboundMessage::EffectChainChanged { chain, chain_id }, now);
            }
            InboundMessage::RemoteRecordingStateChanged { user_id, recording } => {
                self.record.apply_remote_recording_state_changed(user_id.clone(), recording);
                self.emit(FacadeEvent::RemoteRecordingStateChanged { user_id, recording });
            }
            InboundMessage::ChatMessage { user_id, message } => self.emit(FacadeEvent::ChatMessage { user_id, message }),
            InboundMessage::RoomCreated { .. } | InboundMessage::Pong | InboundMessage::Unknown { .. } => {}
            InboundMessage::ValidationError { .. } | InboundMessage::RateLimited { .. } | InboundMessage::PermissionDenied { .. } => {}
        }
    }

    /// Run the cooperative event loop to completion: socket reads, the
    /// batch/throttle flush timer, the health-check timer, and host commands,
    /// all as `select!` arms (§5). Returns once [`SessionHandle::shutdown`]
    /// is called or every handle is dropped.
    pub async fn run(mut self) {
        let mut batch_timer = tokio::time::interval(crate::pipeline::BATCH_WINDOW.max(Duration::from_millis(1)));
        let mut health_timer = tokio::time::interval(crate::transport::HEALTH_CHECK_INTERVAL);

        loop {
            self.drain_signals().await;

            let approval_sleep = self.transport.approval_deadline();
            let grace_delay = self.transport.next_grace_attempt_delay();

            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                frame = self.transport.recv() => {
                    match frame {
                        Some(Ok(frame)) => {
                            let msg = InboundMessage::from_frame(frame);
                            self.dispatch_inbound(msg).await;
                        }
                        Some(Err(err)) => {
                            self.report_fault(
                                ErrorContext::new(crate::error::ErrorKind::Network, "socket read failed").with_source(err.0),
                            ).await;
                            if self.transport.state() == ConnectionState::InRoom {
                                self.transport.begin_grace();
                            }
                        }
                        None => {
                            if self.transport.state() == ConnectionState::InRoom {
                                self.transport.begin_grace();
                            }
                        }
                    }
                }

                _ = batch_timer.tick() => {
                    let frames = self.pipeline.tick(Instant::now());
                    for frame in frames {
                        self.send_frame_now(frame).await;
                    }
                }

                _ = health_timer.tick() => {
                    if let Some(ctx) = self.transport.check_health(Instant::now()) {
                        self.report_fault(ctx).await;
                    }
                }

                _ = async { tokio::time::sleep_until(tokio::time::Instant::from_std(approval_sleep.unwrap())).await },
                    if approval_sleep.is_some() => {
                    let _ = self.transport.on_approval_timeout().await;
                }

                _ = async { tokio::time::sleep(grace_delay.unwrap()).await }, if grace_delay.is_some() => {
                    let result = self.transport.attempt_grace_reconnect().await;
                    if result.is_err() && self.transport.next_grace_attempt_delay().is_none() {
                        let ctx = self.transport.on_grace_expired();
                        self.report_fault(ctx).await;
                    }
                }
            }
        }
    }
}
