//! Wire protocol: namespace addressing and the socket-frame vocabulary (§6, C10).
//!
//! The backend speaks a socket.io-shaped protocol — every frame is
//! `{event, data}` — over a plain WebSocket. There's no socket.io crate in
//! play here, so this module hand-rolls the framing the same way the
//! teacher hand-rolls its UDP frame layout in `net.rs`: a small envelope
//! type plus serde-tagged payload enums.

use serde::{Deserialize, Serialize};

use crate::daw::entities::{EffectChain, Marker, Note, Region, Track};
use crate::daw::lock::ElementRef;
use crate::ids::{EffectChainId, InstrumentId, MarkerId, NoteId, RegionId, RoomId, TrackId, UserId};
use crate::types::Role;

/// Which namespace a socket is (or should be) connected to.
///
/// Namespaces are paths on the same backend origin, not separate hosts —
/// see `BANDROOM_BACKEND_URL` in [`crate::config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Namespace {
    /// `/lobby-monitor`: room list + presence, no room membership.
    LobbyMonitor,
    /// `/approval/{roomId}`: awaiting a band member's grant/deny.
    Approval(RoomId),
    /// `/room/{roomId}`: full room membership.
    Room(RoomId),
}

impl Namespace {
    /// Render the namespace as the path the backend expects.
    pub fn path(&self) -> String {
        match self {
            Namespace::LobbyMonitor => "/lobby-monitor".to_owned(),
            Namespace::Approval(room) => format!("/approval/{room}"),
            Namespace::Room(room) => format!("/room/{room}"),
        }
    }
}

/// The raw `{event, data}` envelope every frame is wrapped in on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketFrame {
    /// Event name.
    pub event: String,
    /// Event payload, opaque until matched against [`InboundMessage`]/[`OutboundMessage`].
    pub data: serde_json::Value,
}

/// Which kind of note transition a [`OutboundMessage::PlayNote`]/[`InboundMessage::NoteReceived`]
/// carries (§6 `play_note.eventType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteEventType {
    /// A note started sounding.
    NoteOn,
    /// A note stopped sounding.
    NoteOff,
    /// Sustain pedal pressed.
    SustainOn,
    /// Sustain pedal released.
    SustainOff,
}

impl NoteEventType {
    /// Whether this transition is ever eligible for dedup (§3 NoteDedupKey:
    /// "note-off events are never deduped").
    pub fn is_dedup_eligible(self) -> bool {
        matches!(self, NoteEventType::NoteOn)
    }
}

/// Messages this client sends.
///
/// Encoded as `{event, data}` via [`OutboundMessage::into_frame`] rather
/// than `#[serde(tag = "event")]`, since outbound event names don't match
/// their Rust-side field names 1:1 (e.g. `join_room` vs `JoinRoom`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum OutboundMessage {
    /// Request to join a room (direct join or post-approval admission).
    JoinRoom {
        /// Room being joined.
        room_id: RoomId,
        /// Display name to present to the room.
        username: String,
        /// Joining user's identity.
        user_id: UserId,
        /// Role being requested.
        role: Role,
    },
    /// Leave the current room.
    LeaveRoom {
        /// Whether this is a deliberate leave (vs. a transport drop).
        is_intended_leave: bool,
    },
    /// Create a new room.
    CreateRoom {
        /// Room display name.
        name: String,
        /// Creator's display name.
        username: String,
        /// Creator's identity.
        user_id: UserId,
        /// Whether the room requires approval to join.
        is_private: bool,
        /// Whether the room is hidden from the public lobby listing.
        is_hidden: bool,
    },
    /// Cancel a pending join request before it's resolved.
    CancelJoinRequest {
        /// Room the request was sent to.
        room_id: RoomId,
    },
    /// Grant or deny a pending join request (band members only).
    RespondToJoinRequest {
        /// Requesting user.
        user_id: UserId,
        /// Grant (`true`, `approve_member`) or deny (`false`, `reject_member`).
        approve: bool,
    },
    /// A note on/off or sustain pedal event from the local user's instrument.
    PlayNote {
        /// Pitches involved (chords carry more than one).
        notes: Vec<u8>,
        /// Velocity, 0-127.
        velocity: u8,
        /// Instrument producing the event.
        instrument: InstrumentId,
        /// Instrument category (drives the dedup window: 10ms for drums, 20ms otherwise).
        category: String,
        /// Which transition this is.
        event_type: NoteEventType,
        /// Whether a key is currently held (sustain/arpeggiator UIs).
        is_key_held: Option<bool>,
    },
    /// Switch the local user's active instrument.
    ChangeInstrument {
        /// New instrument.
        instrument: InstrumentId,
        /// New instrument's category.
        category: String,
    },
    /// Silence every currently-sounding note for an instrument (panic button).
    StopAllNotes {
        /// Instrument to silence.
        instrument: InstrumentId,
        /// That instrument's category.
        category: String,
    },
    /// Stream live synth parameter changes (e.g. a filter knob being dragged).
    UpdateSynthParams {
        /// Opaque parameter blob, meaningful to the instrument engine only.
        params: serde_json::Value,
    },
    /// Stream live effect-chain parameter changes for the local user.
    UpdateEffectsChain {
        /// Opaque chain description.
        chains: serde_json::Value,
    },
    /// Chat message, broadcast to the room.
    ChatMessage {
        /// Room the message belongs to.
        room_id: RoomId,
        /// Message text.
        message: String,
    },
    /// Claim an edit lock on a DAW entity.
    LockAcquire {
        /// Entity being locked.
        element_id: ElementRef,
    },
    /// Release a previously claimed lock.
    LockRelease {
        /// Entity being unlocked.
        element_id: ElementRef,
    },
    /// Change the room's shared root note / scale (affects quantization for everyone).
    RoomOwnerScaleChange {
        /// New root note (e.g. `"C"`).
        root_note: String,
        /// New scale name (e.g. `"major"`).
        scale: String,
    },
    /// Stream an in-progress drag/resize of a region.
    RegionDragUpdate {
        /// Region being transformed.
        region_id: RegionId,
        /// In-progress state.
        region: Region,
    },
    /// Commit a finished drag/resize.
    RegionDragEnd {
        /// Region committed.
        region_id: RegionId,
        /// Final state.
        region: Region,
    },
    /// Create a new track.
    CreateTrack {
        /// Track to create.
        track: Track,
    },
    /// Update an existing track's fields (name, order, mute, instrument).
    UpdateTrack {
        /// Track after the edit.
        track: Track,
    },
    /// Delete a track.
    DeleteTrack {
        /// Track being removed.
        track_id: TrackId,
    },
    /// Create a new region on a track.
    CreateRegion {
        /// Region to create.
        region: Region,
    },
    /// Update a region's fields directly (not a drag/resize stream — see
    /// [`OutboundMessage::RegionDragUpdate`]/[`OutboundMessage::RegionDragEnd`] for that path).
    UpdateRegion {
        /// Region after the edit.
        region: Region,
    },
    /// Delete a region.
    DeleteRegion {
        /// Region being removed.
        region_id: RegionId,
    },
    /// Add a note to a MIDI region.
    AddNote {
        /// Region the note belongs to.
        region_id: RegionId,
        /// Note to add.
        note: Note,
    },
    /// Update a note already present in a MIDI region.
    UpdateNote {
        /// Region the note belongs to.
        region_id: RegionId,
        /// Note after the edit.
        note: Note,
    },
    /// Delete a note from a MIDI region.
    DeleteNote {
        /// Region the note belongs to.
        region_id: RegionId,
        /// Note being removed.
        note_id: NoteId,
    },
    /// Create or update a marker.
    UpsertMarker {
        /// Marker payload.
        marker: Marker,
    },
    /// Delete a marker.
    DeleteMarker {
        /// Marker being removed.
        marker_id: MarkerId,
    },
    /// Create or update an effect chain (a persisted, named chain — not the
    /// live per-knob stream; see [`OutboundMessage::UpdateEffectsChain`]).
    UpsertEffectChain {
        /// Effect chain payload.
        chain: EffectChain,
    },
    /// Delete an effect chain.
    DeleteEffectChain {
        /// Chain being removed.
        chain_id: EffectChainId,
    },
    /// Announce the local user started/stopped local recording.
    RecordingStateChanged {
        /// Whether recording is now active.
        recording: bool,
    },
    /// Heartbeat to keep the session alive during idle periods.
    Ping,
}

impl OutboundMessage {
    /// Encode into the wire envelope, picking the event name the backend expects.
    pub fn into_frame(self) -> SocketFrame {
        let event = self.event_name().to_owned();
        let data = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        SocketFrame { event, data }
    }

    /// The socket.io-style event name for this message (§6 vocabulary table).
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundMessage::JoinRoom { .. } => "join_room",
            OutboundMessage::LeaveRoom { .. } => "leave_room",
            OutboundMessage::CreateRoom { .. } => "create_room",
            OutboundMessage::CancelJoinRequest { .. } => "cancel_join_request",
            OutboundMessage::RespondToJoinRequest { approve, .. } => {
                if *approve {
                    "approve_member"
                } else {
                    "reject_member"
                }
            }
            OutboundMessage::PlayNote { .. } => "play_note",
            OutboundMessage::ChangeInstrument { .. } => "change_instrument",
            OutboundMessage::StopAllNotes { .. } => "stop_all_notes",
            OutboundMessage::UpdateSynthParams { .. } => "update_synth_params",
            OutboundMessage::UpdateEffectsChain { .. } => "update_effects_chain",
            OutboundMessage::ChatMessage { .. } => "chat_message",
            OutboundMessage::LockAcquire { .. } => "lock_acquire",
            OutboundMessage::LockRelease { .. } => "lock_release",
            OutboundMessage::RoomOwnerScaleChange { .. } => "room_owner_scale_change",
            OutboundMessage::RegionDragUpdate { .. } => "region_drag_update",
            OutboundMessage::RegionDragEnd { .. } => "region_drag_end",
            OutboundMessage::CreateTrack { .. } => "track_added",
            OutboundMessage::UpdateTrack { .. } => "track_updated",
            OutboundMessage::DeleteTrack { .. } => "track_deleted",
            OutboundMessage::CreateRegion { .. } => "region_added",
            OutboundMessage::UpdateRegion { .. } => "region_updated",
            OutboundMessage::DeleteRegion { .. } => "region_deleted",
            OutboundMessage::AddNote { .. } => "note_added",
            OutboundMessage::UpdateNote { .. } => "note_updated",
            OutboundMessage::DeleteNote { .. } => "note_deleted",
            OutboundMessage::UpsertMarker { .. } => "marker_upserted",
            OutboundMessage::DeleteMarker { .. } => "marker_deleted",
            OutboundMessage::UpsertEffectChain { .. } => "effects_chain_upserted",
            OutboundMessage::DeleteEffectChain { .. } => "effects_chain_deleted",
            OutboundMessage::RecordingStateChanged { .. } => "recording_state_changed",
            OutboundMessage::Ping => "ping",
        }
    }

    /// `(eventName, userId)` coalescing key for Batched classification (§4.4).
    /// `None` when the payload carries no user scope (coalesces under `"global"`).
    pub fn coalesce_key(&self, local_user: &UserId) -> (&'static str, String) {
        let user = match self {
            OutboundMessage::ChatMessage { .. } => local_user.0.clone(),
            _ => "global".to_owned(),
        };
        (self.event_name(), user)
    }
}

/// Messages this client receives, keyed by the wire `event` field.
///
/// `Unknown` absorbs anything the backend sends that this build doesn't
/// recognize yet; per the redesign flags, unrecognized events are logged
/// and dropped rather than raised as errors, so adding a backend event
/// never breaks an older client outright.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// A new room was created (echoed back to its creator).
    RoomCreated {
        /// Room created.
        room_id: RoomId,
    },
    /// Full room snapshot on join: membership, pending approvals, effect chains, self.
    RoomJoined {
        /// Room now joined.
        room_id: RoomId,
        /// All users currently in the room.
        users: Vec<crate::types::User>,
    },
    /// Join request was approved.
    ApprovalGranted {
        /// Room now joined.
        room_id: RoomId,
    },
    /// Join request was denied.
    ApprovalDenied {
        /// Room the request targeted.
        room_id: RoomId,
        /// Reason given, if any.
        reason: Option<String>,
    },
    /// The approval request is still pending (server keepalive).
    ApprovalPending {
        /// Room the request targets.
        room_id: RoomId,
    },
    /// The approval window expired server-side.
    ApprovalTimedOut {
        /// Room the request targeted.
        room_id: RoomId,
    },
    /// Another user submitted a join request (band members only).
    IncomingJoinRequest {
        /// Room the request targets.
        room_id: RoomId,
        /// Requesting user.
        user_id: UserId,
        /// Requested display name.
        username: String,
    },
    /// A user joined the room after the initial snapshot.
    UserJoined {
        /// User who joined.
        user: crate::types::User,
    },
    /// A user left the room.
    UserLeft {
        /// User who left.
        user_id: UserId,
    },
    /// The local user was removed from the room by a band member.
    Kicked {
        /// Reason given, if any.
        reason: Option<String>,
    },
    /// A remote note on/off or sustain pedal event.
    NoteReceived {
        /// Originating user.
        user_id: UserId,
        /// Pitches involved.
        notes: Vec<u8>,
        /// Velocity.
        velocity: u8,
        /// Instrument producing the event.
        instrument: InstrumentId,
        /// Instrument category.
        category: String,
        /// Which transition this is.
        event_type: NoteEventType,
    },
    /// A remote user changed their active instrument.
    InstrumentChanged {
        /// User whose instrument changed.
        user_id: UserId,
        /// New instrument.
        instrument: InstrumentId,
        /// New category.
        category: String,
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
    /// Lock state changed for an entity.
    LockChanged {
        /// Entity whose lock changed.
        element_id: ElementRef,
        /// New holder, or `None` if released.
        holder: Option<UserId>,
    },
    /// A region transform is streaming from a remote user.
    RegionTransformPreview {
        /// Region being transformed.
        region_id: RegionId,
        /// In-progress state.
        region: Region,
        /// Who's dragging it.
        user_id: UserId,
    },
    /// A region transform was committed by a remote user.
    RegionTransformCommit {
        /// Region committed.
        region_id: RegionId,
        /// Final state.
        region: Region,
    },
    /// Full DAW state snapshot (sent on room join / reconnect).
    DawSnapshot {
        /// All tracks.
        tracks: Vec<Track>,
        /// All regions.
        regions: Vec<Region>,
        /// All markers.
        markers: Vec<Marker>,
        /// All effect chains.
        effect_chains: Vec<EffectChain>,
    },
    /// A track was created, updated, or removed remotely.
    TrackChanged {
        /// Track after the change, or `None` if deleted.
        track: Option<Track>,
        /// Track id (present even on delete).
        track_id: TrackId,
    },
    /// A region was created, updated, or removed remotely (not a drag/resize
    /// stream — see [`InboundMessage::RegionTransformPreview`]/`Commit` for that).
    RegionChanged {
        /// Region after the change, or `None` if deleted.
        region: Option<Region>,
        /// Region id (present even on delete).
        region_id: RegionId,
    },
    /// A note within a MIDI region was added, updated, or removed remotely.
    NoteChanged {
        /// Region the note belongs to.
        region_id: RegionId,
        /// Note after the change, or `None` if deleted.
        note: Option<Note>,
        /// Note id (present even on delete).
        note_id: NoteId,
    },
    /// A marker was created, updated, or removed remotely.
    MarkerChanged {
        /// Marker after the change, or `None` if deleted.
        marker: Option<Marker>,
        /// Marker id (present even on delete).
        marker_id: MarkerId,
    },
    /// An effect chain was created, updated, or removed remotely.
    EffectChainChanged {
        /// Chain after the change, or `None` if deleted.
        chain: Option<EffectChain>,
        /// Chain id (present even on delete).
        chain_id: EffectChainId,
    },
    /// A remote user's recording state changed (for preview mirroring).
    RemoteRecordingStateChanged {
        /// User whose recording state changed.
        user_id: UserId,
        /// Whether they're now recording.
        recording: bool,
    },
    /// A chat message was broadcast to the room.
    ChatMessage {
        /// Sender.
        user_id: UserId,
        /// Message text.
        message: String,
    },
    /// Server pushed a validation failure for the last action sent.
    /// Per §4.3, a message containing the validation signature is never
    /// retried/escalated to recovery, regardless of which event carried it.
    ValidationError {
        /// Human-readable reason.
        reason: String,
    },
    /// Server is rate-limiting this client: surfaced to the user, not a recovery trigger.
    RateLimited {
        /// Human-readable reason.
        reason: String,
    },
    /// Server rejected an action as unauthorized.
    PermissionDenied {
        /// Human-readable reason.
        reason: String,
    },
    /// Heartbeat response.
    Pong,
    /// An event name this build doesn't understand.
    Unknown {
        /// The raw event name, preserved for logging.
        event: String,
    },
}

impl InboundMessage {
    /// Substring the backend uses to flag a validation failure (§4.3):
    /// these never enter the recovery path no matter which inbound event carries them.
    pub const VALIDATION_SIGNATURE: &'static str = "Invalid data format";

    /// Parse a raw frame into a typed message, falling back to [`InboundMessage::Unknown`]
    /// for anything unrecognized rather than failing the whole read loop.
    pub fn from_frame(frame: SocketFrame) -> Self {
        let parsed = match frame.event.as_str() {
            "room_created" => parse(&frame.data, |d: RoomCreatedData| InboundMessage::RoomCreated { room_id: d.room_id }),
            "room_joined" => parse(&frame.data, |d: RoomJoinedData| InboundMessage::RoomJoined {
                room_id: d.room_id,
                users: d.users,
            }),
            "approval_granted" => {
                parse(&frame.data, |d: RoomIdData| InboundMessage::ApprovalGranted { room_id: d.room_id })
            }
            "approval_denied" => parse(&frame.data, |d: ApprovalDeniedData| InboundMessage::ApprovalDenied {
                room_id: d.room_id,
                reason: d.reason,
            }),
            "approval_pending" => {
                parse(&frame.data, |d: RoomIdData| InboundMessage::ApprovalPending { room_id: d.room_id })
            }
            "approval_timeout" => {
                parse(&frame.data, |d: RoomIdData| InboundMessage::ApprovalTimedOut { room_id: d.room_id })
            }
            "incoming_join_request" => {
                parse(&frame.data, |d: IncomingJoinRequestData| InboundMessage::IncomingJoinRequest {
                    room_id: d.room_id,
                    user_id: d.user_id,
                    username: d.username,
                })
            }
            "user_joined" => parse(&frame.data, |d: UserJoinedData| InboundMessage::UserJoined { user: d.user }),
            "user_left" => parse(&frame.data, |d: UserLeftData| InboundMessage::UserLeft { user_id: d.user_id }),
            "kicked" => parse(&frame.data, |d: KickedData| InboundMessage::Kicked { reason: d.reason }),
            "play_note" => parse(&frame.data, |d: NoteReceivedData| InboundMessage::NoteReceived {
                user_id: d.user_id,
                notes: d.notes,
                velocity: d.velocity,
                instrument: d.instrument,
                category: d.category,
                event_type: d.event_type,
            }),
            "instrument_changed" => {
                parse(&frame.data, |d: InstrumentChangedData| InboundMessage::InstrumentChanged {
                    user_id: d.user_id,
                    instrument: d.instrument,
                    category: d.category,
                })
            }
            "synth_params_changed" => {
                parse(&frame.data, |d: SynthParamsChangedData| InboundMessage::SynthParamsChanged {
                    user_id: d.user_id,
                    params: d.params,
                })
            }
            "effects_chain_changed" => {
                parse(&frame.data, |d: EffectsChainChangedStreamData| InboundMessage::EffectsChainChanged {
                    user_id: d.user_id,
                    chains: d.chains,
                })
            }
            "room_owner_scale_changed" => {
                parse(&frame.data, |d: ScaleData| InboundMessage::RoomOwnerScaleChanged {
                    root_note: d.root_note,
                    scale: d.scale,
                })
            }
            "lock_changed" => parse(&frame.data, |d: LockChangedData| InboundMessage::LockChanged {
                element_id: d.element_id,
                holder: d.holder,
            }),
            "region_transform_preview" => {
                parse(&frame.data, |d: RegionTransformPreviewData| InboundMessage::RegionTransformPreview {
                    region_id: d.region_id,
                    region: d.region,
                    user_id: d.user_id,
                })
            }
            "region_transform_commit" => {
                parse(&frame.data, |d: RegionTransformCommitData| InboundMessage::RegionTransformCommit {
                    region_id: d.region_id,
                    region: d.region,
                })
            }
            "daw_snapshot" => parse(&frame.data, |d: DawSnapshotData| InboundMessage::DawSnapshot {
                tracks: d.tracks,
                regions: d.regions,
                markers: d.markers,
                effect_chains: d.effect_chains,
            }),
            "track_changed" => parse(&frame.data, |d: TrackChangedData| InboundMessage::TrackChanged {
                track: d.track,
                track_id: d.track_id,
            }),
            "region_changed" => parse(&frame.data, |d: RegionChangedData| InboundMessage::RegionChanged {
                region: d.region,
                region_id: d.region_id,
            }),
            "note_changed" => parse(&frame.data, |d: NoteChangedData| InboundMessage::NoteChanged {
                region_id: d.region_id,
                note: d.note,
                note_id: d.note_id,
            }),
            "marker_changed" => parse(&frame.data, |d: MarkerChangedData| InboundMessage::MarkerChanged {
                marker: d.marker,
                marker_id: d.marker_id,
            }),
            "effect_chain_changed" => {
                parse(&frame.data, |d: EffectChainChangedData| InboundMessage::EffectChainChanged {
                    chain: d.chain,
                    chain_id: d.chain_id,
                })
            }
            "remote_recording_state_changed" => parse(&frame.data, |d: RemoteRecordingData| {
                InboundMessage::RemoteRecordingStateChanged { user_id: d.user_id, recording: d.recording }
            }),
            "chat_message" => parse(&frame.data, |d: ChatMessageData| InboundMessage::ChatMessage {
                user_id: d.user_id,
                message: d.message,
            }),
            "validation_error" => {
                parse(&frame.data, |d: ReasonData| InboundMessage::ValidationError { reason: d.reason })
            }
            "rate_limited" => parse(&frame.data, |d: ReasonData| InboundMessage::RateLimited { reason: d.reason }),
            "permission_denied" => {
                parse(&frame.data, |d: ReasonData| InboundMessage::PermissionDenied { reason: d.reason })
            }
            "pong" => Some(InboundMessage::Pong),
            _ => None,
        };

        parsed.unwrap_or(InboundMessage::Unknown { event: frame.event })
    }
}

/// Deserialize `data` into `T` and apply `ctor`, or `None` on malformed payloads.
fn parse<T, F>(data: &serde_json::Value, ctor: F) -> Option<InboundMessage>
where
    T: for<'de> Deserialize<'de>,
    F: FnOnce(T) -> InboundMessage,
{
    serde_json::from_value(data.clone()).ok().map(ctor)
}

#[derive(Deserialize)]
struct RoomCreatedData {
    room_id: RoomId,
}

#[derive(Deserialize)]
struct RoomIdData {
    room_id: RoomId,
}

#[derive(Deserialize)]
struct RoomJoinedData {
    room_id: RoomId,
    users: Vec<crate::types::User>,
}

#[derive(Deserialize)]
struct ApprovalDeniedData {
    room_id: RoomId,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct IncomingJoinRequestData {
    room_id: RoomId,
    user_id: UserId,
    username: String,
}

#[derive(Deserialize)]
struct UserJoinedData {
    user: crate::types::User,
}

#[derive(Deserialize)]
struct UserLeftData {
    user_id: UserId,
}

#[derive(Deserialize)]
struct KickedData {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct NoteReceivedData {
    user_id: UserId,
    notes: Vec<u8>,
    velocity: u8,
    instrument: InstrumentId,
    category: String,
    event_type: NoteEventType,
}

#[derive(Deserialize)]
struct InstrumentChangedData {
    user_id: UserId,
    instrument: InstrumentId,
    category: String,
}

#[derive(Deserialize)]
struct SynthParamsChangedData {
    user_id: UserId,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct EffectsChainChangedStreamData {
    user_id: UserId,
    chains: serde_json::Value,
}

#[derive(Deserialize)]
struct ScaleData {
    root_note: String,
    scale: String,
}

#[derive(Deserialize)]
struct LockChangedData {
    element_id: ElementRef,
    #[serde(default)]
    holder: Option<UserId>,
}

#[derive(Deserialize)]
struct RegionTransformPreviewData {
    region_id: RegionId,
    region: Region,
    user_id: UserId,
}

#[derive(Deserialize)]
struct RegionTransformCommitData {
    region_id: RegionId,
    region: Region,
}

#[derive(Deserialize)]
struct DawSnapshotData {
    tracks: Vec<Track>,
    #[serde(default)]
    regions: Vec<Region>,
    markers: Vec<Marker>,
    effect_chains: Vec<EffectChain>,
}

#[derive(Deserialize)]
struct TrackChangedData {
    #[serde(default)]
    track: Option<Track>,
    track_id: TrackId,
}

#[derive(Deserialize)]
struct RegionChangedData {
    #[serde(default)]
    region: Option<Region>,
    region_id: RegionId,
}

#[derive(Deserialize)]
struct NoteChangedData {
    region_id: RegionId,
    #[serde(default)]
    note: Option<Note>,
    note_id: NoteId,
}

#[derive(Deserialize)]
struct MarkerChangedData {
    #[serde(default)]
    marker: Option<Marker>,
    marker_id: MarkerId,
}

#[derive(Deserialize)]
struct EffectChainChangedData {
    #[serde(default)]
    chain: Option<EffectChain>,
    chain_id: EffectChainId,
}

#[derive(Deserialize)]
struct RemoteRecordingData {
    user_id: UserId,
    recording: bool,
}

#[derive(Deserialize)]
struct ChatMessageData {
    user_id: UserId,
    message: String,
}

#[derive(Deserialize)]
struct ReasonData {
    reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_paths_match_backend_routes() {
        assert_eq!(Namespace::LobbyMonitor.path(), "/lobby-monitor");
        assert_eq!(Namespace::Approval("R1".into()).path(), "/approval/R1");
        assert_eq!(Namespace::Room("R1".into()).path(), "/room/R1");
    }

    #[test]
    fn outbound_message_picks_stable_event_name() {
        let frame = OutboundMessage::LeaveRoom { is_intended_leave: true }.into_frame();
        assert_eq!(frame.event, "leave_room");
        assert_eq!(frame.data["is_intended_leave"], serde_json::json!(true));
    }

    #[test]
    fn approve_and_reject_share_a_variant_but_different_event_names() {
        let approve = OutboundMessage::RespondToJoinRequest { user_id: "U1".into(), approve: true };
        let reject = OutboundMessage::RespondToJoinRequest { user_id: "U1".into(), approve: false };
        assert_eq!(approve.event_name(), "approve_member");
        assert_eq!(reject.event_name(), "reject_member");
    }

    #[test]
    fn unrecognized_event_becomes_unknown_not_an_error() {
        let frame = SocketFrame { event: "some_future_event".to_owned(), data: serde_json::json!({}) };
        let msg = InboundMessage::from_frame(frame);
        assert!(matches!(msg, InboundMessage::Unknown { event } if event == "some_future_event"));
    }

    #[test]
    fn malformed_known_event_becomes_unknown_not_a_panic() {
        let frame = SocketFrame { event: "approval_granted".to_owned(), data: serde_json::json!({"wrong": true}) };
        let msg = InboundMessage::from_frame(frame);
        assert!(matches!(msg, InboundMessage::Unknown { .. }));
    }

    #[test]
    fn round_trips_approval_granted() {
        let frame = SocketFrame { event: "approval_granted".to_owned(), data: serde_json::json!({"room_id": "R1"}) };
        let msg = InboundMessage::from_frame(frame);
        assert!(matches!(msg, InboundMessage::ApprovalGranted { room_id } if room_id == "R1".into()));
    }

    #[test]
    fn validation_error_carries_the_signature_callers_check_for() {
        let frame = SocketFrame {
            event: "validation_error".to_owned(),
            data: serde_json::json!({"reason": "Invalid data format: missing field"}),
        };
        let msg = InboundMessage::from_frame(frame);
        match msg {
            InboundMessage::ValidationError { reason } => {
                assert!(reason.contains(InboundMessage::VALIDATION_SIGNATURE));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }
}
