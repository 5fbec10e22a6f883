//! Core data-model types shared across every component (§3).

use serde::{Deserialize, Serialize};

use crate::ids::{InstrumentId, RoomId, UserId};

/// Role a user holds within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full participant: can play notes, edit the DAW, hold locks.
    BandMember,
    /// Observer: receives broadcasts but cannot mutate room state.
    Audience,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BandMember => write!(f, "band_member"),
            Self::Audience => write!(f, "audience"),
        }
    }
}

/// The four states of the transport state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket held.
    Disconnected,
    /// Connected to the lobby-monitor namespace.
    Lobby,
    /// Connected to an approval namespace, awaiting grant/deny/timeout.
    Requesting,
    /// Connected to a room namespace.
    InRoom,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Describes which namespace/room/role the transport is currently targeting.
///
/// `namespace` and `room_id` are `None` only in `Disconnected`/`Lobby`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Current state.
    pub state: ConnectionState,
    /// Namespace path the active socket is bound to, if any.
    pub namespace: Option<String>,
    /// Room the config pertains to, if any.
    pub room_id: Option<RoomId>,
    /// Role the local user holds in that room, if known.
    pub role: Option<Role>,
}

/// A participant in a room, as tracked by this client.
///
/// Identity is the opaque `user_id`; `username` is display-only and must
/// never be used as a lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Opaque stable identity.
    pub user_id: UserId,
    /// Display name only.
    pub username: String,
    /// Instrument currently selected by this user, if any.
    pub current_instrument_id: Option<InstrumentId>,
    /// Instrument category (e.g. "Melodic", "Synthesizer", "Drums").
    pub current_instrument_category: Option<String>,
    /// Effect chain ids currently applied for this user, if any.
    pub effect_chains: Option<Vec<crate::ids::EffectChainId>>,
}

impl User {
    /// Construct a user with no instrument selected yet.
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            current_instrument_id: None,
            current_instrument_category: None,
            effect_chains: None,
        }
    }
}
