//! Durable-ish per-tab record of the current room/role/user/instrument (C1).
//!
//! Native reimplementation note: "tab-local key-value storage" becomes a
//! single JSON file under the OS cache directory, persisted the same way
//! a long-running client would cache its last-known app state (§4.1).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ids::{InstrumentId, RoomId, UserId};
use crate::types::Role;

/// Filename (without extension) under which the session record is stored.
///
/// Matches the literal persisted-state key documented in §6.
const STORAGE_KEY: &str = "jam-band-room-session";

/// Time-to-live for a persisted session record.
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// A persisted snapshot of "what room/role/instrument was I in".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSession {
    /// Room the session pertains to.
    pub room_id: RoomId,
    /// Role held in that room.
    pub role: Role,
    /// Opaque identity.
    pub user_id: UserId,
    /// Display name at time of storage.
    pub username: String,
    /// Instrument selected, if any.
    pub instrument_id: Option<InstrumentId>,
    /// Instrument category, if any.
    pub instrument_category: Option<String>,
    /// Free-form synth parameters, if any (opaque JSON blob).
    pub synth_params: Option<serde_json::Value>,
    /// Wall-clock time this record was written.
    pub stored_at: chrono::DateTime<chrono::Utc>,
}

impl RoomSession {
    /// Whether this record is still within [`SESSION_TTL`] of `now`.
    fn is_valid_at(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        let age = now.signed_duration_since(self.stored_at);
        age >= chrono::Duration::zero()
            && age
                < chrono::Duration::from_std(SESSION_TTL)
                    .expect("30 minutes fits in chrono::Duration")
    }
}

/// Fields a caller may update without replacing the whole record.
#[derive(Debug, Clone, Default)]
pub struct RoomSessionPatch {
    /// New room, if changing.
    pub room_id: Option<RoomId>,
    /// New role, if changing.
    pub role: Option<Role>,
    /// New user id, if changing.
    pub user_id: Option<UserId>,
    /// New username, if changing.
    pub username: Option<String>,
    /// New instrument id, if changing.
    pub instrument_id: Option<InstrumentId>,
    /// New instrument category, if changing.
    pub instrument_category: Option<String>,
    /// New synth params, if changing.
    pub synth_params: Option<serde_json::Value>,
}

/// Owns the one persisted session record for this client instance.
///
/// All write paths swallow storage errors (quota, disabled storage) and log;
/// no exception escapes into callers, logging and moving on instead.
pub struct SessionStore {
    /// Directory the session file lives in.
    directory: PathBuf,
}

impl SessionStore {
    /// Construct a store rooted at the OS cache directory, creating it if needed.
    pub fn new() -> Self {
        let directory = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("bandroom-session");
        if let Err(err) = std::fs::create_dir_all(&directory) {
            warn!("session store: failed to create cache directory: {err}");
        }
        Self { directory }
    }

    /// Construct a store rooted at an explicit directory (used in tests).
    pub fn at(directory: PathBuf) -> Self {
        Self { directory }
    }

    /// Path of the backing JSON file.
    fn file_path(&self) -> PathBuf {
        self.directory.join(format!("{STORAGE_KEY}.json"))
    }

    /// Overwrite the stored record with a freshly stamped `RoomSession`.
    pub fn store(&self, session: RoomSession) {
        self.write(&session);
    }

    /// Read the stored record, discarding and returning `None` if absent or
    /// TTL-expired. A stale record is deleted as a side effect (invariant 4).
    pub fn get_valid_or_null(&self) -> Option<RoomSession> {
        let path = self.file_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("session store: failed to read {path:?}: {err}");
                return None;
            }
        };

        let session: RoomSession = match serde_json::from_slice(&bytes) {
            Ok(session) => session,
            Err(err) => {
                warn!("session store: corrupt record, discarding: {err}");
                self.clear();
                return None;
            }
        };

        if session.is_valid_at(chrono::Utc::now()) {
            Some(session)
        } else {
            self.clear();
            None
        }
    }

    /// Whether a currently-valid record exists.
    pub fn has_valid(&self) -> bool {
        self.get_valid_or_null().is_some()
    }

    /// Apply a partial update on top of the current (or a fresh) record and
    /// persist the result, refreshing `stored_at`.
    pub fn update(&self, patch: RoomSessionPatch) {
        let Some(mut current) = self.get_valid_or_null() else {
            warn!("session store: update() called with no existing valid session, ignoring");
            return;
        };

        if let Some(room_id) = patch.room_id {
            current.room_id = room_id;
        }
        if let Some(role) = patch.role {
            current.role = role;
        }
        if let Some(user_id) = patch.user_id {
            current.user_id = user_id;
        }
        if let Some(username) = patch.username {
            current.username = username;
        }
        if let Some(instrument_id) = patch.instrument_id {
            current.instrument_id = Some(instrument_id);
        }
        if let Some(instrument_category) = patch.instrument_category {
            current.instrument_category = Some(instrument_category);
        }
        if let Some(synth_params) = patch.synth_params {
            current.synth_params = Some(synth_params);
        }
        current.stored_at = chrono::Utc::now();
        self.write(&current);
    }

    /// Convenience update used by AudioManager/DAWCollab when the local
    /// user's instrument changes.
    pub fn store_instrument(
        &self,
        instrument_id: InstrumentId,
        category: impl Into<String>,
        synth_params: Option<serde_json::Value>,
    ) {
        self.update(RoomSessionPatch {
            instrument_id: Some(instrument_id),
            instrument_category: Some(category.into()),
            synth_params,
            ..Default::default()
        });
    }

    /// Delete the persisted record, if any.
    pub fn clear(&self) {
        let path = self.file_path();
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("session store: failed to clear {path:?}: {err}");
            }
        }
    }

    /// Write-through helper shared by `store`/`update`.
    fn write(&self, session: &RoomSession) {
        let path = self.file_path();
        let bytes = match serde_json::to_vec_pretty(session) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("session store: failed to serialize session: {err}");
                return;
            }
        };
        if let Err(err) = std::fs::write(&path, bytes) {
            warn!("session store: failed to write {path:?}: {err}");
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(stored_at: chrono::DateTime<chrono::Utc>) -> RoomSession {
        RoomSession {
            room_id: "R1".into(),
            role: Role::BandMember,
            user_id: "U1".into(),
            username: "alice".into(),
            instrument_id: None,
            instrument_category: None,
            synth_params: None,
            stored_at,
        }
    }

    fn temp_store() -> SessionStore {
        let dir = std::env::temp_dir().join(format!("bandroom-session-test-{}", uuid::Uuid::new_v4()));
        SessionStore::at(dir)
    }

    #[test]
    fn fresh_record_is_valid() {
        let store = temp_store();
        store.store(sample(chrono::Utc::now()));
        assert!(store.get_valid_or_null().is_some());
    }

    #[test]
    fn expired_record_is_null_and_cleared() {
        let store = temp_store();
        let stale = chrono::Utc::now() - chrono::Duration::minutes(31);
        store.store(sample(stale));
        assert!(store.get_valid_or_null().is_none());
        // side effect: file gone, so a second read also finds nothing to clear
        assert!(store.get_valid_or_null().is_none());
    }

    #[test]
    fn update_refreshes_stored_at_and_preserves_other_fields() {
        let store = temp_store();
        store.store(sample(chrono::Utc::now()));
        store.update(RoomSessionPatch {
            instrument_id: Some("synth-1".into()),
            instrument_category: Some("Synthesizer".into()),
            ..Default::default()
        });
        let session = store.get_valid_or_null().unwrap();
        assert_eq!(session.instrument_id, Some("synth-1".into()));
        assert_eq!(session.username, "alice");
    }

    #[test]
    fn clear_removes_record() {
        let store = temp_store();
        store.store(sample(chrono::Utc::now()));
        store.clear();
        assert!(store.get_valid_or_null().is_none());
    }
}
