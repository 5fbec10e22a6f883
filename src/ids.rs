//! Newtype identifiers for every entity the engine tracks.
//!
//! Plain [`uuid::Uuid`] values are easy to swap by accident (an elementId
//! where a userId is expected). Each entity class gets its own wrapper so
//! the compiler enforces the ownership boundaries described in the data
//! model instead of relying on naming discipline.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Defines a UUID-backed identifier newtype with the common trait set every
/// id in this crate needs (equality, hashing, serde, human-readable Display).
macro_rules! uuid_id {
    ($name:ident) => {
        #[doc = concat!("Opaque identifier for a ", stringify!($name), ".")]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Mint a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id!(TrackId);
uuid_id!(RegionId);
uuid_id!(NoteId);
uuid_id!(MarkerId);
uuid_id!(EffectChainId);

/// Identifier for a room. Rooms are minted server-side; the client only ever
/// receives one, so this wraps a UUID but is never constructed with `new()`
/// outside of tests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for RoomId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier for a user. Identity is opaque per the data model: it is
/// minted by the backend, not derived from the display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier for an instrument (opaque to the engine; meaningful only to
/// the external `InstrumentEngine` and its compatibility layer).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(pub String);

impl From<&str> for InstrumentId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for InstrumentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_ids_round_trip_through_json() {
        let id = TrackId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: TrackId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn string_ids_preserve_value() {
        let room: RoomId = "R1".into();
        assert_eq!(room.to_string(), "R1");
    }
}
