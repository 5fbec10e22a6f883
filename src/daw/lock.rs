//! Pessimistic per-element locks for DAW collaboration (§4.6, GLOSSARY "Lock").

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::ids::{MarkerId, NoteId, RegionId, TrackId, UserId};

/// Default lock TTL when a caller doesn't specify one.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// The element class a lock applies to, carrying its own id so a single
/// `HashMap` keys every lockable element kind uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockTarget {
    /// A track.
    Track(TrackId),
    /// A region.
    Region(RegionId),
    /// A single note.
    Note(NoteId),
    /// A marker.
    Marker(MarkerId),
}

/// Wire-level reference to a lockable element, tagged by kind so
/// `lock_acquire`/`lock_release`/`lock_changed` frames can name any of the
/// four lockable entity classes through one field instead of assuming every
/// lock targets a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementRef {
    /// A track.
    Track {
        /// Track id.
        id: TrackId,
    },
    /// A region.
    Region {
        /// Region id.
        id: RegionId,
    },
    /// A single note.
    Note {
        /// Note id.
        id: NoteId,
    },
    /// A marker.
    Marker {
        /// Marker id.
        id: MarkerId,
    },
}

impl From<LockTarget> for ElementRef {
    fn from(target: LockTarget) -> Self {
        match target {
            LockTarget::Track(id) => ElementRef::Track { id },
            LockTarget::Region(id) => ElementRef::Region { id },
            LockTarget::Note(id) => ElementRef::Note { id },
            LockTarget::Marker(id) => ElementRef::Marker { id },
        }
    }
}

impl From<ElementRef> for LockTarget {
    fn from(element: ElementRef) -> Self {
        match element {
            ElementRef::Track { id } => LockTarget::Track(id),
            ElementRef::Region { id } => LockTarget::Region(id),
            ElementRef::Note { id } => LockTarget::Note(id),
            ElementRef::Marker { id } => LockTarget::Marker(id),
        }
    }
}

/// A held exclusive-edit claim (§3 "Lock").
#[derive(Debug, Clone)]
pub struct Lock {
    /// Element this lock covers.
    pub target: LockTarget,
    /// Holder's identity.
    pub user_id: UserId,
    /// Holder's display name, for presence UI.
    pub username: String,
    /// When the lock was (last) acquired/refreshed.
    pub acquired_at: Instant,
    /// How long the lock remains valid without a refresh.
    pub ttl: Duration,
}

impl Lock {
    /// Whether this lock has outlived its TTL as of `now`.
    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.acquired_at) > self.ttl
    }
}

/// Why a lock acquisition was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// Another (non-stale) user already holds this lock.
    #[error("element is already locked by another user")]
    HeldByOther,
    /// Caller attempted to release/refresh a lock it does not hold.
    #[error("caller does not hold this lock")]
    NotHolder,
    /// No lock exists for this target.
    #[error("no lock held for this element")]
    NotLocked,
}

/// Tracks every currently-held lock, keyed by [`LockTarget`].
#[derive(Default)]
pub struct LockTable {
    /// Live locks, not yet swept as stale.
    locks: HashMap<LockTarget, Lock>,
}

impl LockTable {
    /// Construct an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to acquire `target` for `user_id`. A stale lock held by
    /// someone else is treated as absent and silently reclaimed.
    pub fn acquire(
        &mut self,
        target: LockTarget,
        user_id: UserId,
        username: impl Into<String>,
        ttl: Duration,
        now: Instant,
    ) -> Result<(), LockError> {
        if let Some(existing) = self.locks.get(&target) {
            if existing.user_id == user_id {
                // Re-entrant acquire by the same holder behaves like a refresh.
            } else if !existing.is_stale(now) {
                return Err(LockError::HeldByOther);
            }
        }
        self.locks.insert(target, Lock { target, user_id, username: username.into(), acquired_at: now, ttl });
        Ok(())
    }

    /// Current lock holder for `target`, if any (stale locks still show
    /// until swept — callers should `sweep_stale` on a timer).
    pub fn get(&self, target: LockTarget) -> Option<&Lock> {
        self.locks.get(&target)
    }

    /// Whether `target` is currently locked (including by a stale, unswept lock).
    pub fn is_locked(&self, target: LockTarget) -> bool {
        self.locks.contains_key(&target)
    }

    /// Release a lock. Only the current holder may release it.
    pub fn release(&mut self, target: LockTarget, user_id: &UserId) -> Result<(), LockError> {
        match self.locks.get(&target) {
            None => Err(LockError::NotLocked),
            Some(lock) if &lock.user_id != user_id => Err(LockError::NotHolder),
            Some(_) => {
                self.locks.remove(&target);
                Ok(())
            }
        }
    }

    /// Refresh the TTL clock on a lock the caller holds (invariant: owner may refresh).
    pub fn refresh(&mut self, target: LockTarget, user_id: &UserId, now: Instant) -> Result<(), LockError> {
        match self.locks.get_mut(&target) {
            None => Err(LockError::NotLocked),
            Some(lock) if &lock.user_id != user_id => Err(LockError::NotHolder),
            Some(lock) => {
                lock.acquired_at = now;
                Ok(())
            }
        }
    }

    /// Remove every lock that has exceeded its TTL as of `now`.
    pub fn sweep_stale(&mut self, now: Instant) -> Vec<LockTarget> {
        let stale: Vec<LockTarget> =
            self.locks.values().filter(|lock| lock.is_stale(now)).map(|lock| lock.target).collect();
        for target in &stale {
            self.locks.remove(target);
        }
        stale
    }

    /// Apply a server-pushed `lock_granted` (remote or local).
    pub fn apply_granted(&mut self, target: LockTarget, user_id: UserId, username: impl Into<String>, ttl: Duration, now: Instant) {
        self.locks.insert(target, Lock { target, user_id, username: username.into(), acquired_at: now, ttl });
    }

    /// Apply a server-pushed `lock_released`.
    pub fn apply_released(&mut self, target: LockTarget) {
        self.locks.remove(&target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_holder_per_element() {
        let mut table = LockTable::new();
        let now = Instant::now();
        let target = LockTarget::Region(RegionId::new());
        table.acquire(target, "U1".into(), "alice", DEFAULT_LOCK_TTL, now).unwrap();
        let err = table.acquire(target, "U2".into(), "bob", DEFAULT_LOCK_TTL, now).unwrap_err();
        assert_eq!(err, LockError::HeldByOther);
    }

    #[test]
    fn stale_lock_is_reclaimable() {
        let mut table = LockTable::new();
        let t0 = Instant::now();
        let target = LockTarget::Track(TrackId::new());
        table.acquire(target, "U1".into(), "alice", Duration::from_millis(1), t0).unwrap();
        let later = t0 + Duration::from_secs(1);
        table.acquire(target, "U2".into(), "bob", DEFAULT_LOCK_TTL, later).unwrap();
        assert_eq!(table.get(target).unwrap().user_id, "U2".into());
    }

    #[test]
    fn only_holder_may_release_or_refresh() {
        let mut table = LockTable::new();
        let now = Instant::now();
        let target = LockTarget::Marker(MarkerId::new());
        table.acquire(target, "U1".into(), "alice", DEFAULT_LOCK_TTL, now).unwrap();
        assert_eq!(table.release(target, &"U2".into()), Err(LockError::NotHolder));
        assert_eq!(table.refresh(target, &"U2".into(), now), Err(LockError::NotHolder));
        assert!(table.release(target, &"U1".into()).is_ok());
        assert!(!table.is_locked(target));
    }

    #[test]
    fn element_ref_round_trips_every_kind() {
        for target in [
            LockTarget::Track(TrackId::new()),
            LockTarget::Region(RegionId::new()),
            LockTarget::Note(NoteId::new()),
            LockTarget::Marker(MarkerId::new()),
        ] {
            let element: ElementRef = target.into();
            let json = serde_json::to_string(&element).unwrap();
            let back: ElementRef = serde_json::from_str(&json).unwrap();
            assert_eq!(LockTarget::from(back), target);
        }
    }

    #[test]
    fn sweep_removes_only_stale_locks() {
        let mut table = LockTable::new();
        let t0 = Instant::now();
        let fresh = LockTarget::Track(TrackId::new());
        let stale = LockTarget::Track(TrackId::new());
        table.acquire(fresh, "U1".into(), "alice", Duration::from_secs(60), t0).unwrap();
        table.acquire(stale, "U2".into(), "bob", Duration::from_millis(1), t0).unwrap();
        let later = t0 + Duration::from_secs(1);
        let swept = table.sweep_stale(later);
        assert_eq!(swept, vec![stale]);
        assert!(table.is_locked(fresh));
        assert!(!table.is_locked(stale));
    }
}
