//! DAW collaboration: the authoritative local snapshot, lock-gated mutation,
//! drag/resize streaming, and split/resize arithmetic (§4.6, C6).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::daw::entities::{EffectChain, Marker, Note, Region, RegionPayload, SustainEvent, Track};
use crate::daw::lock::{LockError, LockTable, LockTarget, DEFAULT_LOCK_TTL};
use crate::ids::{EffectChainId, MarkerId, NoteId, RegionId, TrackId, UserId};
use crate::protocol::InboundMessage;

/// An in-progress drag/resize the local user started, tracked so `drag_end`
/// knows what to finalize and `drag_abort` knows what locks to release.
#[derive(Debug, Clone)]
struct ActiveDrag {
    /// Regions participating in the drag, and the track they started on
    /// (used to decide whether a cross-track move degrades to a same-track shift, §4.6).
    region_ids: Vec<RegionId>,
    origin_track: TrackId,
}

/// Owns the authoritative local DAW snapshot and coordinates remote patches (C6).
pub struct DAWCollab {
    /// Local user identity, used to tell "my lock" from "someone else's".
    local_user: UserId,
    /// Local display name, attached to locks this client acquires.
    local_username: String,
    tracks: HashMap<TrackId, Track>,
    regions: HashMap<RegionId, Region>,
    markers: HashMap<MarkerId, Marker>,
    effect_chains: HashMap<EffectChainId, EffectChain>,
    locks: LockTable,
    active_drag: Option<ActiveDrag>,
}

/// Outcome of a mutation attempt gated by a lock.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollabError {
    /// The element's lock is held by someone else.
    #[error("element is locked by another user")]
    Locked,
    /// The referenced entity doesn't exist locally.
    #[error("entity not found")]
    NotFound,
    /// The region failed its own invariants (see [`crate::daw::entities::Region::validate`]).
    #[error("invalid region: {0}")]
    InvalidRegion(#[from] crate::daw::entities::RegionInvariantError),
}

impl DAWCollab {
    /// Construct an empty collaboration layer for `local_user`.
    pub fn new(local_user: UserId, local_username: impl Into<String>) -> Self {
        Self {
            local_user,
            local_username: local_username.into(),
            tracks: HashMap::new(),
            regions: HashMap::new(),
            markers: HashMap::new(),
            effect_chains: HashMap::new(),
            locks: LockTable::new(),
            active_drag: None,
        }
    }

    // ---- read access -----------------------------------------------------

    /// Current lock on `target`, if any.
    pub fn is_locked(&self, target: LockTarget) -> Option<&crate::daw::lock::Lock> {
        self.locks.get(target)
    }

    /// Look up a track by id.
    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// Look up a region by id.
    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(&id)
    }

    /// Look up a marker by id.
    pub fn marker(&self, id: MarkerId) -> Option<&Marker> {
        self.markers.get(&id)
    }

    /// All tracks, unordered.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    /// All regions, unordered.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    // ---- locks -------------------------------------------------------

    /// Acquire a lock on `target` for the local user.
    pub fn acquire_lock(&mut self, target: LockTarget, now: Instant) -> Result<(), LockError> {
        self.locks.acquire(target, self.local_user.clone(), self.local_username.clone(), DEFAULT_LOCK_TTL, now)
    }

    /// Release a lock the local user holds on `target`.
    pub fn release_lock(&mut self, target: LockTarget) -> Result<(), LockError> {
        self.locks.release(target, &self.local_user)
    }

    /// Refresh a lock the local user holds (called periodically while an editor is open).
    pub fn refresh_lock(&mut self, target: LockTarget, now: Instant) -> Result<(), LockError> {
        self.locks.refresh(target, &self.local_user, now)
    }

    /// Sweep locks past their TTL; returns the targets that were released.
    pub fn sweep_stale_locks(&mut self, now: Instant) -> Vec<LockTarget> {
        self.locks.sweep_stale(now)
    }

    /// Whether `target` may be mutated by the local user right now: either
    /// unlocked, or locked by the local user themself.
    fn holds_or_unlocked(&self, target: LockTarget) -> bool {
        match self.locks.get(target) {
            None => true,
            Some(lock) => lock.user_id == self.local_user,
        }
    }

    // ---- tracks --------------------------------------------------------

    /// Add a track to the local snapshot (invoked for both local creates and inbound echoes).
    pub fn add_track(&mut self, track: Track) {
        self.tracks.insert(track.id, track);
    }

    /// Update a track's fields in place. Rejected if locked by someone else.
    pub fn update_track(&mut self, track: Track) -> Result<(), CollabError> {
        if !self.holds_or_unlocked(LockTarget::Track(track.id)) {
            return Err(CollabError::Locked);
        }
        self.tracks.insert(track.id, track);
        Ok(())
    }

    /// Remove a track and every region placed on it.
    pub fn delete_track(&mut self, id: TrackId) {
        self.tracks.remove(&id);
        self.regions.retain(|_, region| region.track_id != id);
    }

    // ---- regions ---------------------------------------------------------

    /// Add a region to the local snapshot.
    pub fn add_region(&mut self, region: Region) -> Result<(), CollabError> {
        region.validate()?;
        self.regions.insert(region.id, region);
        Ok(())
    }

    /// Update a region's fields directly. Rejected if locked by someone else (invariant 10).
    pub fn update_region(&mut self, region: Region) -> Result<(), CollabError> {
        if !self.holds_or_unlocked(LockTarget::Region(region.id)) {
            return Err(CollabError::Locked);
        }
        region.validate()?;
        self.regions.insert(region.id, region);
        Ok(())
    }

    /// Remove a region.
    pub fn delete_region(&mut self, id: RegionId) {
        self.regions.remove(&id);
    }

    // ---- notes (within MIDI regions) --------------------------------------

    /// Add a note to a MIDI region.
    pub fn add_note(&mut self, region_id: RegionId, note: Note) -> Result<(), CollabError> {
        let region = self.regions.get_mut(&region_id).ok_or(CollabError::NotFound)?;
        if let RegionPayload::Midi { notes, .. } = &mut region.payload {
            notes.push(note);
            Ok(())
        } else {
            Err(CollabError::NotFound)
        }
    }

    /// Update a note already present in a MIDI region.
    pub fn update_note(&mut self, region_id: RegionId, note: Note) -> Result<(), CollabError> {
        let region = self.regions.get_mut(&region_id).ok_or(CollabError::NotFound)?;
        if let RegionPayload::Midi { notes, .. } = &mut region.payload {
            if let Some(existing) = notes.iter_mut().find(|n| n.id == note.id) {
                *existing = note;
                Ok(())
            } else {
                Err(CollabError::NotFound)
            }
        } else {
            Err(CollabError::NotFound)
        }
    }

    /// Delete a note from a MIDI region.
    pub fn delete_note(&mut self, region_id: RegionId, note_id: NoteId) -> Result<(), CollabError> {
        let region = self.regions.get_mut(&region_id).ok_or(CollabError::NotFound)?;
        if let RegionPayload::Midi { notes, .. } = &mut region.payload {
            notes.retain(|n| n.id != note_id);
            Ok(())
        } else {
            Err(CollabError::NotFound)
        }
    }

    // ---- markers -----------------------------------------------------

    /// Create or update a marker.
    pub fn upsert_marker(&mut self, marker: Marker) {
        self.markers.insert(marker.id, marker);
    }

    /// Delete a marker.
    pub fn delete_marker(&mut self, id: MarkerId) {
        self.markers.remove(&id);
    }

    // ---- effect chains -----------------------------------------------

    /// Create or update an effect chain.
    pub fn upsert_effect_chain(&mut self, chain: EffectChain) {
        self.effect_chains.insert(chain.id, chain);
    }

    /// Delete an effect chain.
    pub fn delete_effect_chain(&mut self, id: EffectChainId) {
        self.effect_chains.remove(&id);
    }

    // ---- drag/resize streaming (§4.6) -------------------------------------

    /// Begin a drag on `region_ids`: attempt to lock every region. If any
    /// lock fails, previously-acquired locks in this call are released and
    /// the drag is aborted client-side.
    pub fn drag_start(&mut self, region_ids: Vec<RegionId>, now: Instant) -> Result<(), LockError> {
        let mut acquired = Vec::with_capacity(region_ids.len());
        for &region_id in &region_ids {
            match self.acquire_lock(LockTarget::Region(region_id), now) {
                Ok(()) => acquired.push(region_id),
                Err(err) => {
                    for rolled_back in acquired {
                        let _ = self.release_lock(LockTarget::Region(rolled_back));
                    }
                    return Err(err);
                }
            }
        }
        let origin_track =
            region_ids.first().and_then(|id| self.regions.get(id)).map(|r| r.track_id).unwrap_or_default();
        self.active_drag = Some(ActiveDrag { region_ids, origin_track });
        Ok(())
    }

    /// Apply a local in-progress preview update (move or resize) without
    /// releasing locks; callers forward this through EventPipeline as a
    /// Throttled/Batched `region_drag_update`.
    ///
    /// Cross-track moves are only honored when every dragged region started
    /// on the same track (§4.6 "Move across tracks"); otherwise the target
    /// track is ignored and only the horizontal shift applies.
    pub fn drag_preview(&mut self, region_id: RegionId, new_start: f64, target_track: TrackId) {
        let Some(region) = self.regions.get_mut(&region_id) else { return };
        let same_origin = self
            .active_drag
            .as_ref()
            .map(|drag| drag.region_ids.len() == 1 || drag.origin_track == target_track)
            .unwrap_or(true);
        region.start = new_start;
        if same_origin {
            region.track_id = target_track;
        }
    }

    /// Finalize a drag: release every lock it acquired. Returns the region
    /// ids that were part of the drag, for the caller to emit a canonical
    /// `region_move`/`region_resize` + `region_drag_end`.
    pub fn drag_end(&mut self) -> Vec<RegionId> {
        let Some(drag) = self.active_drag.take() else { return Vec::new() };
        for &region_id in &drag.region_ids {
            let _ = self.release_lock(LockTarget::Region(region_id));
        }
        drag.region_ids
    }

    /// Abort a drag without committing, releasing its locks.
    pub fn drag_abort(&mut self) {
        self.drag_end();
    }

    // ---- split -------------------------------------------------------

    /// Split a region at `position` (absolute beats on the track timeline).
    /// The left half keeps `region_id`; the right half gets a fresh id.
    /// Returns `(left, right)`. Invariant 9: `left.length + right.length == original length`.
    pub fn split_region(&mut self, region_id: RegionId, position: f64) -> Result<(RegionId, RegionId), CollabError> {
        let region = self.regions.get(&region_id).ok_or(CollabError::NotFound)?.clone();
        if position <= region.start || position >= region.start + region.length {
            warn!(?region_id, position, "split position outside region bounds, ignoring");
            return Err(CollabError::NotFound);
        }

        let left_len = position - region.start;
        let right_len = region.length - left_len;
        let right_id = RegionId::new();

        let (left_payload, right_payload) = match region.payload {
            RegionPayload::Midi { notes, sustain_events } => {
                let split_at = left_len;
                let left_notes: Vec<Note> = notes.iter().copied().filter(|n| n.start < split_at).collect();
                let right_notes: Vec<Note> = notes
                    .iter()
                    .copied()
                    .filter(|n| n.start >= split_at)
                    .map(|mut n| {
                        n.start -= split_at;
                        n
                    })
                    .collect();
                let left_sustain: Vec<SustainEvent> =
                    sustain_events.iter().copied().filter(|s| s.start < split_at).collect();
                let right_sustain: Vec<SustainEvent> = sustain_events
                    .iter()
                    .copied()
                    .filter(|s| s.start >= split_at)
                    .map(|mut s| {
                        s.start -= split_at;
                        s
                    })
                    .collect();
                (
                    RegionPayload::Midi { notes: left_notes, sustain_events: left_sustain },
                    RegionPayload::Midi { notes: right_notes, sustain_events: right_sustain },
                )
            }
            RegionPayload::Audio { url, trim_start, original_length } => (
                RegionPayload::Audio { url: url.clone(), trim_start, original_length },
                RegionPayload::Audio { url, trim_start: trim_start + left_len, original_length },
            ),
        };

        let left = Region {
            id: region.id,
            track_id: region.track_id,
            start: region.start,
            length: left_len,
            loop_enabled: region.loop_enabled,
            loop_iterations: region.loop_iterations,
            payload: left_payload,
        };
        let right = Region {
            id: right_id,
            track_id: region.track_id,
            start: position,
            length: right_len,
            loop_enabled: region.loop_enabled,
            loop_iterations: region.loop_iterations,
            payload: right_payload,
        };

        self.regions.insert(left.id, left);
        self.regions.insert(right.id, right);
        Ok((region_id, right_id))
    }

    // ---- head resize (§4.6) -------------------------------------------

    /// Resize a region's head by `delta` beats, preserving the absolute
    /// timeline position of every note/sustain event it contains (MIDI) or
    /// clamping the trim window (audio).
    pub fn head_resize(&mut self, region_id: RegionId, delta: f64) -> Result<(), CollabError> {
        let region = self.regions.get_mut(&region_id).ok_or(CollabError::NotFound)?;
        region.start += delta;
        region.length -= delta;

        match &mut region.payload {
            RegionPayload::Midi { notes, sustain_events } => {
                for note in notes.iter_mut() {
                    note.start -= delta;
                }
                for sustain in sustain_events.iter_mut() {
                    sustain.start -= delta;
                }
            }
            RegionPayload::Audio { trim_start, original_length, .. } => {
                *trim_start += delta;
                let max_len = (*original_length - *trim_start).max(crate::daw::entities::MIN_REGION_LEN);
                region.length = region.length.clamp(crate::daw::entities::MIN_REGION_LEN, max_len);
            }
        }
        Ok(())
    }

    // ---- snapshot/patch (§4.6) -----------------------------------------

    /// Replace the entire local snapshot wholesale (on room join / reconnect).
    pub fn apply_snapshot(&mut self, tracks: Vec<Track>, regions: Vec<Region>, markers: Vec<Marker>, effect_chains: Vec<EffectChain>) {
        self.tracks = tracks.into_iter().map(|t| (t.id, t)).collect();
        self.regions = regions.into_iter().map(|r| (r.id, r)).collect();
        self.markers = markers.into_iter().map(|m| (m.id, m)).collect();
        self.effect_chains = effect_chains.into_iter().map(|c| (c.id, c)).collect();
        self.locks = LockTable::new();
        self.active_drag = None;
    }

    /// Apply an inbound message, mutating local state where it's a DAW
    /// event. Returns `false` for messages this layer doesn't own, so
    /// callers (SessionFacade) can route those elsewhere.
    pub fn apply_inbound(&mut self, msg: &InboundMessage, now: Instant) -> bool {
        match msg {
            InboundMessage::DawSnapshot { tracks, regions, markers, effect_chains } => {
                self.apply_snapshot(tracks.clone(), regions.clone(), markers.clone(), effect_chains.clone());
                true
            }
            InboundMessage::TrackChanged { track, track_id } => {
                match track {
                    Some(track) => self.add_track(track.clone()),
                    None => self.delete_track(*track_id),
                }
                true
            }
            InboundMessage::RegionChanged { region, region_id } => {
                match region {
                    Some(region) => {
                        if let Err(err) = self.add_region(region.clone()) {
                            warn!(?err, "dropping invalid inbound region");
                        }
                    }
                    None => self.delete_region(*region_id),
                }
                true
            }
            InboundMessage::NoteChanged { region_id, note, note_id } => {
                let result = match note {
                    Some(note) => self
                        .update_note(*region_id, *note)
                        .or_else(|_| self.add_note(*region_id, *note)),
                    None => self.delete_note(*region_id, *note_id),
                };
                if let Err(err) = result {
                    warn!(?err, "dropping inbound note change for unknown region");
                }
                true
            }
            InboundMessage::RegionTransformPreview { region_id, region, user_id } => {
                if self.locks.get(LockTarget::Region(*region_id)).map(|l| &l.user_id) == Some(user_id) || self.locks.get(LockTarget::Region(*region_id)).is_none() {
                    self.regions.insert(*region_id, region.clone());
                } else {
                    warn!(?region_id, ?user_id, "discarding preview from non-lock-holder");
                }
                true
            }
            InboundMessage::RegionTransformCommit { region_id, region } => {
                self.regions.insert(*region_id, region.clone());
                true
            }
            InboundMessage::LockChanged { element_id, holder } => {
                let target = LockTarget::from(*element_id);
                match holder {
                    Some(user_id) => self.locks.apply_granted(target, user_id.clone(), "", DEFAULT_LOCK_TTL, now),
                    None => self.locks.apply_released(target),
                }
                true
            }
            InboundMessage::MarkerChanged { marker, marker_id } => {
                match marker {
                    Some(marker) => self.upsert_marker(marker.clone()),
                    None => self.delete_marker(*marker_id),
                }
                true
            }
            InboundMessage::EffectChainChanged { chain, chain_id } => {
                match chain {
                    Some(chain) => self.upsert_effect_chain(chain.clone()),
                    None => self.delete_effect_chain(*chain_id),
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::NoteId;

    fn collab() -> DAWCollab {
        DAWCollab::new("U1".into(), "alice")
    }

    fn midi_region(track: TrackId, start: f64, length: f64, notes: Vec<Note>) -> Region {
        Region {
            id: RegionId::new(),
            track_id: track,
            start,
            length,
            loop_enabled: false,
            loop_iterations: 1,
            payload: RegionPayload::Midi { notes, sustain_events: vec![] },
        }
    }

    #[test]
    fn mutation_is_rejected_without_holding_the_lock() {
        let mut collab = collab();
        let track = TrackId::new();
        collab.add_track(Track { id: track, name: "T".into(), instrument_id: None, order: 0, muted: false });
        let region = midi_region(track, 0.0, 4.0, vec![]);
        collab.add_region(region.clone()).unwrap();

        collab.locks.apply_granted(LockTarget::Region(region.id), "U2".into(), "bob", DEFAULT_LOCK_TTL, Instant::now());

        let mut edited = region.clone();
        edited.start = 1.0;
        let result = collab.update_region(edited);
        assert_eq!(result, Err(CollabError::Locked));
    }

    #[test]
    fn head_resize_preserves_absolute_note_position() {
        let mut collab = collab();
        let track = TrackId::new();
        let note_id = NoteId::new();
        let region = midi_region(
            track,
            4.0,
            8.0,
            vec![Note { id: note_id, start: 1.0, duration: 2.0, pitch: 60, velocity: 100 }],
        );
        let region_id = region.id;
        collab.add_region(region).unwrap();

        collab.head_resize(region_id, 2.0).unwrap();

        let after = collab.region(region_id).unwrap();
        assert_eq!(after.start, 6.0);
        assert_eq!(after.length, 6.0);
        if let RegionPayload::Midi { notes, .. } = &after.payload {
            assert_eq!(notes[0].start, -1.0);
            // 6.0 + (-1.0) == 4.0 + 1.0 == 5.0, absolute position preserved.
            assert_eq!(after.start + notes[0].start, 5.0);
        } else {
            panic!("expected midi region");
        }
    }

    #[test]
    fn split_preserves_total_length_and_ids() {
        let mut collab = collab();
        let track = TrackId::new();
        let region = midi_region(track, 0.0, 8.0, vec![]);
        let region_id = region.id;
        let original_length = region.length;
        collab.add_region(region).unwrap();

        let (left_id, right_id) = collab.split_region(region_id, 3.0).unwrap();
        assert_eq!(left_id, region_id);
        assert_ne!(right_id, region_id);

        let left = collab.region(left_id).unwrap();
        let right = collab.region(right_id).unwrap();
        assert!((left.length + right.length - original_length).abs() < 1e-9);
    }

    #[test]
    fn drag_start_fails_atomically_if_any_region_is_locked() {
        let mut collab = collab();
        let track = TrackId::new();
        let r1 = midi_region(track, 0.0, 4.0, vec![]);
        let r2 = midi_region(track, 4.0, 4.0, vec![]);
        let (id1, id2) = (r1.id, r2.id);
        collab.add_region(r1).unwrap();
        collab.add_region(r2).unwrap();

        collab.locks.apply_granted(LockTarget::Region(id2), "U2".into(), "bob", DEFAULT_LOCK_TTL, Instant::now());

        let result = collab.drag_start(vec![id1, id2], Instant::now());
        assert!(result.is_err());
        assert!(collab.is_locked(LockTarget::Region(id1)).is_none());
    }

    #[test]
    fn drag_end_releases_all_locks_acquired_by_the_drag() {
        let mut collab = collab();
        let track = TrackId::new();
        let r1 = midi_region(track, 0.0, 4.0, vec![]);
        let id1 = r1.id;
        collab.add_region(r1).unwrap();

        collab.drag_start(vec![id1], Instant::now()).unwrap();
        assert!(collab.is_locked(LockTarget::Region(id1)).is_some());
        collab.drag_end();
        assert!(collab.is_locked(LockTarget::Region(id1)).is_none());
    }
}
