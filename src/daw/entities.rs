//! DAW entity types: tracks, regions, notes, markers, effect chains (§3).
//!
//! `Region` follows a common split for tagged content: one struct carries
//! the fields common to every region, an inner enum carries the
//! type-specific payload (MIDI notes vs. an audio clip reference).

use serde::{Deserialize, Serialize};

use crate::ids::{EffectChainId, InstrumentId, MarkerId, RegionId, TrackId, UserId};

/// Shortest a region is allowed to be, in beats.
pub const MIN_REGION_LEN: f64 = 0.25;

/// A track: an ordered lane regions are placed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Stable identifier, minted by the originating client.
    pub id: TrackId,
    /// Display name.
    pub name: String,
    /// Instrument assigned to this track, if any.
    pub instrument_id: Option<InstrumentId>,
    /// Display order among sibling tracks.
    pub order: usize,
    /// Muted tracks are excluded from local playback (purely a UI/audio concern).
    pub muted: bool,
}

/// A single MIDI note within a region, positioned relative to the region's own start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// Unique id, stable across edits.
    pub id: crate::ids::NoteId,
    /// Offset from the region's start, in beats. May go negative after a head resize.
    pub start: f64,
    /// Duration in beats.
    pub duration: f64,
    /// MIDI pitch number.
    pub pitch: u8,
    /// Velocity, 0-127.
    pub velocity: u8,
}

/// A sustain-pedal on/off event within a region, relative to the region's start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SustainEvent {
    /// Offset from the region's start, in beats.
    pub start: f64,
    /// Duration in beats.
    pub duration: f64,
}

/// Type-specific region payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionPayload {
    /// A MIDI region: notes plus sustain-pedal events.
    Midi {
        /// Notes contained in this region.
        notes: Vec<Note>,
        /// Sustain-pedal events contained in this region.
        sustain_events: Vec<SustainEvent>,
    },
    /// An audio region referencing an uploaded clip.
    Audio {
        /// URL of the audio asset (see the external upload surface in §6).
        url: String,
        /// Offset into the source asset this region starts playing from.
        trim_start: f64,
        /// Full duration of the underlying asset, in beats.
        original_length: f64,
    },
}

/// A time-bounded block placed on a track (§3, GLOSSARY "Region").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Stable identifier, minted by the originating client.
    pub id: RegionId,
    /// Track this region is placed on.
    pub track_id: TrackId,
    /// Start position, in beats, on the track's timeline.
    pub start: f64,
    /// Length, in beats. Invariant: `length >= MIN_REGION_LEN`.
    pub length: f64,
    /// Whether this region loops.
    pub loop_enabled: bool,
    /// Number of loop repetitions. Invariant: `>= 1`.
    pub loop_iterations: u32,
    /// Type-specific payload.
    pub payload: RegionPayload,
}

/// Error describing why a [`Region`] failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionInvariantError {
    /// `length` fell under [`MIN_REGION_LEN`].
    #[error("region length {0} is below the minimum of {MIN_REGION_LEN}")]
    TooShort(f64),
    /// `loopIterations` was zero.
    #[error("loop_iterations must be at least 1")]
    ZeroLoopIterations,
    /// For audio regions, `trimStart + length` exceeded `originalLength`.
    #[error("trim_start ({trim_start}) + length ({length}) exceeds original_length ({original_length})")]
    TrimExceedsSource {
        /// Offending trim start.
        trim_start: f64,
        /// Offending length.
        length: f64,
        /// Source asset length.
        original_length: f64,
    },
}

impl Region {
    /// Validate the invariants from §3: minimum length, loop iteration
    /// count, and (for audio) trim-within-source.
    pub fn validate(&self) -> Result<(), RegionInvariantError> {
        if self.length < MIN_REGION_LEN {
            return Err(RegionInvariantError::TooShort(self.length));
        }
        if self.loop_iterations < 1 {
            return Err(RegionInvariantError::ZeroLoopIterations);
        }
        if let RegionPayload::Audio { trim_start, original_length, .. } = &self.payload {
            if trim_start + self.length > *original_length {
                return Err(RegionInvariantError::TrimExceedsSource {
                    trim_start: *trim_start,
                    length: self.length,
                    original_length: *original_length,
                });
            }
        }
        Ok(())
    }
}

/// A labeled point on the shared timeline, visible to every participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    /// Stable identifier.
    pub id: MarkerId,
    /// Position, in beats.
    pub position: f64,
    /// Display label.
    pub label: String,
}

/// One stage in a per-track or per-user effect chain.
///
/// Effect parameters are opaque to the engine (owned by the instrument/mixer
/// layer); it only needs to move them between wire and local state intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectStage {
    /// Effect type name (e.g. `"reverb"`, `"delay"`).
    pub effect_type: String,
    /// Opaque parameter blob.
    pub params: serde_json::Value,
}

/// What an effect chain is routed onto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectChainTarget {
    /// Routed onto a track's output.
    Track {
        /// Track the chain applies to.
        track_id: TrackId,
    },
    /// Routed onto a user's live input (their instrument channel in the mixer).
    User {
        /// User the chain applies to.
        user_id: UserId,
    },
}

/// A named, ordered sequence of effect stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectChain {
    /// Stable identifier.
    pub id: EffectChainId,
    /// What this chain is routed onto.
    pub target: EffectChainTarget,
    /// Ordered effect stages.
    pub stages: Vec<EffectStage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn midi_region(start: f64, length: f64, notes: Vec<Note>) -> Region {
        Region {
            id: RegionId::new(),
            track_id: TrackId::new(),
            start,
            length,
            loop_enabled: false,
            loop_iterations: 1,
            payload: RegionPayload::Midi { notes, sustain_events: vec![] },
        }
    }

    #[test]
    fn rejects_region_below_minimum_length() {
        let region = midi_region(0.0, 0.1, vec![]);
        assert_eq!(region.validate(), Err(RegionInvariantError::TooShort(0.1)));
    }

    #[test]
    fn rejects_zero_loop_iterations() {
        let mut region = midi_region(0.0, 1.0, vec![]);
        region.loop_iterations = 0;
        assert_eq!(region.validate(), Err(RegionInvariantError::ZeroLoopIterations));
    }

    #[test]
    fn rejects_audio_trim_past_source_end() {
        let region = Region {
            id: RegionId::new(),
            track_id: TrackId::new(),
            start: 0.0,
            length: 4.0,
            loop_enabled: false,
            loop_iterations: 1,
            payload: RegionPayload::Audio { url: "https://x/y.wav".into(), trim_start: 8.0, original_length: 10.0 },
        };
        assert!(region.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_region() {
        let region = midi_region(
            4.0,
            8.0,
            vec![Note { id: crate::ids::NoteId::new(), start: 1.0, duration: 2.0, pitch: 60, velocity: 100 }],
        );
        assert!(region.validate().is_ok());
    }
}
