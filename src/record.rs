//! Local recording lifecycle and remote recording preview mirroring (§4.7).

use crate::daw::entities::{Note, Region, RegionPayload};
use crate::ids::{NoteId, RegionId, TrackId, UserId};

/// What's being captured: a live MIDI performance or a microphone/line-in recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingKind {
    /// Captured notes become a MIDI region.
    Midi,
    /// Captured samples become an audio region, once uploaded.
    Audio,
}

/// In-progress local recording state.
#[derive(Debug, Clone)]
struct ActiveRecording {
    /// What's being recorded.
    kind: RecordingKind,
    /// Track the resulting region will be placed on.
    track_id: TrackId,
    /// Where on the timeline the region starts, in beats.
    start_beat: f64,
    /// Elapsed duration so far, in beats. Grows on every clock tick.
    duration_beats: f64,
    /// Notes captured so far (MIDI recordings only).
    notes: Vec<Note>,
}

/// A remote user's recording indicator, mirrored for the local timeline's
/// dashed preview block. Carries identity only: the wire protocol reports
/// recording state as a simple on/off toggle, not a live position stream, so
/// the preview has no independently-tracked start/duration of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePreview {
    /// User who is recording.
    pub user_id: UserId,
    /// Track the recording is believed to target, if known.
    pub track_id: Option<TrackId>,
}

/// Upper bound on captured MIDI notes before a recording is force-stopped
/// (a generous backstop, not a creative limit).
pub const MAX_CAPTURED_NOTES: usize = 10_000;

/// Tracks the local user's in-progress recording and mirrors remote users'
/// recording indicators (§4.7).
#[derive(Default)]
pub struct RecordCoord {
    /// Local recording, if one is in progress.
    active: Option<ActiveRecording>,
    /// Remote recording previews, keyed by user id.
    remote_previews: std::collections::HashMap<UserId, RemotePreview>,
}

/// What starting a MIDI recording needs to know up front.
#[derive(Debug, Clone)]
pub struct StartRecording {
    /// What's being captured.
    pub kind: RecordingKind,
    /// Track the resulting region lands on.
    pub track_id: TrackId,
    /// Timeline position the recording starts at, in beats.
    pub start_beat: f64,
}

impl RecordCoord {
    /// Construct a coordinator with no recording in progress.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the local user currently has a recording in progress.
    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Track the in-progress recording targets, if any. Callers use this to
    /// resolve an upload destination before calling `stop`, since `stop`
    /// itself mints the region id only once the recording finishes.
    pub fn active_track_id(&self) -> Option<TrackId> {
        self.active.as_ref().map(|r| r.track_id)
    }

    /// Begin local recording. A recording already in progress is replaced
    /// (the caller is expected to have called `stop` first; this guards
    /// against losing in-flight state silently rather than panicking).
    pub fn start(&mut self, request: StartRecording) {
        self.active = Some(ActiveRecording {
            kind: request.kind,
            track_id: request.track_id,
            start_beat: request.start_beat,
            duration_beats: 0.0,
            notes: Vec::new(),
        });
    }

    /// Record a captured MIDI note relative to the recording's start. No-op
    /// if no MIDI recording is in progress, or the capture cap was hit.
    pub fn capture_note(&mut self, pitch: u8, velocity: u8, offset_beats: f64, duration_beats: f64) {
        if let Some(recording) = &mut self.active {
            if recording.kind == RecordingKind::Midi && recording.notes.len() < MAX_CAPTURED_NOTES {
                recording.notes.push(Note { id: NoteId::new(), start: offset_beats, duration: duration_beats, pitch, velocity });
            }
        }
    }

    /// Advance the recording's duration on a clock tick. Returns `true` if
    /// the recording hit the buffer limit and was force-stopped (caller
    /// should still call `stop` to emit the region).
    pub fn tick(&mut self, elapsed_beats: f64, max_duration_beats: f64) -> bool {
        let Some(recording) = &mut self.active else { return false };
        recording.duration_beats += elapsed_beats;
        recording.duration_beats >= max_duration_beats
    }

    /// Stop the local recording and produce the region to emit as
    /// `region_added`, if one was in progress. For audio recordings, `asset`
    /// supplies the uploaded clip's url/length (via `AudioUploader`,
    /// resolved by the caller before calling `stop`).
    pub fn stop(&mut self, asset: Option<(String, f64)>) -> Option<Region> {
        let recording = self.active.take()?;
        let payload = match recording.kind {
            RecordingKind::Midi => RegionPayload::Midi { notes: recording.notes, sustain_events: Vec::new() },
            RecordingKind::Audio => {
                let (url, original_length) = asset.unwrap_or_default();
                RegionPayload::Audio { url, trim_start: 0.0, original_length }
            }
        };
        Some(Region {
            id: RegionId::new(),
            track_id: recording.track_id,
            start: recording.start_beat,
            length: recording.duration_beats.max(crate::daw::entities::MIN_REGION_LEN),
            loop_enabled: false,
            loop_iterations: 1,
            payload,
        })
    }

    /// Discard the in-progress recording without emitting a region.
    pub fn cancel(&mut self) {
        self.active = None;
    }

    /// Current remote previews, for rendering dashed preview blocks.
    pub fn remote_previews(&self) -> impl Iterator<Item = &RemotePreview> {
        self.remote_previews.values()
    }

    /// Apply an inbound `remote_recording_state_changed`: insert or remove
    /// the preview for `user_id` depending on `recording`.
    pub fn apply_remote_recording_state_changed(&mut self, user_id: UserId, recording: bool) {
        if recording {
            self.remote_previews.insert(user_id.clone(), RemotePreview { user_id, track_id: None });
        } else {
            self.remote_previews.remove(&user_id);
        }
    }

    /// Remove a departed user's preview, if any (mirrors `handle_user_left`
    /// semantics — a left user can't still be recording).
    pub fn clear_user(&mut self, user_id: &UserId) {
        self.remote_previews.remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_with_no_recording_in_progress_returns_none() {
        let mut coord = RecordCoord::new();
        assert!(coord.stop(None).is_none());
    }

    #[test]
    fn midi_recording_round_trips_captured_notes_into_a_region() {
        let mut coord = RecordCoord::new();
        coord.start(StartRecording { kind: RecordingKind::Midi, track_id: TrackId::new(), start_beat: 4.0 });
        coord.capture_note(60, 100, 0.0, 1.0);
        coord.capture_note(64, 90, 1.0, 1.0);
        coord.tick(2.0, 100.0);
        let region = coord.stop(None).unwrap();
        assert_eq!(region.start, 4.0);
        assert_eq!(region.length, 2.0);
        match region.payload {
            RegionPayload::Midi { notes, .. } => assert_eq!(notes.len(), 2),
            _ => panic!("expected midi payload"),
        }
        assert!(!coord.is_recording());
    }

    #[test]
    fn tick_reports_buffer_limit_hit() {
        let mut coord = RecordCoord::new();
        coord.start(StartRecording { kind: RecordingKind::Audio, track_id: TrackId::new(), start_beat: 0.0 });
        assert!(!coord.tick(5.0, 10.0));
        assert!(coord.tick(5.0, 10.0));
    }

    #[test]
    fn audio_recording_uses_provided_asset_on_stop() {
        let mut coord = RecordCoord::new();
        coord.start(StartRecording { kind: RecordingKind::Audio, track_id: TrackId::new(), start_beat: 0.0 });
        coord.tick(8.0, 100.0);
        let region = coord.stop(Some(("https://x/y.wav".into(), 8.0))).unwrap();
        match region.payload {
            RegionPayload::Audio { url, original_length, .. } => {
                assert_eq!(url, "https://x/y.wav");
                assert_eq!(original_length, 8.0);
            }
            _ => panic!("expected audio payload"),
        }
    }

    #[test]
    fn remote_preview_set_and_clear() {
        let mut coord = RecordCoord::new();
        let user = UserId::from("u1");
        coord.apply_remote_recording_state_changed(user.clone(), true);
        assert_eq!(coord.remote_previews().count(), 1);
        coord.apply_remote_recording_state_changed(user.clone(), false);
        assert_eq!(coord.remote_previews().count(), 0);
    }

    #[test]
    fn cancel_discards_recording_without_emitting() {
        let mut coord = RecordCoord::new();
        coord.start(StartRecording { kind: RecordingKind::Midi, track_id: TrackId::new(), start_beat: 0.0 });
        coord.cancel();
        assert!(!coord.is_recording());
        assert!(coord.stop(None).is_none());
    }
}
