//! Outbound event pipeline: immediate/throttled/batched classification, note
//! dedup, and the disconnected-socket pending queue (C4).
//!
//! `RateLimiter` is the one generic primitive backing both the throttle
//! windows and the batch timer, per the redesign notes — rather than three
//! bespoke debounce/throttle/batch implementations, one parameterized type
//! with a leading/trailing/both mode.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::ids::UserId;
use crate::protocol::{NoteEventType, OutboundMessage, SocketFrame};

/// Longest the disconnected-socket pending queue is allowed to grow (§4.4, §5).
const PENDING_QUEUE_CAP: usize = 100;

/// Batch window for coalesced low-priority events (§4.4, §6 GLOSSARY "Batch window").
const BATCH_WINDOW: Duration = Duration::from_millis(8);

/// Default note dedup window.
const NOTE_DEDUP_WINDOW_DEFAULT: Duration = Duration::from_millis(20);

/// Note dedup window for drum-category instruments.
const NOTE_DEDUP_WINDOW_DRUM: Duration = Duration::from_millis(10);

/// Size above which the dedup map is garbage-collected.
const DEDUP_GC_THRESHOLD: usize = 200;

/// Throttle rate for the parameter-stream path of `update_synth_params`.
const SYNTH_PARAM_STREAM_RATE: Duration = Duration::from_millis(10);

/// Throttle rate for `update_effects_chain`.
const EFFECTS_CHAIN_STREAM_RATE: Duration = Duration::from_millis(200);

/// Throttle rate for region drag/resize streaming (§4.6).
const REGION_DRAG_STREAM_RATE: Duration = Duration::from_millis(16);

/// How an outbound event is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Sent immediately (or queued if disconnected).
    Immediate,
    /// Rate-limited to at most one emission per `rate`, per the given mode.
    Throttled(Duration),
    /// Coalesced with same-key events and flushed on the shared batch timer.
    Batched,
}

/// Default classification for an outbound message sent through [`EventPipeline::submit`]
/// (§4.4 table; `update_synth_params`/`update_effects_chain` default to Immediate here —
/// callers on the parameter-stream path use [`EventPipeline::submit_stream`] instead).
fn classify(msg: &OutboundMessage) -> Classification {
    use OutboundMessage::*;
    match msg {
        ChatMessage { .. } => Classification::Batched,
        RegionDragUpdate { .. } => Classification::Throttled(REGION_DRAG_STREAM_RATE),
        _ => Classification::Immediate,
    }
}

/// Leading/trailing behavior for [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterMode {
    /// Emit the first submission in a window immediately, drop the rest.
    Leading,
    /// Never emit immediately; always wait for the next `tick`.
    Trailing,
    /// Emit immediately on the first submission of a window, and also
    /// flush the latest submission on `tick` if more arrived afterward.
    Both,
}

/// A single generic throttle/batch primitive (REDESIGN FLAGS: one
/// `RateLimiter(rate, mode)` type instead of bespoke throttle/debounce/batch code).
pub struct RateLimiter<T> {
    rate: Duration,
    mode: RateLimiterMode,
    last_emit: Option<Instant>,
    pending: Option<T>,
}

impl<T: Clone> RateLimiter<T> {
    /// Construct a limiter with the given rate and edge mode.
    pub fn new(rate: Duration, mode: RateLimiterMode) -> Self {
        Self { rate, mode, last_emit: None, pending: None }
    }

    /// Submit a value. Returns `Some(value)` if it should be emitted right
    /// now (leading edge fired), otherwise stores it as pending for the next `tick`.
    pub fn submit(&mut self, value: T, now: Instant) -> Option<T> {
        let window_elapsed = self.last_emit.map_or(true, |t| now.duration_since(t) >= self.rate);
        let leading_fires = matches!(self.mode, RateLimiterMode::Leading | RateLimiterMode::Both) && window_elapsed;
        if leading_fires {
            self.last_emit = Some(now);
            self.pending = None;
            Some(value)
        } else {
            self.pending = Some(value);
            None
        }
    }

    /// Called periodically (or at batch-flush time). Returns the trailing
    /// emission if one is due and pending.
    pub fn tick(&mut self, now: Instant) -> Option<T> {
        let due = self.last_emit.map_or(true, |t| now.duration_since(t) >= self.rate);
        if !due {
            return None;
        }
        let value = self.pending.take()?;
        self.last_emit = Some(now);
        Some(value)
    }
}

/// Dedup key mirroring §3's `NoteDedupKey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NoteDedupKey {
    event_type: NoteEventType,
    notes: Vec<u8>,
    instrument: String,
    velocity: u8,
}

/// Result of submitting a message to the pipeline.
#[derive(Debug)]
pub enum PipelineAction {
    /// Send this frame on the active socket right now.
    Send(SocketFrame),
    /// Socket was disconnected; the message was appended to the pending queue.
    Queued,
    /// Absorbed into a throttle/batch buffer; nothing to send yet.
    Held,
    /// Dropped: note dedup, or pending-queue overflow.
    Dropped,
}

/// Outbound event pipeline (C4).
pub struct EventPipeline {
    local_user: UserId,
    connected: bool,
    pending: VecDeque<OutboundMessage>,
    batch_buffer: HashMap<(&'static str, String), OutboundMessage>,
    last_batch_flush: Option<Instant>,
    throttles: HashMap<&'static str, RateLimiter<OutboundMessage>>,
    note_dedup: HashMap<NoteDedupKey, Instant>,
}

impl EventPipeline {
    /// Construct a pipeline for `local_user`, starting disconnected.
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            connected: false,
            pending: VecDeque::new(),
            batch_buffer: HashMap::new(),
            last_batch_flush: None,
            throttles: HashMap::new(),
            note_dedup: HashMap::new(),
        }
    }

    /// Update connection state. Transitioning to connected does not itself
    /// drain the pending queue; call [`EventPipeline::drain_pending`] for that.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Submit an outbound message using its default classification (§4.4).
    pub fn submit(&mut self, msg: OutboundMessage, now: Instant) -> PipelineAction {
        if let OutboundMessage::PlayNote { .. } = &msg {
            if self.is_note_deduped(&msg, now) {
                return PipelineAction::Dropped;
            }
        }
        match classify(&msg) {
            Classification::Immediate => self.emit_immediate(msg),
            Classification::Throttled(rate) => self.emit_throttled(msg, rate, RateLimiterMode::Both, now),
            Classification::Batched => self.emit_batched(msg, now),
        }
    }

    /// Submit a message on an explicit streaming path, forcing Throttled
    /// classification regardless of the default (`update_synth_params` and
    /// `update_effects_chain` are Immediate by default but Throttled when
    /// driven by a continuous parameter stream — §4.4).
    pub fn submit_stream(&mut self, msg: OutboundMessage, now: Instant) -> PipelineAction {
        let rate = match &msg {
            OutboundMessage::UpdateSynthParams { .. } => SYNTH_PARAM_STREAM_RATE,
            OutboundMessage::UpdateEffectsChain { .. } => EFFECTS_CHAIN_STREAM_RATE,
            _ => return self.submit(msg, now),
        };
        self.emit_throttled(msg, rate, RateLimiterMode::Both, now)
    }

    fn emit_immediate(&mut self, msg: OutboundMessage) -> PipelineAction {
        if !self.connected {
            if self.pending.len() >= PENDING_QUEUE_CAP {
                let drop_count = self.pending.len() / 2;
                for _ in 0..drop_count {
                    self.pending.pop_front();
                }
            }
            self.pending.push_back(msg);
            return PipelineAction::Queued;
        }
        PipelineAction::Send(msg.into_frame())
    }

    fn emit_throttled(
        &mut self,
        msg: OutboundMessage,
        rate: Duration,
        mode: RateLimiterMode,
        now: Instant,
    ) -> PipelineAction {
        let key = msg.event_name();
        let limiter = self.throttles.entry(key).or_insert_with(|| RateLimiter::new(rate, mode));
        match limiter.submit(msg, now) {
            Some(value) => PipelineAction::Send(value.into_frame()),
            None => PipelineAction::Held,
        }
    }

    fn emit_batched(&mut self, msg: OutboundMessage, now: Instant) -> PipelineAction {
        let (event, user) = msg.coalesce_key(&self.local_user);
        self.batch_buffer.insert((event, user), msg);
        self.last_batch_flush.get_or_insert(now);
        PipelineAction::Held
    }

    /// Drive timers: flush the batch buffer if its window elapsed, and flush
    /// any throttled limiter whose trailing edge is due. Call on a regular
    /// cadence (e.g. every few ms) from the event loop's `tokio::select!`.
    pub fn tick(&mut self, now: Instant) -> Vec<SocketFrame> {
        let mut frames = Vec::new();

        if let Some(started) = self.last_batch_flush {
            if now.duration_since(started) >= BATCH_WINDOW {
                frames.extend(self.batch_buffer.drain().map(|(_, msg)| msg.into_frame()));
                self.last_batch_flush = None;
            }
        }

        for limiter in self.throttles.values_mut() {
            if let Some(msg) = limiter.tick(now) {
                frames.push(msg.into_frame());
            }
        }

        frames
    }

    /// Drain the pending (disconnected-socket) queue, oldest first. Intended
    /// to be called once on reconnect.
    pub fn drain_pending(&mut self) -> Vec<OutboundMessage> {
        self.pending.drain(..).collect()
    }

    /// Current pending-queue depth, for diagnostics/tests.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Clear all timers and queues (facade teardown / `disconnect()`, §5 Cancellation).
    pub fn reset(&mut self) {
        self.pending.clear();
        self.batch_buffer.clear();
        self.last_batch_flush = None;
        self.throttles.clear();
        self.note_dedup.clear();
    }

    fn is_note_deduped(&mut self, msg: &OutboundMessage, now: Instant) -> bool {
        let OutboundMessage::PlayNote { notes, velocity, instrument, category, event_type, .. } = msg else {
            return false;
        };
        if !event_type.is_dedup_eligible() {
            return false;
        }
        // Polyphonic note-on events (chords) pass through undeduped.
        if notes.len() > 1 {
            return false;
        }
        let window =
            if category.eq_ignore_ascii_case("drums") { NOTE_DEDUP_WINDOW_DRUM } else { NOTE_DEDUP_WINDOW_DEFAULT };

        let mut sorted_notes = notes.clone();
        sorted_notes.sort_unstable();
        let key = NoteDedupKey {
            event_type: *event_type,
            notes: sorted_notes,
            instrument: instrument.0.clone(),
            velocity: *velocity,
        };

        if self.note_dedup.len() > DEDUP_GC_THRESHOLD {
            self.gc_note_dedup(now);
        }

        if let Some(last) = self.note_dedup.get(&key) {
            if now.duration_since(*last) < window {
                return true;
            }
        }
        self.note_dedup.insert(key, now);
        false
    }

    fn gc_note_dedup(&mut self, now: Instant) {
        let max_window = NOTE_DEDUP_WINDOW_DEFAULT.max(NOTE_DEDUP_WINDOW_DRUM);
        let ttl = max_window * 3;
        let before = self.note_dedup.len();
        self.note_dedup.retain(|_, last| now.duration_since(*last) < ttl);
        trace!(evicted = before - self.note_dedup.len(), "note dedup map garbage collected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::InstrumentId;

    fn note(event_type: NoteEventType, notes: Vec<u8>, category: &str) -> OutboundMessage {
        OutboundMessage::PlayNote {
            notes,
            velocity: 100,
            instrument: InstrumentId::from("analog_mono"),
            category: category.to_owned(),
            event_type,
            is_key_held: None,
        }
    }

    #[test]
    fn batched_events_with_same_key_coalesce_to_latest_payload() {
        let mut pipeline = EventPipeline::new("U1".into());
        pipeline.set_connected(true);
        let t0 = Instant::now();

        for x in [1, 2, 3] {
            let action = pipeline.submit(
                OutboundMessage::ChatMessage { room_id: "R1".into(), message: format!("x={x}") },
                t0,
            );
            assert!(matches!(action, PipelineAction::Held));
        }

        let frames = pipeline.tick(t0 + BATCH_WINDOW);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data["message"], serde_json::json!("x=3"));
    }

    #[test]
    fn note_dedup_collapses_repeated_note_on_but_never_note_off() {
        let mut pipeline = EventPipeline::new("U1".into());
        pipeline.set_connected(true);
        let t0 = Instant::now();

        let first = pipeline.submit(note(NoteEventType::NoteOn, vec![60], "Synthesizer"), t0);
        assert!(matches!(first, PipelineAction::Send(_)));

        let dup = pipeline.submit(note(NoteEventType::NoteOn, vec![60], "Synthesizer"), t0 + Duration::from_millis(10));
        assert!(matches!(dup, PipelineAction::Dropped));

        let off = pipeline.submit(note(NoteEventType::NoteOff, vec![60], "Synthesizer"), t0 + Duration::from_millis(15));
        assert!(matches!(off, PipelineAction::Send(_)));
    }

    #[test]
    fn polyphonic_note_on_is_never_deduped() {
        let mut pipeline = EventPipeline::new("U1".into());
        pipeline.set_connected(true);
        let t0 = Instant::now();

        let first = pipeline.submit(note(NoteEventType::NoteOn, vec![60, 64, 67], "Synthesizer"), t0);
        let second = pipeline.submit(note(NoteEventType::NoteOn, vec![60, 64, 67], "Synthesizer"), t0);
        assert!(matches!(first, PipelineAction::Send(_)));
        assert!(matches!(second, PipelineAction::Send(_)));
    }

    #[test]
    fn disconnected_immediate_events_queue_and_overflow_drops_oldest_half() {
        let mut pipeline = EventPipeline::new("U1".into());
        let t0 = Instant::now();
        for i in 0..PENDING_QUEUE_CAP {
            let action = pipeline.submit(
                OutboundMessage::ChangeInstrument { instrument: format!("i{i}").into(), category: "Melodic".into() },
                t0,
            );
            assert!(matches!(action, PipelineAction::Queued));
        }
        assert_eq!(pipeline.pending_len(), PENDING_QUEUE_CAP);

        pipeline.submit(
            OutboundMessage::ChangeInstrument { instrument: "overflow".into(), category: "Melodic".into() },
            t0,
        );
        assert_eq!(pipeline.pending_len(), PENDING_QUEUE_CAP / 2 + 1);
    }

    #[test]
    fn throttled_stream_emits_leading_then_trailing_latest() {
        let mut pipeline = EventPipeline::new("U1".into());
        pipeline.set_connected(true);
        let t0 = Instant::now();

        let leading = pipeline.submit_stream(
            OutboundMessage::UpdateSynthParams { params: serde_json::json!({"cutoff": 1}) },
            t0,
        );
        assert!(matches!(leading, PipelineAction::Send(_)));

        let held = pipeline.submit_stream(
            OutboundMessage::UpdateSynthParams { params: serde_json::json!({"cutoff": 2}) },
            t0 + Duration::from_millis(2),
        );
        assert!(matches!(held, PipelineAction::Held));

        let frames = pipeline.tick(t0 + Duration::from_millis(11));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data["params"]["cutoff"], serde_json::json!(2));
    }

    #[test]
    fn reset_clears_queues_and_timers() {
        let mut pipeline = EventPipeline::new("U1".into());
        let t0 = Instant::now();
        pipeline.submit(OutboundMessage::Ping, t0);
        pipeline.submit(OutboundMessage::ChatMessage { room_id: "R1".into(), message: "hi".into() }, t0);
        pipeline.reset();
        assert_eq!(pipeline.pending_len(), 0);
        assert!(pipeline.tick(t0 + Duration::from_secs(1)).is_empty());
    }
}
