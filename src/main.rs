//! Terminal harness for `bandroom_session`: connects one participant to a
//! jam room over a real WebSocket and lets a human play notes from the
//! keyboard in a raw-terminal loop, driven by
//! [`bandroom_session::facade::SessionFacade`]. Manual testing only, not a
//! full DAW UI (out of scope, §1 Non-goals).

use std::io::Write;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal;
use futures::StreamExt;

use bandroom_session::audio_manager::{AudioEngineError, InstrumentCompatibility, InstrumentEngine, InstrumentLoad};
use bandroom_session::config::{to_ws_origin, Cli};
use bandroom_session::facade::{AudioUploader, FacadeEvent, SessionFacade};
use bandroom_session::ids::{InstrumentId, RegionId, RoomId, TrackId, UserId};
use bandroom_session::protocol::NoteEventType;
use bandroom_session::session_store::SessionStore;
use bandroom_session::transport::ws::WsTransportFactory;
use bandroom_session::version::Version;

/// Stand-in for the real synthesis engine: this crate never renders audio
/// itself (Non-goal, §1), so the demo harness just logs what it's told.
struct LoggingInstrumentEngine;

#[async_trait::async_trait]
impl InstrumentEngine for LoggingInstrumentEngine {
    async fn ensure_context_running(&self) -> Result<bool, AudioEngineError> {
        Ok(true)
    }

    async fn preload(&self, loads: &[InstrumentLoad]) -> Result<(), AudioEngineError> {
        for load in loads {
            tracing::info!(user = %load.user_id, instrument = %load.instrument, "preload (no-op demo engine)");
        }
        Ok(())
    }

    async fn cleanup_remote_user(&self, user_id: &UserId) {
        tracing::debug!(%user_id, "cleanup_remote_user (no-op demo engine)");
    }

    async fn apply_effect_chain(&self, user_id: &UserId, _chains: &serde_json::Value) {
        tracing::debug!(%user_id, "apply_effect_chain (no-op demo engine)");
    }

    async fn resume_on_interaction(&self) -> Result<(), AudioEngineError> {
        Ok(())
    }
}

/// No compatible-instrument table ships with the demo harness.
struct NoCompatibility;

impl InstrumentCompatibility for NoCompatibility {
    fn fallback_for(&self, _category: &str, _failed_instrument: &InstrumentId) -> Option<InstrumentId> {
        None
    }
}

/// Audio-clip upload is an external HTTP surface this crate never owns
/// (Non-goal, §1); the demo harness has nothing to upload to.
struct NoUploader;

#[async_trait::async_trait]
impl AudioUploader for NoUploader {
    async fn upload(
        &self,
        _room_id: &RoomId,
        _region_id: &RegionId,
        _track_id: &TrackId,
        _user_id: &UserId,
        _bytes: Vec<u8>,
    ) -> Result<(String, f64), String> {
        Err("audio upload is not available in the terminal harness".into())
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let _logging_guard = bandroom_session::logging::init(cli.disable_colors);

    tracing::info!(version = %Version::default(), "bandroom-session-cli starting up");

    let ws_origin = to_ws_origin(&cli.resolved_backend_url());
    let local_user = UserId::from(uuid::Uuid::new_v4().to_string());
    let local_username = cli.username.clone();

    let (mut facade, handle) = SessionFacade::new(
        local_user,
        local_username.clone(),
        ws_origin,
        Box::new(WsTransportFactory),
        Arc::new(LoggingInstrumentEngine),
        Arc::new(NoCompatibility),
        Arc::new(NoUploader),
        SessionStore::new(),
    );

    facade.on_event(Box::new(|event| {
        print!("\r\n{}", describe_event(&event));
        let _ = std::io::stdout().flush();
    }));

    let engine_task = tokio::spawn(facade.run());

    println!("bandroom-session-cli — connecting to {}", cli.resolved_backend_url());
    println!("q/Esc/Ctrl-C quit, a-k play a note, space stop all notes, l leave room");

    handle.connect_to_lobby().ok();
    if let Some(room) = cli.room.clone() {
        let room_id = RoomId::from(room);
        if let Err(err) = handle.request_join(room_id, local_username, cli.role.into()).await {
            tracing::warn!(%err, "failed to request joining room");
        }
    }

    terminal::enable_raw_mode()?;
    let result = run_key_loop(&handle).await;
    terminal::disable_raw_mode()?;
    println!();

    handle.shutdown().ok();
    let _ = engine_task.await;

    result
}

/// Read keyboard events until the user quits, dispatching them to `handle`.
async fn run_key_loop(handle: &bandroom_session::facade::SessionHandle) -> Result<(), anyhow::Error> {
    let mut keys = crossterm::event::EventStream::new().fuse();

    loop {
        tokio::select! {
            event = keys.next() => {
                match event {
                    Some(Ok(event)) => {
                        if on_key_press(event, handle) == ControlFlow::Break(()) {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::error!(%err, "terminal event stream failed");
                        break;
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(60)) => {}
        }
    }

    Ok(())
}

/// A single octave of white keys mapped to MIDI note numbers starting at
/// middle C (60), for demo key-to-pitch mapping.
const KEY_NOTES: &[(char, u8)] =
    &[('a', 60), ('s', 62), ('d', 64), ('f', 65), ('g', 67), ('h', 69), ('j', 71), ('k', 72)];

fn on_key_press(ev: Event, handle: &bandroom_session::facade::SessionHandle) -> ControlFlow<()> {
    let Event::Key(key_event) = ev else {
        return ControlFlow::Continue(());
    };

    match key_event {
        KeyEvent { code: KeyCode::Char('q'), .. } | KeyEvent { code: KeyCode::Esc, .. } => {
            return ControlFlow::Break(());
        }
        KeyEvent { code: KeyCode::Char('c'), modifiers: KeyModifiers::CONTROL, .. } => {
            return ControlFlow::Break(());
        }
        KeyEvent { code: KeyCode::Char(' '), .. } => {
            let _ = handle.stop_all_notes(InstrumentId::from("demo_keys"), "Melodic".into());
        }
        KeyEvent { code: KeyCode::Char('l'), .. } => {
            let _ = handle.leave_room();
        }
        KeyEvent { code: KeyCode::Char(c), .. } => {
            if let Some((_, pitch)) = KEY_NOTES.iter().find(|(key, _)| *key == c) {
                let _ = handle.play_note(
                    vec![*pitch],
                    100,
                    InstrumentId::from("demo_keys"),
                    "Melodic".into(),
                    NoteEventType::NoteOn,
                    Some(true),
                );
            }
        }
        _ => {}
    }

    ControlFlow::Continue(())
}

/// Render a [`FacadeEvent`] as a single human-readable line for the demo harness.
fn describe_event(event: &FacadeEvent) -> String {
    match event {
        FacadeEvent::StateChanged { previous, current } => format!("state: {previous:?} -> {current:?}"),
        FacadeEvent::RoomJoined { room_id, users } => format!("joined room {room_id} with {} member(s)", users.len()),
        FacadeEvent::UserJoined(user) => format!("{} joined", user.username),
        FacadeEvent::UserLeft(user_id) => format!("{user_id} left"),
        FacadeEvent::Kicked { reason } => format!("kicked: {}", reason.as_deref().unwrap_or("no reason given")),
        FacadeEvent::ApprovalGranted(room_id) => format!("approval granted for {room_id}"),
        FacadeEvent::ApprovalDenied { room_id, reason } => {
            format!("approval denied for {room_id}: {}", reason.as_deref().unwrap_or("no reason given"))
        }
        FacadeEvent::ApprovalPending(room_id) => format!("approval pending for {room_id}"),
        FacadeEvent::IncomingJoinRequest { room_id, user_id, username } => {
            format!("{username} ({user_id}) wants to join {room_id}")
        }
        FacadeEvent::NoteReceived { user_id, notes, event_type, .. } => {
            format!("{user_id} {event_type:?} {notes:?}")
        }
        FacadeEvent::InstrumentChanged { user_id, instrument } => format!("{user_id} switched to {instrument}"),
        FacadeEvent::RoomOwnerScaleChanged { root_note, scale } => format!("scale changed to {root_note} {scale}"),
        FacadeEvent::ChatMessage { user_id, message } => format!("{user_id}: {message}"),
        FacadeEvent::SynthParamsChanged { user_id, .. } => format!("{user_id} updated synth params"),
        FacadeEvent::EffectsChainChanged { user_id, .. } => format!("{user_id} updated effect chains"),
        FacadeEvent::LockChanged { target, holder } => format!("lock {target:?} held by {holder:?}"),
        FacadeEvent::DawSnapshotApplied => "DAW snapshot applied".to_owned(),
        FacadeEvent::RemoteRecordingStateChanged { user_id, recording } => {
            format!("{user_id} recording: {recording}")
        }
        FacadeEvent::StatusMessage { message, severity } => format!("[{severity:?}] {message}"),
        FacadeEvent::ErrorReported(ctx) => format!("error: {} ({:?})", ctx.message, ctx.kind),
    }
}
