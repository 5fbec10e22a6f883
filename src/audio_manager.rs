//! Room-scoped audio resource lifecycle (§4.5, GLOSSARY "InstrumentEngine").
//!
//! `AudioManager` never touches the actual synthesis engine; it holds an
//! `Arc<dyn InstrumentEngine>` back-reference to its host rather than owning
//! the host's resources outright. Preload work is an explicit task queue
//! (`mpsc`) with a `Request`/worker split: failures never propagate as
//! panics or fire-and-forget promise rejections, they route to
//! `RecoveryEngine` via a typed report.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ErrorContext;
use crate::ids::InstrumentId;
use crate::ids::UserId;
use crate::types::User;

/// One user/instrument/category triple that's been successfully preloaded.
type PreloadKey = (UserId, InstrumentId, String);

/// What `InstrumentEngine::preload` was asked to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentLoad {
    /// User the instrument is being loaded for.
    pub user_id: UserId,
    /// Instrument to load.
    pub instrument: InstrumentId,
    /// Instrument's category (drives fallback lookup).
    pub category: String,
}

/// Error surfaced by the external instrument engine or audio context.
#[derive(Debug, Clone, thiserror::Error)]
#[error("audio engine error: {0}")]
pub struct AudioEngineError(pub String);

/// Host-implemented seam onto the real synthesis engine. The session engine
/// never decodes or renders audio itself (Non-goal, §1).
#[async_trait]
pub trait InstrumentEngine: Send + Sync {
    /// Ensure the host audio context is running, returning whether it is
    /// live after the attempt (it may require a user-gesture resume).
    async fn ensure_context_running(&self) -> Result<bool, AudioEngineError>;

    /// Preload a batch of instruments. A partial failure should still
    /// preload the entries that succeed and return the ones that failed.
    async fn preload(&self, loads: &[InstrumentLoad]) -> Result<(), AudioEngineError>;

    /// Release every resource held for `user_id` (mixer channel, instrument handle).
    async fn cleanup_remote_user(&self, user_id: &UserId);

    /// Apply an effect chain description to `user_id`'s mixer channel.
    /// Never called for the local user when `apply_to_mixer` is false.
    async fn apply_effect_chain(&self, user_id: &UserId, chains: &serde_json::Value);

    /// Resume the audio context in response to a user interaction (autoplay policies).
    async fn resume_on_interaction(&self) -> Result<(), AudioEngineError>;
}

/// Looks up a same-category fallback instrument when a preload fails.
pub trait InstrumentCompatibility: Send + Sync {
    /// Next compatible instrument in `category`, excluding `failed_instrument`.
    fn fallback_for(&self, category: &str, failed_instrument: &InstrumentId) -> Option<InstrumentId>;
}

/// Tracks room membership and the per-user instrument resources that go with
/// it (§4.5). Owns the `preloaded` set exclusively: no other component may
/// mutate it.
pub struct AudioManager {
    /// Whether `initialize_for_room` has completed at least once for the
    /// current room (context confirmed live).
    initialized: bool,
    /// Current room membership, by user id.
    users: HashMap<UserId, User>,
    /// Successfully preloaded `(userId, instrumentId, category)` triples.
    preloaded: HashSet<PreloadKey>,
    /// Last effect-chain description applied or recorded per user, tracked
    /// even when `apply_to_mixer` is false so a later mixer sync (e.g. after
    /// a reconnect) has something to replay.
    effect_chains: HashMap<UserId, serde_json::Value>,
    /// Host synthesis engine.
    engine: std::sync::Arc<dyn InstrumentEngine>,
    /// Fallback instrument lookup.
    compatibility: std::sync::Arc<dyn InstrumentCompatibility>,
}

impl AudioManager {
    /// Construct a manager with no room membership yet.
    pub fn new(engine: std::sync::Arc<dyn InstrumentEngine>, compatibility: std::sync::Arc<dyn InstrumentCompatibility>) -> Self {
        Self { initialized: false, users: HashMap::new(), preloaded: HashSet::new(), effect_chains: HashMap::new(), engine, compatibility }
    }

    /// Whether the audio context was last confirmed live.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Current room membership snapshot.
    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    /// Whether `(user_id, instrument, category)` is currently preloaded.
    pub fn is_preloaded(&self, user_id: &UserId, instrument: &InstrumentId, category: &str) -> bool {
        self.preloaded.contains(&(user_id.clone(), instrument.clone(), category.to_owned()))
    }

    /// Bring up audio for a freshly joined room: ensure a channel per user
    /// (implicit, handled by the host engine lazily), resume the context if
    /// suspended, and preload every member's selected instrument.
    ///
    /// Partial preload failures are non-fatal and escalated individually;
    /// the call itself reports success as long as the context came up live.
    pub async fn initialize_for_room(&mut self, users: Vec<User>) -> (bool, Vec<ErrorContext>) {
        let mut errors = Vec::new();
        self.users = users.into_iter().map(|u| (u.user_id.clone(), u)).collect();

        let running = match self.engine.ensure_context_running().await {
            Ok(running) => running,
            Err(err) => {
                errors.push(
                    ErrorContext::new(crate::error::ErrorKind::AudioInitFailed, "audio context failed to start")
                        .with_source(err.0),
                );
                false
            }
        };

        let loads: Vec<InstrumentLoad> = self
            .users
            .values()
            .filter_map(|u| {
                let instrument = u.current_instrument_id.clone()?;
                let category = u.current_instrument_category.clone().unwrap_or_default();
                Some(InstrumentLoad { user_id: u.user_id.clone(), instrument, category })
            })
            .collect();

        if !loads.is_empty() {
            if let Err(err) = self.engine.preload(&loads).await {
                errors.push(
                    ErrorContext::new(crate::error::ErrorKind::AudioInitFailed, "instrument preload failed during room init")
                        .with_source(err.0),
                );
            } else {
                for load in &loads {
                    self.preloaded.insert((load.user_id.clone(), load.instrument.clone(), load.category.clone()));
                }
            }
        }

        self.initialized = running;
        (running, errors)
    }

    /// A user's active instrument changed. Preloads the new instrument,
    /// falling back to a compatible instrument in the same category on
    /// failure, and reporting `AudioInitFailed` only if no fallback exists.
    pub async fn handle_user_instrument_change(
        &mut self,
        user_id: UserId,
        username: impl Into<String>,
        instrument: InstrumentId,
        category: String,
    ) -> Option<ErrorContext> {
        let username = username.into();
        let entry = self.users.entry(user_id.clone()).or_insert_with(|| User::new(user_id.clone(), username.clone()));
        entry.username = username;
        entry.current_instrument_id = Some(instrument.clone());
        entry.current_instrument_category = Some(category.clone());

        if self.is_preloaded(&user_id, &instrument, &category) {
            return None;
        }

        let load = InstrumentLoad { user_id: user_id.clone(), instrument: instrument.clone(), category: category.clone() };
        if self.engine.preload(std::slice::from_ref(&load)).await.is_ok() {
            self.preloaded.insert((user_id, instrument, category));
            return None;
        }

        match self.compatibility.fallback_for(&category, &instrument) {
            Some(fallback) => {
                let fallback_load =
                    InstrumentLoad { user_id: user_id.clone(), instrument: fallback.clone(), category: category.clone() };
                if self.engine.preload(std::slice::from_ref(&fallback_load)).await.is_ok() {
                    self.preloaded.insert((user_id, fallback, category));
                    None
                } else {
                    Some(
                        ErrorContext::new(crate::error::ErrorKind::AudioInitFailed, "fallback instrument also failed to preload")
                            .with_user(user_id)
                            .with_extra("failed_instrument", instrument.0.clone())
                            .with_extra("fallback_instrument", fallback.0.clone()),
                    )
                }
            }
            None => Some(
                ErrorContext::new(crate::error::ErrorKind::AudioInitFailed, "instrument preload failed with no fallback available")
                    .with_user(user_id)
                    .with_extra("failed_instrument", instrument.0.clone()),
            ),
        }
    }

    /// A user left the room: release every resource held for them.
    pub async fn handle_user_left(&mut self, user_id: &UserId) {
        self.users.remove(user_id);
        self.preloaded.retain(|(u, _, _)| u != user_id);
        self.engine.cleanup_remote_user(user_id).await;
    }

    /// Apply an effect chain for `user_id`. For the local user with
    /// `apply_to_mixer = false`, only metadata is tracked; the local
    /// instrument engine owns its own chain directly.
    pub async fn apply_user_effect_chains(&mut self, user_id: &UserId, chains: serde_json::Value, apply_to_mixer: bool) {
        self.effect_chains.insert(user_id.clone(), chains.clone());
        if apply_to_mixer {
            self.engine.apply_effect_chain(user_id, &chains).await;
        }
    }

    /// Last effect-chain description recorded for `user_id`, whether or not
    /// it was ever applied to the mixer.
    pub fn effect_chains_for(&self, user_id: &UserId) -> Option<&serde_json::Value> {
        self.effect_chains.get(user_id)
    }

    /// Resume the audio context in response to a user gesture (click/keypress).
    pub async fn resume_on_interaction(&mut self) -> Option<ErrorContext> {
        match self.engine.resume_on_interaction().await {
            Ok(()) => {
                self.initialized = true;
                None
            }
            Err(err) => Some(
                ErrorContext::new(crate::error::ErrorKind::AudioInitFailed, "audio context resume on interaction failed")
                    .with_source(err.0),
            ),
        }
    }
}

/// One item of background audio work: everything `AudioManager` might need
/// to do outside the direct call path goes through this queue instead of
/// being fired and forgotten.
#[derive(Debug)]
pub enum AudioTask {
    /// Preload a batch of instruments.
    Preload(Vec<InstrumentLoad>),
    /// Release a departed user's resources.
    CleanupUser(UserId),
    /// Tear the worker down.
    Shutdown,
}

/// A background task queue for audio work, for hosts that want preload work
/// off the facade's own select loop. Optional: `AudioManager`'s direct
/// methods are sufficient for most callers; this exists for hosts batching
/// many preloads (e.g. on large room joins) without blocking inbound
/// message dispatch.
pub struct AudioWorker {
    /// Send queued work to the worker task.
    pub sender: mpsc::Sender<AudioTask>,
}

impl AudioWorker {
    /// Spawn the worker loop against `engine`, returning a handle to queue work.
    pub fn spawn(engine: std::sync::Arc<dyn InstrumentEngine>) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AudioTask>(32);
        let handle = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                match task {
                    AudioTask::Preload(loads) => {
                        if let Err(err) = engine.preload(&loads).await {
                            tracing::warn!(error = %err.0, "background instrument preload failed");
                        }
                    }
                    AudioTask::CleanupUser(user_id) => {
                        engine.cleanup_remote_user(&user_id).await;
                    }
                    AudioTask::Shutdown => break,
                }
            }
        });
        (Self { sender: tx }, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FakeEngine {
        context_running: bool,
        fail_instruments: Mutex<HashSet<String>>,
        cleaned_up: Mutex<Vec<UserId>>,
    }

    #[async_trait]
    impl InstrumentEngine for FakeEngine {
        async fn ensure_context_running(&self) -> Result<bool, AudioEngineError> {
            Ok(self.context_running)
        }

        async fn preload(&self, loads: &[InstrumentLoad]) -> Result<(), AudioEngineError> {
            let failing = self.fail_instruments.lock().unwrap();
            if loads.iter().any(|l| failing.contains(&l.instrument.0)) {
                return Err(AudioEngineError("simulated preload failure".into()));
            }
            Ok(())
        }

        async fn cleanup_remote_user(&self, user_id: &UserId) {
            self.cleaned_up.lock().unwrap().push(user_id.clone());
        }

        async fn apply_effect_chain(&self, _user_id: &UserId, _chains: &serde_json::Value) {}

        async fn resume_on_interaction(&self) -> Result<(), AudioEngineError> {
            Ok(())
        }
    }

    struct FakeCompatibility {
        fallback: Option<InstrumentId>,
        called: AtomicBool,
    }

    impl InstrumentCompatibility for FakeCompatibility {
        fn fallback_for(&self, _category: &str, _failed: &InstrumentId) -> Option<InstrumentId> {
            self.called.store(true, Ordering::SeqCst);
            self.fallback.clone()
        }
    }

    fn manager(context_running: bool, fail: &[&str], fallback: Option<&str>) -> AudioManager {
        let engine = std::sync::Arc::new(FakeEngine {
            context_running,
            fail_instruments: Mutex::new(fail.iter().map(|s| s.to_string()).collect()),
            cleaned_up: Mutex::new(Vec::new()),
        });
        let compatibility =
            std::sync::Arc::new(FakeCompatibility { fallback: fallback.map(InstrumentId::from), called: AtomicBool::new(false) });
        AudioManager::new(engine, compatibility)
    }

    #[tokio::test]
    async fn initialize_preloads_every_member_instrument() {
        let mut mgr = manager(true, &[], None);
        let user = User {
            current_instrument_id: Some(InstrumentId::from("analog_mono")),
            current_instrument_category: Some("Synthesizer".into()),
            ..User::new(UserId::from("u1"), "alice")
        };
        let (ok, errors) = mgr.initialize_for_room(vec![user]).await;
        assert!(ok);
        assert!(errors.is_empty());
        assert!(mgr.is_preloaded(&UserId::from("u1"), &InstrumentId::from("analog_mono"), "Synthesizer"));
    }

    #[tokio::test]
    async fn instrument_change_falls_back_when_preload_fails() {
        let mut mgr = manager(true, &["exotic_synth"], Some("acoustic_grand_piano"));
        let result = mgr
            .handle_user_instrument_change(
                UserId::from("u1"),
                "alice",
                InstrumentId::from("exotic_synth"),
                "Melodic".into(),
            )
            .await;
        assert!(result.is_none());
        assert!(mgr.is_preloaded(&UserId::from("u1"), &InstrumentId::from("acoustic_grand_piano"), "Melodic"));
    }

    #[tokio::test]
    async fn instrument_change_reports_failure_with_no_fallback() {
        let mut mgr = manager(true, &["exotic_synth"], None);
        let result = mgr
            .handle_user_instrument_change(
                UserId::from("u1"),
                "alice",
                InstrumentId::from("exotic_synth"),
                "Melodic".into(),
            )
            .await;
        assert_eq!(result.unwrap().kind, crate::error::ErrorKind::AudioInitFailed);
    }

    #[tokio::test]
    async fn user_left_releases_every_preload_entry() {
        let mut mgr = manager(true, &[], None);
        let user = User {
            current_instrument_id: Some(InstrumentId::from("piano")),
            current_instrument_category: Some("Melodic".into()),
            ..User::new(UserId::from("u1"), "alice")
        };
        mgr.initialize_for_room(vec![user]).await;
        mgr.handle_user_left(&UserId::from("u1")).await;
        assert!(!mgr.is_preloaded(&UserId::from("u1"), &InstrumentId::from("piano"), "Melodic"));
        assert!(mgr.users().next().is_none());
    }

    #[tokio::test]
    async fn effect_chain_metadata_is_recorded_even_without_mixer_apply() {
        let mut mgr = manager(true, &[], None);
        let user_id = UserId::from("u1");
        mgr.apply_user_effect_chains(&user_id, serde_json::json!({"reverb": 0.5}), false).await;
        assert_eq!(mgr.effect_chains_for(&user_id), Some(&serde_json::json!({"reverb": 0.5})));
    }

    #[tokio::test]
    async fn already_preloaded_instrument_change_is_a_no_op() {
        let mut mgr = manager(true, &[], None);
        let user = User {
            current_instrument_id: Some(InstrumentId::from("piano")),
            current_instrument_category: Some("Melodic".into()),
            ..User::new(UserId::from("u1"), "alice")
        };
        mgr.initialize_for_room(vec![user]).await;
        let result = mgr
            .handle_user_instrument_change(UserId::from("u1"), "alice", InstrumentId::from("piano"), "Melodic".into())
            .await;
        assert!(result.is_none());
    }
}
