//! Voice adapter - phrase spotting over a live transcript
//!
//! `PhraseSpotter` is the pure matcher. `VoiceTrigger` owns the listening
//! intent and supervises recognition sessions: a session that ends on its
//! own is restarted while the intent is on; an error forces listening off.

use super::TriggerSender;
use crate::domain::alert::epoch_ms;
use crate::domain::types::{Trigger, TriggerKind, VoiceSettings};
use crate::error::{EngineError, EngineResult};
use crate::infra::store::{load_json, save_json, KvStore, KEY_VOICE_SETTINGS};
use crate::io::sources::{
    Capability, PermissionOracle, PermissionState, RecognitionEvent, TranscriptSegment,
    TranscriptSource,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Finalized segments kept for cross-segment matches
const MAX_FINALIZED_SEGMENTS: usize = 8;

/// Pause before restarting a session that ended on its own
const RESTART_DELAY: Duration = Duration::from_millis(100);

/// Case-insensitive phrase matcher over one recognition session
///
/// The transcript is the space-joined sequence of finalized segments plus
/// the current interim segment. Each utterance fires at most once; once a
/// fired utterance is finalized its text is consumed so it cannot match
/// again.
#[derive(Debug, Clone)]
pub struct PhraseSpotter {
    /// (as configured, lowercased)
    phrases: Vec<(String, String)>,
    finalized: Vec<String>,
    fired_in_current: bool,
}

impl PhraseSpotter {
    pub fn new(phrases: &[String]) -> Self {
        let mut spotter = Self { phrases: Vec::new(), finalized: Vec::new(), fired_in_current: false };
        spotter.set_phrases(phrases);
        spotter
    }

    pub fn set_phrases(&mut self, phrases: &[String]) {
        self.phrases = phrases
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(|p| (p.to_string(), p.to_lowercase()))
            .collect();
    }

    /// Forget the session transcript
    pub fn reset(&mut self) {
        self.finalized.clear();
        self.fired_in_current = false;
    }

    /// Feed one transcript update; returns the matched phrase if this
    /// update fires
    pub fn feed(&mut self, segment: &TranscriptSegment) -> Option<String> {
        let text = segment.text.trim().to_lowercase();
        let hit = if self.fired_in_current { None } else { self.find(&text) };
        if hit.is_some() {
            self.fired_in_current = true;
        }

        if segment.is_final {
            if self.fired_in_current {
                self.finalized.clear();
            } else if !text.is_empty() {
                if self.finalized.len() >= MAX_FINALIZED_SEGMENTS {
                    self.finalized.remove(0);
                }
                self.finalized.push(text);
            }
            self.fired_in_current = false;
        }
        hit
    }

    fn find(&self, current: &str) -> Option<String> {
        let mut transcript = self.finalized.join(" ");
        if !current.is_empty() {
            if !transcript.is_empty() {
                transcript.push(' ');
            }
            transcript.push_str(current);
        }
        self.phrases
            .iter()
            .find(|(_, lower)| transcript.contains(lower.as_str()))
            .map(|(original, _)| original.clone())
    }
}

/// Listening-mode status exposed to the display collaborator
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VoiceStatus {
    pub listening: bool,
    pub error: Option<EngineError>,
    pub last_detected_phrase: Option<String>,
}

pub struct VoiceTrigger {
    source: Arc<dyn TranscriptSource>,
    permissions: Arc<dyn PermissionOracle>,
    store: Arc<dyn KvStore>,
    sender: TriggerSender,
    settings: RwLock<VoiceSettings>,
    settings_version: AtomicU64,
    /// Listening intent; cleared only by `stop_listening` or an error
    intent: AtomicBool,
    /// Active session generation, 0 when idle. Triggers are only sent while
    /// holding this lock for the matching generation.
    session: Mutex<u64>,
    next_session: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes `start_listening` so only one caller opens a session
    starting: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<VoiceStatus>,
}

impl VoiceTrigger {
    /// Persisted settings, when valid, override `defaults`
    pub fn new(
        defaults: VoiceSettings,
        source: Arc<dyn TranscriptSource>,
        permissions: Arc<dyn PermissionOracle>,
        store: Arc<dyn KvStore>,
        sender: TriggerSender,
    ) -> Self {
        let settings = match load_json::<VoiceSettings>(store.as_ref(), KEY_VOICE_SETTINGS) {
            Some(stored) if stored.validate().is_ok() => {
                info!(phrases = %stored.trigger_phrases.len(), language = %stored.language, "voice_settings_restored");
                stored
            }
            Some(_) => {
                warn!("voice_settings_stored_invalid");
                defaults
            }
            None => defaults,
        };
        let (status_tx, _) = watch::channel(VoiceStatus::default());
        Self {
            source,
            permissions,
            store,
            sender,
            settings: RwLock::new(settings),
            settings_version: AtomicU64::new(0),
            intent: AtomicBool::new(false),
            session: Mutex::new(0),
            next_session: AtomicU64::new(1),
            task: Mutex::new(None),
            starting: tokio::sync::Mutex::new(()),
            status_tx,
        }
    }

    pub fn settings(&self) -> VoiceSettings {
        self.settings.read().clone()
    }

    /// Replace settings; a language change applies from the next session
    pub fn update_settings(&self, settings: VoiceSettings) -> EngineResult<()> {
        settings.validate()?;
        save_json(self.store.as_ref(), KEY_VOICE_SETTINGS, &settings);
        info!(
            phrases = %settings.trigger_phrases.len(),
            sensitivity = %settings.sensitivity,
            language = %settings.language,
            "voice_settings_updated"
        );
        *self.settings.write() = settings;
        self.settings_version.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Add a trigger phrase; false if empty or already present
    pub fn add_phrase(&self, phrase: &str) -> EngineResult<bool> {
        let phrase = phrase.trim();
        let mut next = self.settings();
        if phrase.is_empty()
            || next.trigger_phrases.iter().any(|p| p.eq_ignore_ascii_case(phrase))
        {
            return Ok(false);
        }
        next.trigger_phrases.push(phrase.to_string());
        self.update_settings(next)?;
        Ok(true)
    }

    /// Remove a trigger phrase; removing the last one is rejected
    pub fn remove_phrase(&self, phrase: &str) -> EngineResult<bool> {
        let mut next = self.settings();
        let before = next.trigger_phrases.len();
        next.trigger_phrases.retain(|p| p != phrase);
        if next.trigger_phrases.len() == before {
            return Ok(false);
        }
        self.update_settings(next)?;
        Ok(true)
    }

    pub fn status(&self) -> VoiceStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<VoiceStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_listening(&self) -> bool {
        self.intent.load(Ordering::Acquire)
    }

    pub fn last_detected_phrase(&self) -> Option<String> {
        self.status_tx.borrow().last_detected_phrase.clone()
    }

    /// Turn listening on. No-op if already listening.
    pub async fn start_listening(self: &Arc<Self>) -> EngineResult<()> {
        let _starting = self.starting.lock().await;
        if self.is_listening() {
            return Ok(());
        }

        match self.permissions.query(Capability::Microphone).await {
            Ok(PermissionState::Denied) => return Err(self.refuse(EngineError::PermissionDenied)),
            Ok(_) => {}
            Err(e) => return Err(self.refuse(e)),
        }

        let language = self.settings.read().language.clone();
        let events = self.source.start(&language).await.map_err(|e| self.refuse(e))?;

        let generation = self.next_session.fetch_add(1, Ordering::Relaxed);
        {
            let mut session = self.session.lock();
            *session = generation;
            self.intent.store(true, Ordering::Release);
            let voice = Arc::clone(self);
            *self.task.lock() = Some(tokio::spawn(async move {
                voice.supervise(generation, events).await;
            }));
        }

        self.status_tx.send_modify(|s| {
            s.listening = true;
            s.error = None;
        });
        info!(language = %language, generation = %generation, "voice_listening_started");
        Ok(())
    }

    /// Turn listening off. No trigger is sent after this returns and the
    /// session is not restarted.
    pub async fn stop_listening(&self) {
        self.intent.store(false, Ordering::Release);
        let was = std::mem::take(&mut *self.session.lock());
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        if was != 0 {
            self.source.stop().await;
            info!(generation = %was, "voice_listening_stopped");
        }
        self.status_tx.send_modify(|s| s.listening = false);
    }

    async fn supervise(self: Arc<Self>, generation: u64, mut events: mpsc::Receiver<RecognitionEvent>) {
        let mut spotter = PhraseSpotter::new(&self.settings.read().trigger_phrases);
        let mut seen_version = self.settings_version.load(Ordering::Acquire);

        loop {
            match events.recv().await {
                Some(RecognitionEvent::Result(segment)) => {
                    let version = self.settings_version.load(Ordering::Acquire);
                    if version != seen_version {
                        spotter.set_phrases(&self.settings.read().trigger_phrases);
                        seen_version = version;
                    }
                    debug!(text = %segment.text, is_final = %segment.is_final, "voice_transcript");
                    if let Some(phrase) = spotter.feed(&segment) {
                        if !self.fire(generation, phrase) {
                            break;
                        }
                    }
                }
                Some(RecognitionEvent::Error(message)) => {
                    self.fail(generation, EngineError::RecognitionError { message }).await;
                    break;
                }
                Some(RecognitionEvent::End) | None => {
                    if !self.intent.load(Ordering::Acquire) || *self.session.lock() != generation {
                        debug!(generation = %generation, "voice_session_ended_after_stop");
                        break;
                    }
                    tokio::time::sleep(RESTART_DELAY).await;
                    if !self.intent.load(Ordering::Acquire) {
                        break;
                    }
                    spotter.reset();
                    let language = self.settings.read().language.clone();
                    match self.source.start(&language).await {
                        Ok(next) => {
                            events = next;
                            info!(generation = %generation, language = %language, "voice_session_restarted");
                        }
                        Err(e) => {
                            self.fail(generation, e).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Send a voice trigger if `generation` is still the live session
    fn fire(&self, generation: u64, phrase: String) -> bool {
        let session = self.session.lock();
        if *session != generation {
            return false;
        }
        self.status_tx.send_modify(|s| s.last_detected_phrase = Some(phrase.clone()));
        info!(phrase = %phrase, "voice_phrase_detected");
        self.sender.send(Trigger::new(TriggerKind::Voice, Some(phrase), epoch_ms()));
        true
    }

    /// Force listening off with a surfaced error
    async fn fail(&self, generation: u64, error: EngineError) {
        {
            let mut session = self.session.lock();
            if *session != generation {
                return;
            }
            *session = 0;
            self.intent.store(false, Ordering::Release);
            // The supervising task is the caller; detach instead of aborting
            self.task.lock().take();
        }
        warn!(error = %error, kind = error.kind(), "voice_listening_stopped_on_error");
        self.source.stop().await;
        self.status_tx.send_modify(|s| {
            s.listening = false;
            s.error = Some(error);
        });
    }

    fn refuse(&self, error: EngineError) -> EngineError {
        warn!(error = %error, kind = error.kind(), "voice_listening_not_started");
        self.status_tx.send_modify(|s| {
            s.listening = false;
            s.error = Some(error.clone());
        });
        error
    }
}
