//! File- and console-driven implementations of the platform sources
//!
//! - `ReplaySource` - plays position fixes from a JSONL file
//! - `ScriptedSource` - fixes pushed by the caller
//! - `ScriptedTranscripts` - recognition sessions fed line by line
//! - `StaticPermissions` - settable permission states with change notification

use crate::domain::alert::epoch_ms;
use crate::error::{EngineError, EngineResult};
use crate::io::sources::{
    Capability, PermissionOracle, PermissionState, PositionSource, RawFix, RecognitionEvent,
    SampleOptions, TranscriptSegment, TranscriptSource,
};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

const WATCH_BUFFER: usize = 64;

/// Replays fixes from a JSONL file, one `RawFix` object per line
///
/// Fixes are re-stamped with the wall clock when emitted so they are fresh.
/// After the last fix the watch stays open without further updates.
pub struct ReplaySource {
    fixes: Arc<Vec<RawFix>>,
    interval: Duration,
    latest: Arc<Mutex<Option<RawFix>>>,
}

impl ReplaySource {
    pub fn new(fixes: Vec<RawFix>, interval: Duration) -> Self {
        Self { fixes: Arc::new(fixes), interval, latest: Arc::new(Mutex::new(None)) }
    }

    pub fn from_file<P: AsRef<Path>>(path: P, interval: Duration) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay file {}", path.display()))?;
        let mut fixes = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fix: RawFix = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid fix", path.display(), lineno + 1))?;
            fixes.push(fix);
        }
        info!(path = %path.display(), fixes = %fixes.len(), "replay_file_loaded");
        Ok(Self::new(fixes, interval))
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }
}

#[async_trait]
impl PositionSource for ReplaySource {
    async fn current(&self, _opts: SampleOptions) -> EngineResult<RawFix> {
        let base = (*self.latest.lock()).or_else(|| self.fixes.first().copied());
        match base {
            Some(fix) => Ok(RawFix { timestamp_ms: epoch_ms(), ..fix }),
            None => Err(EngineError::unavailable("replay source has no fixes")),
        }
    }

    fn watch(&self, _opts: SampleOptions) -> EngineResult<mpsc::Receiver<EngineResult<RawFix>>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let fixes = Arc::clone(&self.fixes);
        let latest = Arc::clone(&self.latest);
        let interval = self.interval;
        tokio::spawn(async move {
            for fix in fixes.iter() {
                let fix = RawFix { timestamp_ms: epoch_ms(), ..*fix };
                *latest.lock() = Some(fix);
                if tx.send(Ok(fix)).await.is_err() {
                    debug!("replay_watch_cancelled");
                    return;
                }
                tokio::time::sleep(interval).await;
            }
            debug!("replay_exhausted");
            tx.closed().await;
        });
        Ok(rx)
    }
}

/// Position source driven directly by the caller
#[derive(Default)]
pub struct ScriptedSource {
    current: Mutex<VecDeque<EngineResult<RawFix>>>,
    current_delay: Duration,
    watcher: Mutex<Option<mpsc::Sender<EngineResult<RawFix>>>>,
    unsupported: AtomicBool,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every one-shot fix by `delay`
    pub fn with_current_delay(mut self, delay: Duration) -> Self {
        self.current_delay = delay;
        self
    }

    /// Queue the result of the next `current()` call
    pub fn push_current(&self, fix: EngineResult<RawFix>) {
        self.current.lock().push_back(fix);
    }

    /// Push an update onto the active watch; false if nobody is watching
    pub fn emit(&self, fix: EngineResult<RawFix>) -> bool {
        match self.watcher.lock().as_ref() {
            Some(tx) => tx.try_send(fix).is_ok(),
            None => false,
        }
    }

    /// End the active watch stream
    pub fn close_watch(&self) {
        self.watcher.lock().take();
    }

    pub fn set_unsupported(&self, unsupported: bool) {
        self.unsupported.store(unsupported, Ordering::Release);
    }

    fn check_supported(&self) -> EngineResult<()> {
        if self.unsupported.load(Ordering::Acquire) {
            return Err(EngineError::Unsupported { capability: "Geolocation".to_string() });
        }
        Ok(())
    }
}

#[async_trait]
impl PositionSource for ScriptedSource {
    async fn current(&self, _opts: SampleOptions) -> EngineResult<RawFix> {
        self.check_supported()?;
        if !self.current_delay.is_zero() {
            tokio::time::sleep(self.current_delay).await;
        }
        let next = self.current.lock().pop_front();
        next.unwrap_or_else(|| Err(EngineError::unavailable("no scripted fix")))
    }

    fn watch(&self, _opts: SampleOptions) -> EngineResult<mpsc::Receiver<EngineResult<RawFix>>> {
        self.check_supported()?;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        *self.watcher.lock() = Some(tx);
        Ok(rx)
    }
}

/// Recognition source fed one transcript update at a time
#[derive(Default)]
pub struct ScriptedTranscripts {
    session: Mutex<Option<mpsc::Sender<RecognitionEvent>>>,
    started: AtomicUsize,
    stops: AtomicUsize,
    unsupported: AtomicBool,
}

impl ScriptedTranscripts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a transcript update to the live session
    pub fn say(&self, segment: TranscriptSegment) -> bool {
        match self.session.lock().as_ref() {
            Some(tx) => tx.try_send(RecognitionEvent::Result(segment)).is_ok(),
            None => false,
        }
    }

    /// End the live session as the platform would after silence
    pub fn end_session(&self) {
        if let Some(tx) = self.session.lock().take() {
            let _ = tx.try_send(RecognitionEvent::End);
        }
    }

    /// Fail the live session
    pub fn fail(&self, message: &str) {
        if let Some(tx) = self.session.lock().take() {
            let _ = tx.try_send(RecognitionEvent::Error(message.to_string()));
        }
    }

    pub fn set_unsupported(&self, unsupported: bool) {
        self.unsupported.store(unsupported, Ordering::Release);
    }

    pub fn sessions_started(&self) -> usize {
        self.started.load(Ordering::Acquire)
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::Acquire)
    }

    pub fn has_session(&self) -> bool {
        self.session.lock().is_some()
    }
}

#[async_trait]
impl TranscriptSource for ScriptedTranscripts {
    async fn start(&self, language: &str) -> EngineResult<mpsc::Receiver<RecognitionEvent>> {
        if self.unsupported.load(Ordering::Acquire) {
            return Err(EngineError::Unsupported { capability: "Speech recognition".to_string() });
        }
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        *self.session.lock() = Some(tx);
        let n = self.started.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(language = %language, session = %n, "transcript_session_started");
        Ok(rx)
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::AcqRel);
        self.end_session();
    }
}

/// Permission states set by the caller
///
/// `set` notifies change subscribers; `set_silently` models a revocation the
/// platform does not announce.
pub struct StaticPermissions {
    geolocation: watch::Sender<PermissionState>,
    microphone: watch::Sender<PermissionState>,
}

impl StaticPermissions {
    pub fn new(geolocation: PermissionState, microphone: PermissionState) -> Self {
        Self {
            geolocation: watch::channel(geolocation).0,
            microphone: watch::channel(microphone).0,
        }
    }

    pub fn granted() -> Self {
        Self::new(PermissionState::Granted, PermissionState::Granted)
    }

    pub fn denied() -> Self {
        Self::new(PermissionState::Denied, PermissionState::Denied)
    }

    pub fn with(self, capability: Capability, state: PermissionState) -> Self {
        self.set(capability, state);
        self
    }

    fn sender(&self, capability: Capability) -> &watch::Sender<PermissionState> {
        match capability {
            Capability::Geolocation => &self.geolocation,
            Capability::Microphone => &self.microphone,
        }
    }

    pub fn set(&self, capability: Capability, state: PermissionState) {
        info!(capability = capability.as_str(), state = ?state, "permission_changed");
        self.sender(capability).send_replace(state);
    }

    pub fn set_silently(&self, capability: Capability, state: PermissionState) {
        self.sender(capability).send_if_modified(|current| {
            *current = state;
            false
        });
    }
}

#[async_trait]
impl PermissionOracle for StaticPermissions {
    async fn query(&self, capability: Capability) -> EngineResult<PermissionState> {
        Ok(*self.sender(capability).borrow())
    }

    fn changes(&self, capability: Capability) -> Option<watch::Receiver<PermissionState>> {
        Some(self.sender(capability).subscribe())
    }
}
