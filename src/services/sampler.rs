//! Geo sampler - normalized position fixes with staleness and tracking
//!
//! Wraps a platform `PositionSource`:
//! - `sample()` / `current()` for one-shot fixes with a hard timeout
//! - `start_tracking()` for continuous updates pushed to the engine
//! - a fixed-interval permission re-check while tracking, since revocation
//!   does not always surface as an error on the fix stream
//!
//! The last good fix is persisted so a restarted process can serve it
//! immediately (possibly stale) while a fresh fix is in flight. Writes are
//! throttled to one per `PERSIST_INTERVAL_MS` of fix time, and the latest
//! fix is flushed when tracking stops.

use crate::domain::alert::epoch_ms;
use crate::domain::types::Position;
use crate::error::{EngineError, EngineResult};
use crate::infra::store::{load_json, save_json, KvStore, KEY_LAST_LOCATION};
use crate::infra::{Config, Metrics};
use crate::io::sources::{
    Capability, PermissionOracle, PermissionState, PositionSource, RawFix, SampleOptions,
};
use crate::services::lifecycle::PositionProvider;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Minimum fix-time gap between two persisted positions
pub const PERSIST_INTERVAL_MS: u64 = 10_000;

/// Continuous-mode status exposed to the display collaborator
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrackingStatus {
    pub active: bool,
    /// Last error; recoverable errors leave `active` set
    pub error: Option<EngineError>,
}

struct TrackingHandle {
    generation: u64,
    cancel_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct SampleState {
    last: Option<Position>,
    history: VecDeque<Position>,
    /// Timestamp of the last fix written to the store
    persisted_ms: Option<u64>,
}

pub struct GeoSampler {
    source: Arc<dyn PositionSource>,
    permissions: Arc<dyn PermissionOracle>,
    store: Arc<dyn KvStore>,
    metrics: Arc<Metrics>,
    opts: SampleOptions,
    stale_threshold_ms: u64,
    permission_interval: Duration,
    history_len: usize,
    state: Mutex<SampleState>,
    /// Emission gate: fixes are only pushed while holding this lock and
    /// only for the generation currently stored in it
    tracking: Mutex<Option<TrackingHandle>>,
    next_generation: Mutex<u64>,
    status_tx: watch::Sender<TrackingStatus>,
    latest_tx: watch::Sender<Option<Position>>,
    position_tx: Option<mpsc::Sender<Position>>,
}

impl GeoSampler {
    pub fn new(
        config: &Config,
        source: Arc<dyn PositionSource>,
        permissions: Arc<dyn PermissionOracle>,
        store: Arc<dyn KvStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let restored: Option<Position> = load_json(store.as_ref(), KEY_LAST_LOCATION);
        if let Some(ref p) = restored {
            info!(lat = %p.latitude, lon = %p.longitude, ts = %p.timestamp_ms, "sampler_restored_last_position");
        }
        let mut history = VecDeque::with_capacity(config.history_len());
        if let Some(ref p) = restored {
            history.push_back(p.clone());
        }
        let (status_tx, _) = watch::channel(TrackingStatus::default());
        let (latest_tx, _) = watch::channel(restored.clone());

        Self {
            source,
            permissions,
            store,
            metrics,
            opts: SampleOptions {
                high_accuracy: config.high_accuracy(),
                timeout: config.sample_timeout(),
                max_sample_age: config.max_sample_age(),
            },
            stale_threshold_ms: config.stale_threshold_ms(),
            permission_interval: config.permission_check_interval(),
            history_len: config.history_len().max(1),
            state: Mutex::new(SampleState {
                persisted_ms: restored.as_ref().map(|p| p.timestamp_ms),
                last: restored,
                history,
            }),
            tracking: Mutex::new(None),
            next_generation: Mutex::new(0),
            status_tx,
            latest_tx,
            position_tx: None,
        }
    }

    /// Set the channel receiving every fix produced while tracking
    pub fn with_position_tx(mut self, tx: mpsc::Sender<Position>) -> Self {
        self.position_tx = Some(tx);
        self
    }

    pub fn options(&self) -> SampleOptions {
        self.opts
    }

    /// A fix no older than the configured max sample age, fetching one if needed
    pub async fn sample(&self) -> EngineResult<Position> {
        if !self.opts.max_sample_age.is_zero() {
            let max_age = self.opts.max_sample_age.as_millis() as u64;
            if let Some(cached) = self.last_known() {
                if cached.age_ms(epoch_ms()) <= max_age {
                    debug!(age_ms = %cached.age_ms(epoch_ms()), "sampler_cached_sample");
                    return Ok(cached);
                }
            }
        }
        self.current().await
    }

    /// Always asks the source for a fresh fix
    pub async fn current(&self) -> EngineResult<Position> {
        self.current_with_timeout(self.opts.timeout).await
    }

    /// Fresh fix bounded by `limit`; expiry yields `Timeout`
    pub async fn current_with_timeout(&self, limit: Duration) -> EngineResult<Position> {
        let opts = SampleOptions { timeout: limit, ..self.opts };
        let result = match timeout(limit, self.source.current(opts)).await {
            Ok(Ok(raw)) => raw.normalize(),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::Timeout { duration_ms: limit.as_millis() as u64 }),
        };
        match result {
            Ok(position) => {
                if let Some(p) = self.record(&position) {
                    self.persist(&p);
                }
                Ok(position)
            }
            Err(e) => {
                self.metrics.record_position_error();
                warn!(error = %e, kind = e.kind(), "sampler_fix_failed");
                Err(e)
            }
        }
    }

    pub fn last_known(&self) -> Option<Position> {
        self.state.lock().last.clone()
    }

    /// Whether the last known fix is older than the staleness threshold
    pub fn last_known_is_stale(&self) -> bool {
        match self.last_known() {
            Some(p) => p.is_stale(epoch_ms(), self.stale_threshold_ms),
            None => true,
        }
    }

    pub fn stale_threshold_ms(&self) -> u64 {
        self.stale_threshold_ms
    }

    /// Recent fixes, oldest first
    pub fn history(&self) -> Vec<Position> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn status(&self) -> TrackingStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TrackingStatus> {
        self.status_tx.subscribe()
    }

    /// Latest accepted fix, for display
    pub fn subscribe_positions(&self) -> watch::Receiver<Option<Position>> {
        self.latest_tx.subscribe()
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.lock().is_some()
    }

    /// Start continuous mode
    ///
    /// Fails with `PermissionDenied` without starting when geolocation is
    /// denied. Calling while already tracking is a no-op.
    pub async fn start_tracking(self: &Arc<Self>) -> EngineResult<()> {
        if self.is_tracking() {
            return Ok(());
        }

        match self.permissions.query(Capability::Geolocation).await {
            Ok(PermissionState::Denied) => {
                return Err(self.refuse(EngineError::PermissionDenied));
            }
            Ok(_) => {}
            Err(e) => return Err(self.refuse(e)),
        }

        let fixes = self.source.watch(self.opts).map_err(|e| self.refuse(e))?;
        let changes = self.permissions.changes(Capability::Geolocation);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let generation = {
            let mut next = self.next_generation.lock();
            *next += 1;
            *next
        };

        let mut tracking = self.tracking.lock();
        if tracking.is_some() {
            // Lost a race with a concurrent start
            return Ok(());
        }
        let sampler = Arc::clone(self);
        let task = tokio::spawn(async move {
            sampler.track(generation, fixes, changes, cancel_rx).await;
        });
        *tracking = Some(TrackingHandle { generation, cancel_tx, task: Some(task) });
        self.status_tx.send_replace(TrackingStatus { active: true, error: None });
        info!(
            generation = %generation,
            high_accuracy = %self.opts.high_accuracy,
            permission_check_ms = %self.permission_interval.as_millis(),
            "tracking_started"
        );
        Ok(())
    }

    /// Stop continuous mode. No fix is emitted after this returns.
    pub fn stop_tracking(&self) -> bool {
        let handle = self.tracking.lock().take();
        let Some(mut handle) = handle else {
            return false;
        };
        let _ = handle.cancel_tx.send(true);
        if let Some(task) = handle.task.take() {
            task.abort();
        }
        self.status_tx.send_replace(TrackingStatus { active: false, error: None });
        info!(generation = %handle.generation, "tracking_stopped");
        self.flush_last_known();
        true
    }

    async fn track(
        self: Arc<Self>,
        generation: u64,
        mut fixes: mpsc::Receiver<EngineResult<RawFix>>,
        mut changes: Option<watch::Receiver<PermissionState>>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let mut check = interval_at(Instant::now() + self.permission_interval, self.permission_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // One immediate high-accuracy fix so a source that only reports on
        // movement still gets evaluated at start
        let initial_opts = SampleOptions { high_accuracy: true, ..self.opts };
        let initial = timeout(initial_opts.timeout, self.source.current(initial_opts));
        tokio::pin!(initial);
        let mut initial_pending = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel_rx.changed() => {
                    debug!(generation = %generation, "tracking_task_cancelled");
                    break;
                }

                result = &mut initial, if initial_pending => {
                    initial_pending = false;
                    let fix = result.unwrap_or_else(|_| {
                        Err(EngineError::Timeout { duration_ms: initial_opts.timeout.as_millis() as u64 })
                    });
                    match fix {
                        Ok(raw) => match raw.normalize() {
                            Ok(position) => self.emit(generation, position),
                            Err(e) => self.note_error(generation, e),
                        },
                        Err(e) if e.is_recoverable() => self.note_error(generation, e),
                        Err(e) => {
                            self.fail(generation, e);
                            break;
                        }
                    }
                }

                fix = fixes.recv() => match fix {
                    Some(Ok(raw)) => match raw.normalize() {
                        Ok(position) => self.emit(generation, position),
                        Err(e) => self.note_error(generation, e),
                    },
                    Some(Err(e)) if e.is_recoverable() => self.note_error(generation, e),
                    Some(Err(e)) => {
                        self.fail(generation, e);
                        break;
                    }
                    None => {
                        self.fail(generation, EngineError::unavailable("position stream closed"));
                        break;
                    }
                },

                _ = check.tick() => {
                    match self.permissions.query(Capability::Geolocation).await {
                        Ok(PermissionState::Denied) => {
                            self.fail(generation, EngineError::PermissionDenied);
                            break;
                        }
                        Ok(state) => debug!(state = ?state, "tracking_permission_ok"),
                        Err(e) => warn!(error = %e, "tracking_permission_check_failed"),
                    }
                }

                state = permission_changed(&mut changes) => {
                    if state == PermissionState::Denied {
                        self.fail(generation, EngineError::PermissionDenied);
                        break;
                    }
                }
            }
        }
    }

    /// Accept a tracked fix if `generation` is still the active session
    fn emit(&self, generation: u64, position: Position) {
        let persist = {
            let tracking = self.tracking.lock();
            if !matches!(tracking.as_ref(), Some(h) if h.generation == generation) {
                return;
            }
            let persist = self.record(&position);
            if let Some(ref tx) = self.position_tx {
                if tx.try_send(position).is_err() {
                    self.metrics.record_position_dropped();
                    warn!(dropped_total = %self.metrics.positions_dropped(), "tracking_position_dropped");
                }
            }
            if self.status_tx.borrow().error.is_some() {
                self.status_tx.send_replace(TrackingStatus { active: true, error: None });
            }
            persist
        };
        if let Some(p) = persist {
            self.persist(&p);
        }
    }

    fn note_error(&self, generation: u64, error: EngineError) {
        self.metrics.record_position_error();
        let tracking = self.tracking.lock();
        if matches!(tracking.as_ref(), Some(h) if h.generation == generation) {
            warn!(error = %error, kind = error.kind(), "tracking_fix_error");
            self.status_tx.send_replace(TrackingStatus { active: true, error: Some(error) });
        }
    }

    /// Force continuous mode inactive with `error`, from inside the task
    fn fail(&self, generation: u64, error: EngineError) {
        let mut tracking = self.tracking.lock();
        if !matches!(tracking.as_ref(), Some(h) if h.generation == generation) {
            return;
        }
        // Detach rather than abort: we are the task
        tracking.take();
        drop(tracking);
        self.metrics.record_position_error();
        warn!(error = %error, kind = error.kind(), generation = %generation, "tracking_stopped_on_error");
        self.status_tx.send_replace(TrackingStatus { active: false, error: Some(error) });
        self.flush_last_known();
    }

    fn refuse(&self, error: EngineError) -> EngineError {
        warn!(error = %error, kind = error.kind(), "tracking_not_started");
        self.status_tx.send_replace(TrackingStatus { active: false, error: Some(error.clone()) });
        error
    }

    /// Record a fix in memory; returns it when it is due for persistence
    fn record(&self, position: &Position) -> Option<Position> {
        let stale = position.is_stale(epoch_ms(), self.stale_threshold_ms);
        self.metrics.record_sample(stale);
        let due = {
            let mut state = self.state.lock();
            // Out-of-order fixes go to history but never replace a newer last position
            let newer = state.last.as_ref().map_or(true, |l| position.timestamp_ms >= l.timestamp_ms);
            if newer {
                state.last = Some(position.clone());
            }
            if state.history.len() >= self.history_len {
                state.history.pop_front();
            }
            state.history.push_back(position.clone());
            if !newer {
                return None;
            }
            let due = state
                .persisted_ms
                .map_or(true, |t| position.timestamp_ms >= t.saturating_add(PERSIST_INTERVAL_MS));
            if due {
                state.persisted_ms = Some(position.timestamp_ms);
            }
            due
        };
        self.latest_tx.send_replace(Some(position.clone()));
        debug!(
            lat = %position.latitude,
            lon = %position.longitude,
            accuracy_m = ?position.accuracy_m,
            stale = %stale,
            "position_sample"
        );
        due.then(|| position.clone())
    }

    fn persist(&self, position: &Position) {
        save_json(self.store.as_ref(), KEY_LAST_LOCATION, position);
    }

    /// Write the last known fix if a newer one than the stored fix exists
    fn flush_last_known(&self) {
        let pending = {
            let mut state = self.state.lock();
            match state.last.clone() {
                Some(p) if state.persisted_ms.map_or(true, |t| p.timestamp_ms > t) => {
                    state.persisted_ms = Some(p.timestamp_ms);
                    Some(p)
                }
                _ => None,
            }
        };
        if let Some(p) = pending {
            debug!(ts = %p.timestamp_ms, "sampler_last_position_flushed");
            self.persist(&p);
        }
    }
}

impl Drop for GeoSampler {
    fn drop(&mut self) {
        if let Some(mut handle) = self.tracking.get_mut().take() {
            if let Some(task) = handle.task.take() {
                task.abort();
            }
        }
    }
}

/// Next permission change, or never when the platform has no change stream
async fn permission_changed(rx: &mut Option<watch::Receiver<PermissionState>>) -> PermissionState {
    loop {
        let Some(r) = rx.as_mut() else {
            return std::future::pending().await;
        };
        if r.changed().await.is_ok() {
            return *r.borrow_and_update();
        }
        *rx = None;
    }
}

#[async_trait]
impl PositionProvider for GeoSampler {
    fn last_fresh(&self) -> Option<Position> {
        self.last_known().filter(|p| !p.is_stale(epoch_ms(), self.stale_threshold_ms))
    }

    async fn fresh(&self, limit: Duration) -> EngineResult<Position> {
        self.current_with_timeout(limit).await
    }
}
