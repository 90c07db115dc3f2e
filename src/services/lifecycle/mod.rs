//! Alert lifecycle engine
//!
//! One alert per trigger, each driven by its own task through
//! `pending → sent → delivered → acknowledged`:
//!
//! - `pending → sent` right after position resolution: a fresh cached fix
//!   is reused, otherwise one fresh fix is awaited for at most the
//!   position timeout. Any failure resolves to `None` and the alert goes on.
//! - `sent → delivered` on the delivery delay or a `Delivered` report,
//!   whichever comes first.
//! - `delivered → acknowledged` on the ack delay (measured from `sent`) or
//!   an `Acknowledged` report, whichever comes first.
//!
//! The lifecycle task is the only writer of its alert and publishes each
//! snapshot before moving on, so every observer sees one alert's
//! transitions in order. `raise` never waits on any of this.

use crate::domain::alert::{Alert, AlertId, AlertStatus};
use crate::domain::types::{Contact, Position, Trigger, TriggerKind};
use crate::error::EngineResult;
use crate::infra::{Config, Metrics};
use crate::io::dispatch::{ContactDispatcher, DeliveryReport, DeliveryReporter};
use crate::services::hub::NotificationHub;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Where alerts get their position snapshot
#[async_trait]
pub trait PositionProvider: Send + Sync {
    /// Last known fix if it is not stale
    fn last_fresh(&self) -> Option<Position>;

    /// One fresh fix, bounded by `limit`
    async fn fresh(&self, limit: Duration) -> EngineResult<Position>;
}

/// Stage timing, taken from the `[lifecycle]` config section
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifecycleTimings {
    pub position_timeout: Duration,
    pub delivery_delay: Duration,
    pub ack_delay: Duration,
    /// When false, only reports advance past `sent`
    pub simulate_delivery: bool,
    pub dedup_window: Option<Duration>,
}

impl LifecycleTimings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            position_timeout: config.position_timeout(),
            delivery_delay: config.delivery_delay(),
            ack_delay: config.ack_delay(),
            simulate_delivery: config.simulate_delivery(),
            dedup_window: config.dedup_window(),
        }
    }
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct LiveAlert {
    reports: mpsc::UnboundedSender<DeliveryReport>,
    task: Option<AbortHandle>,
}

#[derive(Default)]
struct AlertRegistry {
    order: Vec<AlertId>,
    alerts: FxHashMap<AlertId, Alert>,
}

pub struct AlertEngine {
    positions: Arc<dyn PositionProvider>,
    hub: NotificationHub,
    dispatcher: Option<Arc<dyn ContactDispatcher>>,
    contacts: RwLock<Vec<Contact>>,
    timings: LifecycleTimings,
    registry: RwLock<AlertRegistry>,
    live: Mutex<FxHashMap<AlertId, LiveAlert>>,
    recent: Mutex<FxHashMap<(TriggerKind, Option<String>), Instant>>,
    metrics: Arc<Metrics>,
}

impl AlertEngine {
    pub fn new(
        positions: Arc<dyn PositionProvider>,
        hub: NotificationHub,
        timings: LifecycleTimings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            positions,
            hub,
            dispatcher: None,
            contacts: RwLock::new(Vec::new()),
            timings,
            registry: RwLock::new(AlertRegistry::default()),
            live: Mutex::new(FxHashMap::default()),
            recent: Mutex::new(FxHashMap::default()),
            metrics,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn ContactDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_contacts(self, contacts: Vec<Contact>) -> Self {
        *self.contacts.write() = contacts;
        self
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    pub fn timings(&self) -> LifecycleTimings {
        self.timings
    }

    /// Contact list snapshotted into each new alert
    pub fn set_contacts(&self, contacts: Vec<Contact>) {
        info!(contacts = %contacts.len(), "alert_contacts_updated");
        *self.contacts.write() = contacts;
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts.read().clone()
    }

    /// Create an alert for `trigger` and start its lifecycle
    ///
    /// Returns None only when the dedup window suppressed the trigger.
    pub fn raise(self: &Arc<Self>, trigger: Trigger) -> Option<AlertId> {
        if self.suppressed(&trigger) {
            self.metrics.record_trigger_suppressed();
            info!(kind = %trigger.kind, detail = ?trigger.detail, "trigger_suppressed");
            return None;
        }

        let alert = Alert::new(trigger, self.contacts());
        let id = alert.id.clone();
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        self.live.lock().insert(id.clone(), LiveAlert { reports: report_tx.clone(), task: None });
        self.registry.write().order.push(id.clone());
        self.commit(&alert);

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.drive(alert, report_tx, report_rx).await;
        });
        if let Some(live) = self.live.lock().get_mut(&id) {
            live.task = Some(handle.abort_handle());
        }
        Some(id)
    }

    /// Consume the Trigger channel until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut triggers: mpsc::UnboundedReceiver<Trigger>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            position_timeout_ms = %self.timings.position_timeout.as_millis(),
            delivery_delay_ms = %self.timings.delivery_delay.as_millis(),
            ack_delay_ms = %self.timings.ack_delay.as_millis(),
            simulate_delivery = %self.timings.simulate_delivery,
            "alert_engine_started"
        );
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("alert_engine_shutdown");
                        break;
                    }
                }
                maybe = triggers.recv() => {
                    let Some(trigger) = maybe else {
                        info!("trigger_channel_closed");
                        break;
                    };
                    self.raise(trigger);
                }
            }
        }
    }

    /// Report delivery progress for a live alert
    pub fn report(&self, id: &AlertId, report: DeliveryReport) -> bool {
        match self.live.lock().get(id) {
            Some(live) => live.reports.send(report).is_ok(),
            None => {
                debug!(alert_id = %id, report = ?report, "report_for_unknown_or_finished_alert");
                false
            }
        }
    }

    /// Explicit acknowledgment signal
    pub fn acknowledge(&self, id: &AlertId) -> bool {
        self.report(id, DeliveryReport::Acknowledged)
    }

    /// All alerts in creation order, latest snapshot of each
    pub fn alerts(&self) -> Vec<Alert> {
        let registry = self.registry.read();
        registry.order.iter().filter_map(|id| registry.alerts.get(id).cloned()).collect()
    }

    pub fn alert(&self, id: &AlertId) -> Option<Alert> {
        self.registry.read().alerts.get(id).cloned()
    }

    pub fn latest_alert(&self) -> Option<Alert> {
        let registry = self.registry.read();
        registry.order.last().and_then(|id| registry.alerts.get(id).cloned())
    }

    /// Alerts not yet acknowledged
    pub fn active_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Abort every running lifecycle; alerts keep their last status
    pub fn shutdown(&self) {
        let live: Vec<(AlertId, LiveAlert)> = self.live.lock().drain().collect();
        for (id, entry) in &live {
            if let Some(ref task) = entry.task {
                task.abort();
            }
            debug!(alert_id = %id, "alert_lifecycle_aborted");
        }
        info!(aborted = %live.len(), "alert_engine_stopped");
    }

    fn suppressed(&self, trigger: &Trigger) -> bool {
        let Some(window) = self.timings.dedup_window else {
            return false;
        };
        let now = Instant::now();
        let key = (trigger.kind, trigger.detail.clone());
        let mut recent = self.recent.lock();
        recent.retain(|_, at| now.duration_since(*at) < window);
        if recent.contains_key(&key) {
            return true;
        }
        recent.insert(key, now);
        false
    }

    /// Record and publish one snapshot
    fn commit(&self, alert: &Alert) {
        self.registry.write().alerts.insert(alert.id.clone(), alert.clone());
        self.metrics.record_alert_status(alert.status);
        info!(
            alert_id = %alert.id,
            status = %alert.status,
            trigger = %alert.trigger.kind,
            detail = ?alert.trigger.detail,
            has_position = %alert.position.is_some(),
            "alert_transition"
        );
        self.hub.publish(alert);
    }

    async fn resolve_position(&self, alert_id: &AlertId) -> Option<Position> {
        if let Some(cached) = self.positions.last_fresh() {
            debug!(alert_id = %alert_id, "alert_position_cached");
            return Some(cached);
        }
        let limit = self.timings.position_timeout;
        match timeout(limit, self.positions.fresh(limit)).await {
            Ok(Ok(position)) => Some(position),
            Ok(Err(e)) => {
                warn!(alert_id = %alert_id, error = %e, kind = e.kind(), "alert_position_failed");
                None
            }
            Err(_) => {
                warn!(alert_id = %alert_id, timeout_ms = %limit.as_millis(), "alert_position_timeout");
                None
            }
        }
    }

    async fn drive(
        self: Arc<Self>,
        mut alert: Alert,
        report_tx: mpsc::UnboundedSender<DeliveryReport>,
        mut reports: mpsc::UnboundedReceiver<DeliveryReport>,
    ) {
        // pending → sent
        let started = Instant::now();
        let position = self.resolve_position(&alert.id).await;
        self.metrics.record_position_resolution(started.elapsed().as_millis() as u64);
        if position.is_none() {
            self.metrics.record_alert_without_position();
        }
        alert.resolve_position(position);
        alert.advance();
        self.commit(&alert);
        let sent_at = Instant::now();

        if let Some(ref dispatcher) = self.dispatcher {
            let dispatcher = Arc::clone(dispatcher);
            let snapshot = alert.clone();
            let reporter = DeliveryReporter::new(alert.id.clone(), report_tx);
            tokio::spawn(async move {
                dispatcher.dispatch(&snapshot, reporter).await;
            });
        } else {
            drop(report_tx);
        }

        // sent → delivered
        let simulate = self.timings.simulate_delivery;
        let delivery_deadline = sent_at + self.timings.delivery_delay;
        // The live entry holds a sender until this task removes it, so a
        // closed report channel means shutdown dropped the alert.
        let ack_early = tokio::select! {
            biased;
            report = reports.recv() => match report {
                Some(DeliveryReport::Delivered) => false,
                Some(DeliveryReport::Acknowledged) => true,
                None => {
                    debug!(alert_id = %alert.id, "alert_lifecycle_dropped");
                    return;
                }
            },
            _ = sleep_until(delivery_deadline), if simulate => false,
        };
        alert.advance();
        self.commit(&alert);

        // delivered → acknowledged
        if !ack_early {
            let ack_deadline = sent_at + self.timings.ack_delay;
            loop {
                tokio::select! {
                    biased;
                    report = reports.recv() => match report {
                        Some(DeliveryReport::Acknowledged) => break,
                        Some(DeliveryReport::Delivered) => {}
                        None => {
                            debug!(alert_id = %alert.id, "alert_lifecycle_dropped");
                            return;
                        }
                    },
                    _ = sleep_until(ack_deadline), if simulate => break,
                }
            }
        }
        alert.advance();
        self.live.lock().remove(&alert.id);
        self.commit(&alert);
    }
}
