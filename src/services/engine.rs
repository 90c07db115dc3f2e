//! Engine facade - wires sampler, geofence, trigger adapters and the alert
//! lifecycle into one handle owned by the caller
//!
//! Data flow:
//!
//! ```text
//! PositionSource -> GeoSampler -> GeofenceEvaluator -> GeofenceTrigger -+
//!                                                      ManualTrigger ---+-> AlertEngine -> NotificationHub
//! TranscriptSource ------------------------------------ VoiceTrigger ---+
//! ```

use crate::domain::alert::{Alert, AlertId};
use crate::domain::types::{Contact, Position, VoiceSettings, Zone};
use crate::error::EngineResult;
use crate::infra::store::{load_json, save_json, KEY_ZONES};
use crate::infra::{Config, KvStore, Metrics};
use crate::io::dispatch::{ContactDispatcher, DeliveryReport, LogDispatcher};
use crate::io::prometheus::EngineStatus;
use crate::io::sources::{PermissionOracle, PositionSource, TranscriptSource};
use crate::services::geofence::{validate_zones, GeofenceEvaluator, ZoneEvent, ZoneMembership};
use crate::services::hub::{AlertObserver, NotificationHub, Subscription};
use crate::services::lifecycle::{AlertEngine, LifecycleTimings, PositionProvider};
use crate::services::sampler::{GeoSampler, TrackingStatus};
use crate::services::triggers::{
    create_trigger_channel, GeofenceTrigger, ManualTrigger, VoiceStatus, VoiceTrigger,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const POSITION_BUFFER: usize = 64;
const DANGER_BUFFER: usize = 16;
const ZONE_EVENT_BUFFER: usize = 64;

/// Platform services the engine runs against
pub struct Platform {
    pub positions: Arc<dyn PositionSource>,
    pub transcripts: Arc<dyn TranscriptSource>,
    pub permissions: Arc<dyn PermissionOracle>,
    pub store: Arc<dyn KvStore>,
    pub dispatcher: Arc<dyn ContactDispatcher>,
}

impl Platform {
    pub fn new(
        positions: Arc<dyn PositionSource>,
        transcripts: Arc<dyn TranscriptSource>,
        permissions: Arc<dyn PermissionOracle>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        Self { positions, transcripts, permissions, store, dispatcher: Arc::new(LogDispatcher) }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn ContactDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }
}

pub struct EmergencyEngine {
    device_id: String,
    store: Arc<dyn KvStore>,
    metrics: Arc<Metrics>,
    sampler: Arc<GeoSampler>,
    geofence: Arc<GeofenceEvaluator>,
    manual: ManualTrigger,
    voice: Arc<VoiceTrigger>,
    alerts: Arc<AlertEngine>,
    hub: NotificationHub,
    zone_events: broadcast::Sender<ZoneEvent>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EmergencyEngine {
    /// Build every component and spawn the pipeline tasks
    ///
    /// Must be called inside a tokio runtime. Neither tracking nor listening
    /// is started; the manual control is live immediately.
    pub fn start(config: &Config, platform: Platform, metrics: Arc<Metrics>) -> EngineResult<Arc<Self>> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let zones = Self::initial_zones(config, platform.store.as_ref());
        let geofence = Arc::new(GeofenceEvaluator::new(zones, metrics.clone())?);

        let (position_tx, position_rx) = mpsc::channel(POSITION_BUFFER);
        let sampler = Arc::new(
            GeoSampler::new(
                config,
                platform.positions,
                platform.permissions.clone(),
                platform.store.clone(),
                metrics.clone(),
            )
            .with_position_tx(position_tx),
        );

        let (trigger_sender, trigger_rx) = create_trigger_channel(metrics.clone());
        let manual = ManualTrigger::new(config.hold_duration(), trigger_sender.clone());
        let voice = Arc::new(VoiceTrigger::new(
            config.voice_settings().clone(),
            platform.transcripts,
            platform.permissions,
            platform.store.clone(),
            trigger_sender.clone(),
        ));

        let hub = NotificationHub::new();
        let provider: Arc<dyn PositionProvider> = sampler.clone();
        let alerts = Arc::new(
            AlertEngine::new(provider, hub.clone(), LifecycleTimings::from_config(config), metrics.clone())
                .with_dispatcher(platform.dispatcher)
                .with_contacts(config.contacts().to_vec()),
        );

        let (danger_tx, danger_rx) = mpsc::channel(DANGER_BUFFER);
        let (edge_tx, mut edge_rx) = mpsc::unbounded_channel();
        let (zone_events, _) = broadcast::channel(ZONE_EVENT_BUFFER);

        let mut tasks = Vec::with_capacity(4);
        tasks.push(tokio::spawn(geofence.clone().run(
            position_rx,
            danger_tx,
            Some(edge_tx),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(GeofenceTrigger::new(trigger_sender).run(danger_rx, shutdown_rx.clone())));
        tasks.push(tokio::spawn(alerts.clone().run(trigger_rx, shutdown_rx)));

        let relay = zone_events.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = edge_rx.recv().await {
                // No subscribers is fine
                let _ = relay.send(event);
            }
        }));

        info!(
            device = %config.device_id(),
            zones = %geofence.zones().len(),
            contacts = %config.contacts().len(),
            hold_ms = %config.hold_duration().as_millis(),
            "engine_started"
        );

        Ok(Arc::new(Self {
            device_id: config.device_id().to_string(),
            store: platform.store,
            metrics,
            sampler,
            geofence,
            manual,
            voice,
            alerts,
            hub,
            zone_events,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }))
    }

    /// Stored zones win over configured ones when they validate
    fn initial_zones(config: &Config, store: &dyn KvStore) -> Vec<Zone> {
        match load_json::<Vec<Zone>>(store, KEY_ZONES) {
            Some(stored) => match validate_zones(&stored) {
                Ok(()) => {
                    info!(zones = %stored.len(), "zones_restored");
                    stored
                }
                Err(e) => {
                    warn!(error = %e, "zones_stored_invalid");
                    config.zones().to_vec()
                }
            },
            None => config.zones().to_vec(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    // Position tracking

    pub async fn start_tracking(&self) -> EngineResult<()> {
        self.sampler.start_tracking().await
    }

    pub fn stop_tracking(&self) -> bool {
        self.sampler.stop_tracking()
    }

    pub fn is_tracking(&self) -> bool {
        self.sampler.is_tracking()
    }

    pub fn tracking_status(&self) -> TrackingStatus {
        self.sampler.status()
    }

    pub fn subscribe_tracking(&self) -> watch::Receiver<TrackingStatus> {
        self.sampler.subscribe_status()
    }

    /// One fresh fix, bounded by the sample timeout
    pub async fn locate(&self) -> EngineResult<Position> {
        self.sampler.current().await
    }

    pub fn last_position(&self) -> Option<Position> {
        self.sampler.last_known()
    }

    pub fn subscribe_positions(&self) -> watch::Receiver<Option<Position>> {
        self.sampler.subscribe_positions()
    }

    pub fn history(&self) -> Vec<Position> {
        self.sampler.history()
    }

    // Geofence

    pub fn zones(&self) -> Vec<Zone> {
        self.geofence.zones()
    }

    /// Replace the zone set and persist it
    pub fn set_zones(&self, zones: Vec<Zone>) -> EngineResult<()> {
        self.geofence.set_zones(zones.clone())?;
        save_json(self.store.as_ref(), KEY_ZONES, &zones);
        Ok(())
    }

    pub fn membership(&self) -> ZoneMembership {
        self.geofence.membership()
    }

    pub fn subscribe_membership(&self) -> watch::Receiver<ZoneMembership> {
        self.geofence.subscribe_membership()
    }

    /// Zone entry and exit edges observed from now on
    pub fn subscribe_zone_events(&self) -> broadcast::Receiver<ZoneEvent> {
        self.zone_events.subscribe()
    }

    // Manual control

    pub fn press(&self) -> bool {
        self.manual.press()
    }

    pub fn release(&self) -> bool {
        self.manual.release()
    }

    pub fn is_holding(&self) -> bool {
        self.manual.is_holding()
    }

    pub fn hold_progress(&self) -> f64 {
        self.manual.progress()
    }

    // Voice

    pub async fn start_listening(&self) -> EngineResult<()> {
        self.voice.start_listening().await
    }

    pub async fn stop_listening(&self) {
        self.voice.stop_listening().await
    }

    pub fn voice_status(&self) -> VoiceStatus {
        self.voice.status()
    }

    pub fn subscribe_voice(&self) -> watch::Receiver<VoiceStatus> {
        self.voice.subscribe_status()
    }

    pub fn voice_settings(&self) -> VoiceSettings {
        self.voice.settings()
    }

    pub fn update_voice_settings(&self, settings: VoiceSettings) -> EngineResult<()> {
        self.voice.update_settings(settings)
    }

    pub fn add_phrase(&self, phrase: &str) -> EngineResult<bool> {
        self.voice.add_phrase(phrase)
    }

    pub fn remove_phrase(&self, phrase: &str) -> EngineResult<bool> {
        self.voice.remove_phrase(phrase)
    }

    // Alerts

    pub fn subscribe<O: AlertObserver + 'static>(&self, observer: O) -> Subscription {
        self.hub.subscribe(observer)
    }

    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<Alert>) {
        self.hub.subscribe_channel()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.alerts()
    }

    pub fn alert(&self, id: &AlertId) -> Option<Alert> {
        self.alerts.alert(id)
    }

    pub fn latest_alert(&self) -> Option<Alert> {
        self.alerts.latest_alert()
    }

    pub fn active_alerts(&self) -> usize {
        self.alerts.active_count()
    }

    pub fn acknowledge(&self, id: &AlertId) -> bool {
        self.alerts.acknowledge(id)
    }

    pub fn report_delivery(&self, id: &AlertId, report: DeliveryReport) -> bool {
        self.alerts.report(id, report)
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.alerts.contacts()
    }

    pub fn set_contacts(&self, contacts: Vec<Contact>) {
        self.alerts.set_contacts(contacts)
    }

    /// Stop every source and task; no observer is called afterwards
    pub async fn shutdown(&self) {
        self.manual.release();
        self.sampler.stop_tracking();
        self.voice.stop_listening().await;
        let _ = self.shutdown_tx.send(true);
        self.alerts.shutdown();
        self.hub.close();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        info!(device = %self.device_id, "engine_stopped");
    }
}

impl EngineStatus for EmergencyEngine {
    fn zones_occupied(&self) -> usize {
        self.membership().len()
    }

    fn tracking_active(&self) -> bool {
        self.is_tracking()
    }

    fn alerts_json(&self) -> String {
        serde_json::to_string(&self.alerts()).unwrap_or_else(|_| "[]".to_string())
    }

    fn acknowledge(&self, alert_id: &str) -> bool {
        EmergencyEngine::acknowledge(self, &AlertId(alert_id.to_string()))
    }
}
