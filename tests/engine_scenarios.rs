//! End-to-end scenarios through the engine facade

use sentinel_engine::domain::alert::{epoch_ms, Alert, AlertStatus};
use sentinel_engine::domain::types::{LatLng, TriggerKind, VoiceSettings, Zone, ZoneKind};
use sentinel_engine::error::EngineError;
use sentinel_engine::infra::{Config, KvStore, MemoryStore, Metrics};
use sentinel_engine::io::{
    RawFix, ScriptedSource, ScriptedTranscripts, StaticPermissions, TranscriptSegment,
};
use sentinel_engine::services::{EmergencyEngine, Platform};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

struct Harness {
    engine: Arc<EmergencyEngine>,
    positions: Arc<ScriptedSource>,
    transcripts: Arc<ScriptedTranscripts>,
    metrics: Arc<Metrics>,
}

fn danger_zone() -> Zone {
    Zone::new("z1", "Z1", LatLng::new(10.0, 10.0), 500.0, ZoneKind::Danger)
}

fn start_with(
    config: Config,
    positions: ScriptedSource,
    permissions: StaticPermissions,
    store: Arc<dyn KvStore>,
) -> Harness {
    let positions = Arc::new(positions);
    let transcripts = Arc::new(ScriptedTranscripts::new());
    let metrics = Arc::new(Metrics::new());
    let platform =
        Platform::new(positions.clone(), transcripts.clone(), Arc::new(permissions), store);
    let engine = EmergencyEngine::start(&config, platform, metrics.clone()).unwrap();
    Harness { engine, positions, transcripts, metrics }
}

fn start(config: Config) -> Harness {
    start_with(
        config,
        ScriptedSource::new(),
        StaticPermissions::granted(),
        Arc::new(MemoryStore::new()),
    )
}

async fn next_alert(rx: &mut mpsc::UnboundedReceiver<Alert>) -> Alert {
    timeout(Duration::from_secs(30), rx.recv()).await.expect("alert timed out").expect("hub closed")
}

#[tokio::test(start_paused = true)]
async fn test_danger_zone_fires_once_on_first_sample() {
    let h = start(Config::default().with_zones(vec![danger_zone()]));
    let (_sub, mut rx) = h.engine.subscribe_channel();
    let mut zone_events = h.engine.subscribe_zone_events();

    h.engine.start_tracking().await.unwrap();
    let t0 = epoch_ms();
    assert!(h.positions.emit(Ok(RawFix::new(10.0, 10.0, t0))));

    let pending = next_alert(&mut rx).await;
    assert_eq!(pending.status, AlertStatus::Pending);
    assert_eq!(pending.trigger.kind, TriggerKind::Geofence);
    assert_eq!(pending.trigger.detail.as_deref(), Some("Z1"));
    assert_eq!(pending.trigger.occurred_at, t0);

    assert!(h.positions.emit(Ok(RawFix::new(10.0001, 10.0001, t0 + 1000))));
    tokio::time::sleep(Duration::from_secs(10)).await;

    let geofence_alerts =
        h.engine.alerts().into_iter().filter(|a| a.trigger.kind == TriggerKind::Geofence).count();
    assert_eq!(geofence_alerts, 1);
    assert_eq!(h.metrics.danger_entries_total(), 1);
    assert!(h.engine.membership().in_danger());

    let first = zone_events.recv().await.unwrap();
    assert!(first.is_danger_entry());
    assert!(zone_events.try_recv().is_err());

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_alert_transitions_in_order() {
    let h = start(Config::default());
    let (_sub, mut rx) = h.engine.subscribe_channel();

    h.engine.press();
    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert!(h.engine.release());

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(next_alert(&mut rx).await.status);
    }
    assert_eq!(seen, AlertStatus::ALL.to_vec());
    assert_eq!(h.engine.active_alerts(), 0);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_hold_threshold() {
    let h = start(Config::default());

    h.engine.press();
    tokio::time::sleep(Duration::from_millis(1499)).await;
    assert!(!h.engine.release());
    tokio::task::yield_now().await;
    assert_eq!(h.metrics.triggers_total(TriggerKind::Manual), 0);

    h.engine.press();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    h.engine.release();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.metrics.triggers_total(TriggerKind::Manual), 1);
    assert_eq!(h.engine.alerts().len(), 1);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_voice_phrase_fires_once_per_utterance() {
    let voice = VoiceSettings {
        trigger_phrases: vec!["help".into(), "sos".into()],
        ..VoiceSettings::default()
    };
    let h = start(Config::default().with_voice_settings(voice));
    let (_sub, mut rx) = h.engine.subscribe_channel();

    h.engine.start_listening().await.unwrap();
    assert!(h.transcripts.say(TranscriptSegment::interim("please")));
    assert!(h.transcripts.say(TranscriptSegment::interim("please help")));
    assert!(h.transcripts.say(TranscriptSegment::interim("please help me")));
    assert!(h.transcripts.say(TranscriptSegment::final_("please help me help")));

    let pending = next_alert(&mut rx).await;
    assert_eq!(pending.trigger.kind, TriggerKind::Voice);
    assert_eq!(pending.trigger.detail.as_deref(), Some("help"));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.metrics.triggers_total(TriggerKind::Voice), 1);
    assert_eq!(h.engine.voice_status().last_detected_phrase.as_deref(), Some("help"));

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_position_sends_without_location_at_timeout() {
    let h = start_with(
        Config::default(),
        ScriptedSource::new().with_current_delay(Duration::from_millis(6000)),
        StaticPermissions::granted(),
        Arc::new(MemoryStore::new()),
    );
    h.positions.push_current(Ok(RawFix::new(1.0, 1.0, epoch_ms())));
    let (_sub, mut rx) = h.engine.subscribe_channel();

    h.engine.press();
    let pending = next_alert(&mut rx).await;
    let t0 = Instant::now();
    assert_eq!(pending.status, AlertStatus::Pending);

    let sent = next_alert(&mut rx).await;
    assert_eq!(sent.status, AlertStatus::Sent);
    assert_eq!(t0.elapsed(), Duration::from_millis(5000));
    assert!(sent.position.is_none());
    assert_eq!(h.metrics.alerts_without_position(), 1);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_denied_permission_leaves_tracking_inactive() {
    let h = start_with(
        Config::default(),
        ScriptedSource::new(),
        StaticPermissions::denied(),
        Arc::new(MemoryStore::new()),
    );

    let err = h.engine.start_tracking().await.unwrap_err();
    assert_eq!(err, EngineError::PermissionDenied);
    assert!(!h.engine.is_tracking());
    assert_eq!(h.engine.tracking_status().error, Some(EngineError::PermissionDenied));

    let err = h.engine.start_listening().await.unwrap_err();
    assert_eq!(err, EngineError::PermissionDenied);
    assert!(!h.engine.voice_status().listening);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_zones_persist_across_restart() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let first = start_with(
        Config::default(),
        ScriptedSource::new(),
        StaticPermissions::granted(),
        store.clone(),
    );
    first.engine.set_zones(vec![danger_zone()]).unwrap();
    let bad = Zone::new("z2", "Z2", LatLng::new(0.0, 0.0), -1.0, ZoneKind::Safe);
    assert!(first.engine.set_zones(vec![bad]).is_err());
    first.engine.shutdown().await;

    let safe = Zone::new("home", "Home", LatLng::new(0.0, 0.0), 100.0, ZoneKind::Safe);
    let second = start_with(
        Config::default().with_zones(vec![safe]),
        ScriptedSource::new(),
        StaticPermissions::granted(),
        store,
    );
    let zones = second.engine.zones();
    assert_eq!(zones.len(), 1);
    assert_eq!(zones[0].id.0, "z1");
    second.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_notifications_after_shutdown() {
    let h = start(Config::default());
    let (_sub, mut rx) = h.engine.subscribe_channel();

    h.engine.press();
    h.engine.shutdown().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(h.engine.hub().is_closed());
    assert!(h.engine.alerts().is_empty());
    while let Ok(alert) = rx.try_recv() {
        panic!("unexpected alert after shutdown: {:?}", alert.status);
    }
}
