use super::*;
use crate::domain::alert::epoch_ms;
use crate::error::EngineError;
use crate::infra::Metrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::sleep;

struct FakePositions {
    cached: Mutex<Option<Position>>,
    fresh_delay: Duration,
    fresh: Mutex<Option<EngineResult<Position>>>,
    fresh_calls: AtomicUsize,
}

impl FakePositions {
    fn cached(position: Position) -> Self {
        Self {
            cached: Mutex::new(Some(position)),
            fresh_delay: Duration::ZERO,
            fresh: Mutex::new(None),
            fresh_calls: AtomicUsize::new(0),
        }
    }

    fn slow(delay: Duration, result: EngineResult<Position>) -> Self {
        Self {
            cached: Mutex::new(None),
            fresh_delay: delay,
            fresh: Mutex::new(Some(result)),
            fresh_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PositionProvider for FakePositions {
    fn last_fresh(&self) -> Option<Position> {
        self.cached.lock().clone()
    }

    // Deliberately ignores `limit` so the engine's own timeout is exercised
    async fn fresh(&self, _limit: Duration) -> EngineResult<Position> {
        self.fresh_calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.fresh_delay).await;
        self.fresh.lock().clone().unwrap_or_else(|| Err(EngineError::unavailable("no fix")))
    }
}

type Seen = Arc<Mutex<Vec<(AlertId, AlertStatus)>>>;

fn record(hub: &NotificationHub) -> (Seen, crate::services::hub::Subscription) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let sub = hub.subscribe(move |a: &Alert| s.lock().push((a.id.clone(), a.status)));
    (seen, sub)
}

fn statuses(seen: &Seen, id: &AlertId) -> Vec<AlertStatus> {
    seen.lock().iter().filter(|(a, _)| a == id).map(|(_, s)| *s).collect()
}

fn here() -> Position {
    Position::new(10.0, 10.0, epoch_ms())
}

fn engine_with(positions: FakePositions, timings: LifecycleTimings) -> (Arc<AlertEngine>, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new());
    let engine = AlertEngine::new(Arc::new(positions), NotificationHub::new(), timings, metrics.clone());
    (Arc::new(engine), metrics)
}

fn manual() -> Trigger {
    Trigger::new(TriggerKind::Manual, None, epoch_ms())
}

#[tokio::test(start_paused = true)]
async fn test_full_lifecycle_in_order() {
    let (engine, metrics) = engine_with(FakePositions::cached(here()), LifecycleTimings::default());
    let (seen, _sub) = record(engine.hub());

    let id = engine.raise(manual()).unwrap();
    sleep(Duration::from_secs(4)).await;

    assert_eq!(
        statuses(&seen, &id),
        vec![AlertStatus::Pending, AlertStatus::Sent, AlertStatus::Delivered, AlertStatus::Acknowledged]
    );
    let alert = engine.alert(&id).unwrap();
    assert_eq!(alert.status, AlertStatus::Acknowledged);
    assert!(alert.position.is_some());
    assert_eq!(engine.active_count(), 0);
    assert_eq!(metrics.alerts_in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stage_timing() {
    let (engine, _) = engine_with(FakePositions::cached(here()), LifecycleTimings::default());
    let t0 = Instant::now();
    let id = engine.raise(manual()).unwrap();
    assert_eq!(engine.alert(&id).unwrap().status, AlertStatus::Pending);

    sleep_until(t0 + Duration::from_millis(1)).await;
    assert_eq!(engine.alert(&id).unwrap().status, AlertStatus::Sent);
    sleep_until(t0 + Duration::from_millis(999)).await;
    assert_eq!(engine.alert(&id).unwrap().status, AlertStatus::Sent);
    sleep_until(t0 + Duration::from_millis(1001)).await;
    assert_eq!(engine.alert(&id).unwrap().status, AlertStatus::Delivered);
    sleep_until(t0 + Duration::from_millis(2999)).await;
    assert_eq!(engine.alert(&id).unwrap().status, AlertStatus::Delivered);
    sleep_until(t0 + Duration::from_millis(3001)).await;
    assert_eq!(engine.alert(&id).unwrap().status, AlertStatus::Acknowledged);
}

#[tokio::test(start_paused = true)]
async fn test_position_timeout_sends_without_position() {
    let positions = FakePositions::slow(Duration::from_millis(6000), Ok(here()));
    let (engine, metrics) = engine_with(positions, LifecycleTimings::default());
    let t0 = Instant::now();
    let id = engine.raise(manual()).unwrap();

    sleep_until(t0 + Duration::from_millis(4999)).await;
    assert_eq!(engine.alert(&id).unwrap().status, AlertStatus::Pending);

    sleep_until(t0 + Duration::from_millis(5001)).await;
    let alert = engine.alert(&id).unwrap();
    assert_eq!(alert.status, AlertStatus::Sent);
    assert!(alert.position.is_none());
    assert!(alert.position_resolved());
    assert_eq!(metrics.alerts_without_position(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_position_error_is_absorbed() {
    let positions = FakePositions::slow(Duration::from_millis(10), Err(EngineError::PermissionDenied));
    let (engine, _) = engine_with(positions, LifecycleTimings::default());
    let (seen, _sub) = record(engine.hub());
    let id = engine.raise(manual()).unwrap();

    sleep(Duration::from_secs(5)).await;
    assert_eq!(statuses(&seen, &id).len(), 4);
    assert!(engine.alert(&id).unwrap().position.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_fresh_fix_used_when_no_cache() {
    let fix = Position::new(1.0, 2.0, epoch_ms());
    let positions = Arc::new(FakePositions::slow(Duration::from_millis(200), Ok(fix.clone())));
    let engine = Arc::new(AlertEngine::new(
        positions.clone(),
        NotificationHub::new(),
        LifecycleTimings::default(),
        Arc::new(Metrics::new()),
    ));
    let id = engine.raise(manual()).unwrap();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.alert(&id).unwrap().position, Some(fix));
    assert_eq!(positions.fresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_ack_beats_timer() {
    let (engine, _) = engine_with(FakePositions::cached(here()), LifecycleTimings::default());
    let t0 = Instant::now();
    let id = engine.raise(manual()).unwrap();

    sleep_until(t0 + Duration::from_millis(1500)).await;
    assert_eq!(engine.alert(&id).unwrap().status, AlertStatus::Delivered);
    assert!(engine.acknowledge(&id));
    sleep_until(t0 + Duration::from_millis(1501)).await;
    assert_eq!(engine.alert(&id).unwrap().status, AlertStatus::Acknowledged);
    assert!(!engine.acknowledge(&id));
}

#[tokio::test(start_paused = true)]
async fn test_ack_while_sent_does_not_skip_delivered() {
    let (engine, _) = engine_with(FakePositions::cached(here()), LifecycleTimings::default());
    let (seen, _sub) = record(engine.hub());
    let id = engine.raise(manual()).unwrap();

    sleep(Duration::from_millis(100)).await;
    assert!(engine.acknowledge(&id));
    sleep(Duration::from_millis(1)).await;

    assert_eq!(
        statuses(&seen, &id),
        vec![AlertStatus::Pending, AlertStatus::Sent, AlertStatus::Delivered, AlertStatus::Acknowledged]
    );
}

#[tokio::test(start_paused = true)]
async fn test_external_delivery_without_simulation() {
    let timings = LifecycleTimings { simulate_delivery: false, ..LifecycleTimings::default() };
    let (engine, _) = engine_with(FakePositions::cached(here()), timings);
    let id = engine.raise(manual()).unwrap();

    sleep(Duration::from_secs(10)).await;
    assert_eq!(engine.alert(&id).unwrap().status, AlertStatus::Sent);

    assert!(engine.report(&id, DeliveryReport::Delivered));
    sleep(Duration::from_millis(1)).await;
    assert_eq!(engine.alert(&id).unwrap().status, AlertStatus::Delivered);

    sleep(Duration::from_secs(10)).await;
    assert!(engine.acknowledge(&id));
    sleep(Duration::from_millis(1)).await;
    assert_eq!(engine.alert(&id).unwrap().status, AlertStatus::Acknowledged);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_alerts_are_independent() {
    let positions = FakePositions::slow(Duration::from_millis(6000), Ok(here()));
    let (engine, _) = engine_with(positions, LifecycleTimings::default());
    let (seen, _sub) = record(engine.hub());

    let a = engine.raise(manual()).unwrap();
    sleep(Duration::from_millis(500)).await;
    let b = engine.raise(Trigger::new(TriggerKind::Voice, Some("help".into()), epoch_ms())).unwrap();
    assert_ne!(a, b);

    sleep(Duration::from_secs(9)).await;
    for id in [&a, &b] {
        assert_eq!(
            statuses(&seen, id),
            vec![AlertStatus::Pending, AlertStatus::Sent, AlertStatus::Delivered, AlertStatus::Acknowledged]
        );
    }
    let ids: Vec<AlertId> = engine.alerts().into_iter().map(|x| x.id).collect();
    assert_eq!(ids, vec![a, b.clone()]);
    assert_eq!(engine.latest_alert().unwrap().id, b);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_mid_lifecycle() {
    let (engine, _) = engine_with(FakePositions::cached(here()), LifecycleTimings::default());
    let (seen_a, sub_a) = record(engine.hub());
    let (seen_b, _sub_b) = record(engine.hub());

    let id = engine.raise(manual()).unwrap();
    sleep(Duration::from_millis(500)).await;
    sub_a.unsubscribe();
    sleep(Duration::from_secs(4)).await;

    assert_eq!(statuses(&seen_a, &id), vec![AlertStatus::Pending, AlertStatus::Sent]);
    assert_eq!(statuses(&seen_b, &id).len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_no_dedup_by_default() {
    let (engine, _) = engine_with(FakePositions::cached(here()), LifecycleTimings::default());
    assert!(engine.raise(manual()).is_some());
    assert!(engine.raise(manual()).is_some());
    assert_eq!(engine.alerts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dedup_window() {
    let timings = LifecycleTimings { dedup_window: Some(Duration::from_secs(2)), ..LifecycleTimings::default() };
    let (engine, metrics) = engine_with(FakePositions::cached(here()), timings);
    let voice = |p: &str| Trigger::new(TriggerKind::Voice, Some(p.to_string()), epoch_ms());

    assert!(engine.raise(voice("help")).is_some());
    assert!(engine.raise(voice("help")).is_none());
    assert!(engine.raise(voice("sos")).is_some());
    assert_eq!(metrics.triggers_suppressed(), 1);

    sleep(Duration::from_millis(2001)).await;
    assert!(engine.raise(voice("help")).is_some());
}

struct AckingDispatcher {
    seen: Mutex<Vec<Alert>>,
}

#[async_trait]
impl ContactDispatcher for AckingDispatcher {
    async fn dispatch(&self, alert: &Alert, reporter: DeliveryReporter) {
        self.seen.lock().push(alert.clone());
        reporter.delivered();
        reporter.acknowledged();
    }
}

#[tokio::test(start_paused = true)]
async fn test_dispatcher_receives_sent_snapshot() {
    let dispatcher = Arc::new(AckingDispatcher { seen: Mutex::new(Vec::new()) });
    let contacts = vec![Contact {
        id: "c1".into(),
        name: "Sam".into(),
        phone: "+100".into(),
        relation: "friend".into(),
    }];
    let engine = Arc::new(
        AlertEngine::new(
            Arc::new(FakePositions::cached(here())),
            NotificationHub::new(),
            LifecycleTimings::default(),
            Arc::new(Metrics::new()),
        )
        .with_dispatcher(dispatcher.clone())
        .with_contacts(contacts.clone()),
    );

    let id = engine.raise(manual()).unwrap();
    sleep(Duration::from_millis(10)).await;

    let seen = dispatcher.seen.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status, AlertStatus::Sent);
    assert_eq!(seen[0].contacts, contacts);
    assert!(seen[0].position.is_some());
    // Dispatcher reports finished the lifecycle well before the timers
    assert_eq!(engine.alert(&id).unwrap().status, AlertStatus::Acknowledged);
}

#[tokio::test(start_paused = true)]
async fn test_contacts_snapshot_per_alert() {
    let (engine, _) = engine_with(FakePositions::cached(here()), LifecycleTimings::default());
    let first = engine.raise(manual()).unwrap();
    engine.set_contacts(vec![Contact {
        id: "c2".into(),
        name: "Alex".into(),
        phone: "+200".into(),
        relation: String::new(),
    }]);
    let second = engine.raise(manual()).unwrap();
    assert!(engine.alert(&first).unwrap().contacts.is_empty());
    assert_eq!(engine.alert(&second).unwrap().contacts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_consumes_triggers() {
    let (engine, _) = engine_with(FakePositions::cached(here()), LifecycleTimings::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(engine.clone().run(rx, shutdown_rx));

    tx.send(manual()).unwrap();
    tx.send(Trigger::new(TriggerKind::Geofence, Some("Underpass".into()), epoch_ms())).unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.alerts().len(), 2);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_panicking_observer_does_not_stop_run() {
    let (engine, _) = engine_with(FakePositions::cached(here()), LifecycleTimings::default());
    let _faulty = engine.hub().subscribe(|a: &Alert| {
        if a.status == AlertStatus::Pending {
            panic!("observer failure");
        }
    });
    let (seen, _sub) = record(engine.hub());
    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(engine.clone().run(rx, shutdown_rx));

    tx.send(manual()).unwrap();
    sleep(Duration::from_millis(10)).await;
    assert!(tx.send(Trigger::new(TriggerKind::Voice, Some("help".into()), epoch_ms())).is_ok());
    sleep(Duration::from_secs(4)).await;

    let alerts = engine.alerts();
    assert_eq!(alerts.len(), 2);
    for alert in &alerts {
        assert_eq!(alert.status, AlertStatus::Acknowledged);
        assert_eq!(statuses(&seen, &alert.id), AlertStatus::ALL.to_vec());
    }
    assert!(!task.is_finished());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_aborts_lifecycles() {
    let (engine, _) = engine_with(FakePositions::cached(here()), LifecycleTimings::default());
    let id = engine.raise(manual()).unwrap();
    sleep(Duration::from_millis(10)).await;
    engine.shutdown();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(engine.alert(&id).unwrap().status, AlertStatus::Sent);
    assert_eq!(engine.active_count(), 0);
}
