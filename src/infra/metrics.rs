//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Reporting swaps the periodic counters to get a snapshot.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters
//! only and must not be used for coordination.

use crate::domain::alert::AlertStatus;
use crate::domain::types::TriggerKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Position-resolution latency bucket boundaries (milliseconds)
/// Buckets: ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, ≤10000, >10000
const BUCKET_BOUNDS: [u64; 10] = [10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];
const NUM_BUCKETS: usize = 11;

const NUM_TRIGGER_KINDS: usize = 3;
const NUM_STATUSES: usize = 4;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

#[inline]
fn load_all<const N: usize>(counters: &[AtomicU64; N]) -> [u64; N] {
    std::array::from_fn(|i| counters[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000, 20000];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Position samples accepted (monotonic)
    samples_total: AtomicU64,
    /// Samples that were already stale on arrival (monotonic)
    stale_samples_total: AtomicU64,
    /// Position source errors (monotonic)
    position_errors_total: AtomicU64,
    /// Tracking updates dropped because the consumer lagged (monotonic)
    positions_dropped: AtomicU64,
    /// Danger-zone entry edges (monotonic)
    danger_entries_total: AtomicU64,
    /// Zone entry edges of any kind (monotonic)
    zone_entries_total: AtomicU64,
    /// Zone exit edges (monotonic)
    zone_exits_total: AtomicU64,
    /// Triggers per kind, indexed by `TriggerKind::index`
    triggers_total: [AtomicU64; NUM_TRIGGER_KINDS],
    /// Triggers suppressed by the dedup window
    triggers_suppressed: AtomicU64,
    /// Alert transitions per status, indexed by `AlertStatus::index`
    alerts_by_status: [AtomicU64; NUM_STATUSES],
    /// Alerts that reached `sent` with no position
    alerts_without_position: AtomicU64,
    /// Alerts currently between pending and acknowledged
    alerts_in_flight: AtomicU64,
    /// Egress messages dropped due to channel full (monotonic)
    egress_dropped: AtomicU64,
    /// Position resolution latency histogram (reset on report)
    resolve_buckets: [AtomicU64; NUM_BUCKETS],
    resolve_sum_ms: AtomicU64,
    resolve_max_ms: AtomicU64,
    /// Samples since last report (reset on report)
    samples_since_report: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_total: AtomicU64::new(0),
            stale_samples_total: AtomicU64::new(0),
            position_errors_total: AtomicU64::new(0),
            positions_dropped: AtomicU64::new(0),
            danger_entries_total: AtomicU64::new(0),
            zone_entries_total: AtomicU64::new(0),
            zone_exits_total: AtomicU64::new(0),
            triggers_total: std::array::from_fn(|_| AtomicU64::new(0)),
            triggers_suppressed: AtomicU64::new(0),
            alerts_by_status: std::array::from_fn(|_| AtomicU64::new(0)),
            alerts_without_position: AtomicU64::new(0),
            alerts_in_flight: AtomicU64::new(0),
            egress_dropped: AtomicU64::new(0),
            resolve_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            resolve_sum_ms: AtomicU64::new(0),
            resolve_max_ms: AtomicU64::new(0),
            samples_since_report: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_sample(&self, stale: bool) {
        self.samples_total.fetch_add(1, Ordering::Relaxed);
        self.samples_since_report.fetch_add(1, Ordering::Relaxed);
        if stale {
            self.stale_samples_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_position_error(&self) {
        self.position_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_position_dropped(&self) {
        self.positions_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_zone_entry(&self, danger: bool) {
        self.zone_entries_total.fetch_add(1, Ordering::Relaxed);
        if danger {
            self.danger_entries_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_zone_exit(&self) {
        self.zone_exits_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_trigger(&self, kind: TriggerKind) {
        self.triggers_total[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_trigger_suppressed(&self) {
        self.triggers_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an alert reaching `status`
    #[inline]
    pub fn record_alert_status(&self, status: AlertStatus) {
        self.alerts_by_status[status.index()].fetch_add(1, Ordering::Relaxed);
        match status {
            AlertStatus::Pending => {
                self.alerts_in_flight.fetch_add(1, Ordering::Relaxed);
            }
            AlertStatus::Acknowledged => {
                let _ = self.alerts_in_flight.fetch_update(
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                    |v| Some(v.saturating_sub(1)),
                );
            }
            _ => {}
        }
    }

    #[inline]
    pub fn record_alert_without_position(&self) {
        self.alerts_without_position.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long an alert waited for its position snapshot
    #[inline]
    pub fn record_position_resolution(&self, latency_ms: u64) {
        self.resolve_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.resolve_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.resolve_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_egress_dropped(&self) {
        self.egress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn samples_total(&self) -> u64 {
        self.samples_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn positions_dropped(&self) -> u64 {
        self.positions_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn danger_entries_total(&self) -> u64 {
        self.danger_entries_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn triggers_total(&self, kind: TriggerKind) -> u64 {
        self.triggers_total[kind.index()].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn triggers_suppressed(&self) -> u64 {
        self.triggers_suppressed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn alerts_with_status(&self, status: AlertStatus) -> u64 {
        self.alerts_by_status[status.index()].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn alerts_without_position(&self) -> u64 {
        self.alerts_without_position.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn alerts_in_flight(&self) -> u64 {
        self.alerts_in_flight.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn egress_dropped(&self) -> u64 {
        self.egress_dropped.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self, zones_occupied: usize, tracking_active: bool) -> MetricsSummary {
        let samples_count = self.samples_since_report.swap(0, Ordering::Relaxed);
        let resolve_buckets = swap_buckets(&self.resolve_buckets);
        let resolve_sum = self.resolve_sum_ms.swap(0, Ordering::Relaxed);
        let resolve_max_ms = self.resolve_max_ms.swap(0, Ordering::Relaxed);
        let resolve_count: u64 = resolve_buckets.iter().sum();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let samples_per_min = if elapsed.as_secs_f64() > 0.0 {
            samples_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            samples_total: self.samples_total.load(Ordering::Relaxed),
            samples_per_min,
            stale_samples_total: self.stale_samples_total.load(Ordering::Relaxed),
            position_errors_total: self.position_errors_total.load(Ordering::Relaxed),
            positions_dropped: self.positions_dropped.load(Ordering::Relaxed),
            zone_entries_total: self.zone_entries_total.load(Ordering::Relaxed),
            zone_exits_total: self.zone_exits_total.load(Ordering::Relaxed),
            danger_entries_total: self.danger_entries_total.load(Ordering::Relaxed),
            triggers_total: load_all(&self.triggers_total),
            triggers_suppressed: self.triggers_suppressed.load(Ordering::Relaxed),
            alerts_by_status: load_all(&self.alerts_by_status),
            alerts_without_position: self.alerts_without_position.load(Ordering::Relaxed),
            alerts_in_flight: self.alerts_in_flight.load(Ordering::Relaxed),
            egress_dropped: self.egress_dropped.load(Ordering::Relaxed),
            resolve_buckets,
            resolve_avg_ms: if resolve_count > 0 { resolve_sum / resolve_count } else { 0 },
            resolve_max_ms,
            resolve_p99_ms: percentile_from_buckets(&resolve_buckets, 0.99),
            zones_occupied,
            tracking_active,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for egress)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub samples_total: u64,
    pub samples_per_min: f64,
    pub stale_samples_total: u64,
    pub position_errors_total: u64,
    pub positions_dropped: u64,
    pub zone_entries_total: u64,
    pub zone_exits_total: u64,
    pub danger_entries_total: u64,
    /// Indexed by `TriggerKind::index`
    pub triggers_total: [u64; NUM_TRIGGER_KINDS],
    pub triggers_suppressed: u64,
    /// Indexed by `AlertStatus::index`
    pub alerts_by_status: [u64; NUM_STATUSES],
    pub alerts_without_position: u64,
    pub alerts_in_flight: u64,
    pub egress_dropped: u64,
    /// Position resolution latency histogram (ms)
    pub resolve_buckets: [u64; NUM_BUCKETS],
    pub resolve_avg_ms: u64,
    pub resolve_max_ms: u64,
    pub resolve_p99_ms: u64,
    /// Zones containing the last evaluated position
    pub zones_occupied: usize,
    pub tracking_active: bool,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            samples_total = %self.samples_total,
            samples_per_min = format!("{:.1}", self.samples_per_min),
            stale = %self.stale_samples_total,
            position_errors = %self.position_errors_total,
            danger_entries = %self.danger_entries_total,
            triggers_manual = %self.triggers_total[TriggerKind::Manual.index()],
            triggers_voice = %self.triggers_total[TriggerKind::Voice.index()],
            triggers_geofence = %self.triggers_total[TriggerKind::Geofence.index()],
            alerts_in_flight = %self.alerts_in_flight,
            alerts_acked = %self.alerts_by_status[AlertStatus::Acknowledged.index()],
            resolve_p99_ms = %self.resolve_p99_ms,
            zones_occupied = %self.zones_occupied,
            tracking = %self.tracking_active,
            "metrics"
        );
    }

    /// JSON payload for the MQTT metrics topic
    pub fn to_json(&self, device_id: &str) -> String {
        serde_json::json!({
            "device": device_id,
            "samples_total": self.samples_total,
            "stale_samples_total": self.stale_samples_total,
            "position_errors_total": self.position_errors_total,
            "danger_entries_total": self.danger_entries_total,
            "triggers": {
                "manual": self.triggers_total[TriggerKind::Manual.index()],
                "voice": self.triggers_total[TriggerKind::Voice.index()],
                "geofence": self.triggers_total[TriggerKind::Geofence.index()],
            },
            "alerts_in_flight": self.alerts_in_flight,
            "alerts_without_position": self.alerts_without_position,
            "resolve_avg_ms": self.resolve_avg_ms,
            "resolve_p99_ms": self.resolve_p99_ms,
            "zones_occupied": self.zones_occupied,
            "tracking_active": self.tracking_active,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.samples_total(), 0);
        assert_eq!(metrics.alerts_in_flight(), 0);
    }

    #[test]
    fn test_record_sample() {
        let metrics = Metrics::new();
        metrics.record_sample(false);
        metrics.record_sample(true);
        assert_eq!(metrics.samples_total(), 2);
        assert_eq!(metrics.stale_samples_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_triggers_by_kind() {
        let metrics = Metrics::new();
        metrics.record_trigger(TriggerKind::Voice);
        metrics.record_trigger(TriggerKind::Voice);
        metrics.record_trigger(TriggerKind::Geofence);
        assert_eq!(metrics.triggers_total(TriggerKind::Voice), 2);
        assert_eq!(metrics.triggers_total(TriggerKind::Geofence), 1);
        assert_eq!(metrics.triggers_total(TriggerKind::Manual), 0);
    }

    #[test]
    fn test_alerts_in_flight() {
        let metrics = Metrics::new();
        metrics.record_alert_status(AlertStatus::Pending);
        metrics.record_alert_status(AlertStatus::Pending);
        metrics.record_alert_status(AlertStatus::Sent);
        metrics.record_alert_status(AlertStatus::Acknowledged);
        assert_eq!(metrics.alerts_in_flight(), 1);
        assert_eq!(metrics.alerts_with_status(AlertStatus::Pending), 2);

        // Never underflows
        metrics.record_alert_status(AlertStatus::Acknowledged);
        metrics.record_alert_status(AlertStatus::Acknowledged);
        assert_eq!(metrics.alerts_in_flight(), 0);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(10), 0);
        assert_eq!(bucket_index(11), 1);
        assert_eq!(bucket_index(5000), 8);
        assert_eq!(bucket_index(5001), 9);
        assert_eq!(bucket_index(10001), 10);
    }

    #[test]
    fn test_report_resets_resolution_histogram() {
        let metrics = Metrics::new();
        metrics.record_position_resolution(20);
        metrics.record_position_resolution(40);
        metrics.record_position_resolution(5000);

        let summary = metrics.report(2, true);
        assert_eq!(summary.resolve_avg_ms, 1686);
        assert_eq!(summary.resolve_max_ms, 5000);
        assert_eq!(summary.resolve_buckets[1], 1);
        assert_eq!(summary.resolve_buckets[2], 1);
        assert_eq!(summary.resolve_buckets[8], 1);
        assert_eq!(summary.zones_occupied, 2);
        assert!(summary.tracking_active);

        let again = metrics.report(0, false);
        assert_eq!(again.resolve_avg_ms, 0);
        assert_eq!(again.resolve_buckets.iter().sum::<u64>(), 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    m.record_sample(false);
                    m.record_trigger(TriggerKind::Manual);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.samples_total(), 8_000);
        assert_eq!(metrics.triggers_total(TriggerKind::Manual), 8_000);
    }

    #[test]
    fn test_summary_json() {
        let metrics = Metrics::new();
        metrics.record_trigger(TriggerKind::Manual);
        let json = metrics.report(0, false).to_json("dev-1");
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["device"], "dev-1");
        assert_eq!(parsed["triggers"]["manual"], 1);
    }
}
