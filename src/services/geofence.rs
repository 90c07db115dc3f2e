//! Geofence evaluator - zone containment and transition edges
//!
//! `evaluate` is a pure containment test. `GeofenceEvaluator` keeps the
//! previous membership and turns consecutive evaluations into entry and
//! exit edges, so a position that stays inside a zone produces one entry
//! event, not one per sample.

use crate::domain::geo::haversine_m;
use crate::domain::types::{Position, Zone, ZoneId};
use crate::error::{EngineError, EngineResult};
use crate::infra::Metrics;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Zones containing a position, in configuration order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ZoneMembership {
    pub zones: Vec<Zone>,
    /// Timestamp of the position this membership was computed from
    pub at_ms: u64,
}

impl ZoneMembership {
    pub fn contains(&self, id: &ZoneId) -> bool {
        self.zones.iter().any(|z| &z.id == id)
    }

    pub fn ids(&self) -> FxHashSet<ZoneId> {
        self.zones.iter().map(|z| z.id.clone()).collect()
    }

    pub fn in_danger(&self) -> bool {
        self.zones.iter().any(Zone::is_danger)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

/// Containment test: great-circle distance to center within radius
#[inline]
pub fn contains(zone: &Zone, position: &Position) -> bool {
    haversine_m(position.lat_lng(), zone.center) <= zone.radius_m
}

/// Pure membership computation
pub fn evaluate(position: &Position, zones: &[Zone]) -> ZoneMembership {
    ZoneMembership {
        zones: zones.iter().filter(|z| contains(z, position)).cloned().collect(),
        at_ms: position.timestamp_ms,
    }
}

/// Zone edge produced by one evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneEvent {
    Entered { zone: Zone, position: Position },
    Exited { zone: Zone, position: Position },
}

impl ZoneEvent {
    pub fn zone(&self) -> &Zone {
        match self {
            ZoneEvent::Entered { zone, .. } | ZoneEvent::Exited { zone, .. } => zone,
        }
    }

    pub fn is_danger_entry(&self) -> bool {
        matches!(self, ZoneEvent::Entered { zone, .. } if zone.is_danger())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneEvent::Entered { .. } => "zone_entry",
            ZoneEvent::Exited { .. } => "zone_exit",
        }
    }
}

/// Derived event consumed by the geofence trigger adapter
#[derive(Debug, Clone, PartialEq)]
pub struct DangerZoneEntry {
    pub zone: Zone,
    pub position: Position,
}

struct EvalState {
    zones: Vec<Zone>,
    previous: FxHashSet<ZoneId>,
    last_ts: Option<u64>,
}

/// Stateful edge detector over a zone set
///
/// Compute-and-update runs under one lock so overlapping `observe` calls
/// are serialized; a position older than the last evaluated one is ignored.
pub struct GeofenceEvaluator {
    state: Mutex<EvalState>,
    membership_tx: watch::Sender<ZoneMembership>,
    metrics: Arc<Metrics>,
}

impl GeofenceEvaluator {
    pub fn new(zones: Vec<Zone>, metrics: Arc<Metrics>) -> EngineResult<Self> {
        validate_zones(&zones)?;
        let (membership_tx, _) = watch::channel(ZoneMembership::default());
        Ok(Self {
            state: Mutex::new(EvalState { zones, previous: FxHashSet::default(), last_ts: None }),
            membership_tx,
            metrics,
        })
    }

    pub fn zones(&self) -> Vec<Zone> {
        self.state.lock().zones.clone()
    }

    /// Replace the zone set
    ///
    /// Previous membership is pruned to zones that still exist, so a zone
    /// kept across the update does not re-fire its entry.
    pub fn set_zones(&self, zones: Vec<Zone>) -> EngineResult<()> {
        validate_zones(&zones)?;
        let mut state = self.state.lock();
        let keep: FxHashSet<ZoneId> = zones.iter().map(|z| z.id.clone()).collect();
        state.previous.retain(|id| keep.contains(id));
        info!(zones = %zones.len(), "geofence_zones_updated");
        state.zones = zones;
        Ok(())
    }

    pub fn membership(&self) -> ZoneMembership {
        self.membership_tx.borrow().clone()
    }

    pub fn subscribe_membership(&self) -> watch::Receiver<ZoneMembership> {
        self.membership_tx.subscribe()
    }

    /// Evaluate one position and return the transition edges
    pub fn observe(&self, position: &Position) -> SmallVec<[ZoneEvent; 2]> {
        let mut events = SmallVec::new();
        let mut state = self.state.lock();

        if let Some(last) = state.last_ts {
            if position.timestamp_ms < last {
                debug!(ts = %position.timestamp_ms, last_ts = %last, "geofence_out_of_order_ignored");
                return events;
            }
        }

        let membership = evaluate(position, &state.zones);
        let current = membership.ids();

        for zone in &membership.zones {
            if !state.previous.contains(&zone.id) {
                self.metrics.record_zone_entry(zone.is_danger());
                info!(
                    zone_id = %zone.id,
                    zone = %zone.name,
                    kind = zone.kind.as_str(),
                    lat = %position.latitude,
                    lon = %position.longitude,
                    "zone_entered"
                );
                events.push(ZoneEvent::Entered { zone: zone.clone(), position: position.clone() });
            }
        }
        for zone in &state.zones {
            if state.previous.contains(&zone.id) && !current.contains(&zone.id) {
                self.metrics.record_zone_exit();
                info!(zone_id = %zone.id, zone = %zone.name, "zone_exited");
                events.push(ZoneEvent::Exited { zone: zone.clone(), position: position.clone() });
            }
        }

        state.previous = current;
        state.last_ts = Some(position.timestamp_ms);
        self.membership_tx.send_replace(membership);
        events
    }

    /// Single-writer loop: evaluate every position from the sampler
    ///
    /// Danger-zone entries go to `danger_tx`; every edge goes to `events_tx`
    /// when one is attached.
    pub async fn run(
        self: Arc<Self>,
        mut positions: mpsc::Receiver<Position>,
        danger_tx: mpsc::Sender<DangerZoneEntry>,
        events_tx: Option<mpsc::UnboundedSender<ZoneEvent>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(zones = %self.state.lock().zones.len(), "geofence_evaluator_started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("geofence_evaluator_shutdown");
                        break;
                    }
                }
                maybe = positions.recv() => {
                    let Some(position) = maybe else {
                        info!("geofence_position_stream_closed");
                        break;
                    };
                    for event in self.observe(&position) {
                        if let ZoneEvent::Entered { ref zone, ref position } = event {
                            if zone.is_danger() {
                                let entry = DangerZoneEntry { zone: zone.clone(), position: position.clone() };
                                if danger_tx.send(entry).await.is_err() {
                                    warn!(zone_id = %zone.id, "danger_entry_receiver_closed");
                                }
                            }
                        }
                        if let Some(ref tx) = events_tx {
                            let _ = tx.send(event);
                        }
                    }
                }
            }
        }
    }
}

/// Each zone valid and ids unique
pub fn validate_zones(zones: &[Zone]) -> EngineResult<()> {
    let mut seen = FxHashSet::default();
    for zone in zones {
        zone.validate()?;
        if !seen.insert(&zone.id) {
            return Err(EngineError::invalid_config(format!("duplicate zone id {}", zone.id)));
        }
    }
    Ok(())
}
