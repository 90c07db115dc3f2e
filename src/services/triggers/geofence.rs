//! Geofence adapter - danger-zone entries become Triggers

use super::TriggerSender;
use crate::domain::types::{Trigger, TriggerKind};
use crate::services::geofence::DangerZoneEntry;
use tokio::sync::{mpsc, watch};
use tracing::info;

pub struct GeofenceTrigger {
    sender: TriggerSender,
}

impl GeofenceTrigger {
    pub fn new(sender: TriggerSender) -> Self {
        Self { sender }
    }

    /// Map one entry edge to a Trigger carrying the zone name
    pub fn to_trigger(entry: &DangerZoneEntry) -> Trigger {
        Trigger::new(TriggerKind::Geofence, Some(entry.zone.name.clone()), entry.position.timestamp_ms)
    }

    pub async fn run(self, mut entries: mpsc::Receiver<DangerZoneEntry>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("geofence_trigger_shutdown");
                        break;
                    }
                }
                maybe = entries.recv() => {
                    let Some(entry) = maybe else { break };
                    info!(zone_id = %entry.zone.id, zone = %entry.zone.name, "danger_zone_entered");
                    if !self.sender.send(Self::to_trigger(&entry)) {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{LatLng, Position, Zone, ZoneKind};
    use crate::infra::Metrics;
    use crate::services::triggers::create_trigger_channel;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_entry_becomes_trigger() {
        let (sender, mut rx) = create_trigger_channel(Arc::new(Metrics::new()));
        let (entry_tx, entry_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(GeofenceTrigger::new(sender).run(entry_rx, shutdown_rx));

        let zone = Zone::new("z1", "Dark Alley", LatLng::new(10.0, 10.0), 500.0, ZoneKind::Danger);
        entry_tx
            .send(DangerZoneEntry { zone, position: Position::new(10.0, 10.0, 1234) })
            .await
            .unwrap();
        drop(entry_tx);
        task.await.unwrap();

        let t = rx.recv().await.unwrap();
        assert_eq!(t.kind, TriggerKind::Geofence);
        assert_eq!(t.detail.as_deref(), Some("Dark Alley"));
        assert_eq!(t.occurred_at, 1234);
    }
}
