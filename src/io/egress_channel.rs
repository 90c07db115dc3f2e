//! Typed channel for MQTT egress messages
//!
//! Provides a non-blocking way to send events to the MQTT publisher.
//! Uses bounded mpsc channels to prevent unbounded memory growth.

use crate::domain::alert::{epoch_ms, Alert};
use crate::infra::metrics::{Metrics, MetricsSummary};
use crate::services::geofence::ZoneEvent;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Alert snapshot on every status change
    Alert(AlertPayload),
    /// Zone entry or exit
    ZoneEvent(ZoneEventPayload),
    /// Periodic metrics snapshot
    Metrics(MetricsPayload),
}

#[derive(Debug, Serialize)]
pub struct AlertPayload {
    pub json: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneEventPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// zone_entry or zone_exit
    pub t: String,
    pub zone: String,
    pub kind: String,
    pub lat: f64,
    pub lng: f64,
    /// Position timestamp (epoch ms)
    pub ts: u64,
}

impl ZoneEventPayload {
    pub fn from_event(event: &ZoneEvent) -> Self {
        let (zone, position) = match event {
            ZoneEvent::Entered { zone, position } | ZoneEvent::Exited { zone, position } => {
                (zone, position)
            }
        };
        Self {
            device: None,
            t: event.as_str().to_string(),
            zone: zone.id.0.clone(),
            kind: zone.kind.as_str().to_string(),
            lat: position.latitude,
            lng: position.longitude,
            ts: position.timestamp_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsPayload {
    pub ts: u64,
    pub json: String,
}

/// Sender handle for egress messages
///
/// Clone to share across producers. Messages are dropped when the channel
/// is full.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    device_id: String,
    metrics: Arc<Metrics>,
}

impl EgressSender {
    pub fn new(tx: mpsc::Sender<EgressMessage>, device_id: String, metrics: Arc<Metrics>) -> Self {
        Self { tx, device_id, metrics }
    }

    fn offer(&self, msg: EgressMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                self.metrics.record_egress_dropped();
                debug!(error = %e, "egress_dropped");
                false
            }
        }
    }

    /// Includes device_id in the JSON payload
    pub fn send_alert(&self, alert: &Alert) -> bool {
        let json = alert.to_json_with_device(&self.device_id);
        self.offer(EgressMessage::Alert(AlertPayload { json }))
    }

    pub fn send_zone_event(&self, event: &ZoneEvent) -> bool {
        let mut payload = ZoneEventPayload::from_event(event);
        payload.device = Some(self.device_id.clone());
        self.offer(EgressMessage::ZoneEvent(payload))
    }

    pub fn send_metrics(&self, summary: &MetricsSummary) -> bool {
        let payload = MetricsPayload { ts: epoch_ms(), json: summary.to_json(&self.device_id) };
        self.offer(EgressMessage::Metrics(payload))
    }
}

/// Create a new egress channel pair
pub fn create_egress_channel(
    buffer_size: usize,
    device_id: String,
    metrics: Arc<Metrics>,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, device_id, metrics), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{LatLng, Position, Trigger, TriggerKind, Zone, ZoneKind};

    #[test]
    fn test_zone_payload_fields() {
        let zone = Zone::new("riverside", "Riverside", LatLng::new(1.0, 2.0), 100.0, ZoneKind::Danger);
        let event = ZoneEvent::Entered { zone, position: Position::new(1.0, 2.0, 1234) };
        let payload = ZoneEventPayload::from_event(&event);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["t"], "zone_entry");
        assert_eq!(json["zone"], "riverside");
        assert_eq!(json["kind"], "danger");
        assert_eq!(json["ts"], 1234);
        assert!(json.get("device").is_none());
    }

    #[test]
    fn test_full_channel_counts_drop() {
        let metrics = Arc::new(Metrics::new());
        let (sender, mut rx) = create_egress_channel(1, "phone-1".into(), metrics.clone());
        let alert = Alert::new(Trigger::new(TriggerKind::Manual, None, 0), Vec::new());

        assert!(sender.send_alert(&alert));
        assert!(!sender.send_alert(&alert));
        assert_eq!(metrics.egress_dropped(), 1);

        match rx.try_recv().unwrap() {
            EgressMessage::Alert(p) => assert!(p.json.contains("\"device\":\"phone-1\"")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
