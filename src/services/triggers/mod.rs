//! Trigger detector - input adapters converging on one Trigger channel
//!
//! - `manual` - press-and-hold button
//! - `voice` - phrase spotting over a live transcript stream
//! - `geofence` - danger-zone entry edges
//!
//! Each adapter holds a clone of `TriggerSender`. The channel is FIFO per
//! sender; no ordering holds across adapters.

pub mod geofence;
pub mod manual;
pub mod voice;

use crate::domain::types::Trigger;
use crate::infra::Metrics;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use geofence::GeofenceTrigger;
pub use manual::ManualTrigger;
pub use voice::{PhraseSpotter, VoiceStatus, VoiceTrigger};

/// Shared producer handle for the Trigger channel
///
/// Unbounded: triggers are rare and must never be dropped for backpressure.
#[derive(Clone)]
pub struct TriggerSender {
    tx: mpsc::UnboundedSender<Trigger>,
    metrics: Arc<Metrics>,
}

impl TriggerSender {
    pub fn new(tx: mpsc::UnboundedSender<Trigger>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }

    /// Publish a trigger; false only if the lifecycle engine has shut down
    pub fn send(&self, trigger: Trigger) -> bool {
        let kind = trigger.kind;
        info!(kind = %kind, detail = ?trigger.detail, "trigger_fired");
        self.metrics.record_trigger(kind);
        match self.tx.send(trigger) {
            Ok(()) => true,
            Err(_) => {
                warn!(kind = %kind, "trigger_channel_closed");
                false
            }
        }
    }
}

/// Create the shared Trigger channel
pub fn create_trigger_channel(metrics: Arc<Metrics>) -> (TriggerSender, mpsc::UnboundedReceiver<Trigger>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TriggerSender::new(tx, metrics), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TriggerKind;

    #[tokio::test]
    async fn test_fifo_per_sender() {
        let metrics = Arc::new(Metrics::new());
        let (sender, mut rx) = create_trigger_channel(metrics.clone());
        for i in 0..5u64 {
            assert!(sender.send(Trigger::new(TriggerKind::Manual, None, i)));
        }
        for i in 0..5u64 {
            assert_eq!(rx.recv().await.unwrap().occurred_at, i);
        }
        assert_eq!(metrics.triggers_total(TriggerKind::Manual), 5);
    }

    #[test]
    fn test_send_after_close() {
        let (sender, rx) = create_trigger_channel(Arc::new(Metrics::new()));
        drop(rx);
        assert!(!sender.send(Trigger::new(TriggerKind::Voice, Some("help".into()), 0)));
    }
}
