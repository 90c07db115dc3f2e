//! Contact dispatch - the collaborator that hands alerts to contacts
//!
//! Actual SMS/telephony delivery lives outside the engine. A dispatcher
//! receives each alert once it is `sent` and may report delivery and
//! acknowledgment back through its `DeliveryReporter`.

use crate::domain::alert::{Alert, AlertId};
use crate::domain::geo::{format_location, share_link};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Asynchronous outcome reported back into the lifecycle engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryReport {
    Delivered,
    Acknowledged,
}

impl DeliveryReport {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delivered" => Some(DeliveryReport::Delivered),
            "acknowledged" | "ack" => Some(DeliveryReport::Acknowledged),
            _ => None,
        }
    }
}

/// Back-channel for one alert
#[derive(Debug, Clone)]
pub struct DeliveryReporter {
    alert_id: AlertId,
    tx: mpsc::UnboundedSender<DeliveryReport>,
}

impl DeliveryReporter {
    pub fn new(alert_id: AlertId, tx: mpsc::UnboundedSender<DeliveryReport>) -> Self {
        Self { alert_id, tx }
    }

    pub fn alert_id(&self) -> &AlertId {
        &self.alert_id
    }

    /// False once the alert's lifecycle has finished
    pub fn report(&self, report: DeliveryReport) -> bool {
        self.tx.send(report).is_ok()
    }

    pub fn delivered(&self) -> bool {
        self.report(DeliveryReport::Delivered)
    }

    pub fn acknowledged(&self) -> bool {
        self.report(DeliveryReport::Acknowledged)
    }
}

#[async_trait]
pub trait ContactDispatcher: Send + Sync {
    async fn dispatch(&self, alert: &Alert, reporter: DeliveryReporter);
}

/// Message body sent to each contact
pub fn compose_message(alert: &Alert) -> String {
    let reason = match alert.trigger.detail {
        Some(ref detail) => format!("{} ({})", alert.trigger.kind, detail),
        None => alert.trigger.kind.to_string(),
    };
    match alert.position {
        Some(ref p) => format!(
            "EMERGENCY ALERT: help needed, triggered by {}. Location: {} {}",
            reason,
            format_location(p),
            share_link(p)
        ),
        None => format!("EMERGENCY ALERT: help needed, triggered by {}. Location unavailable.", reason),
    }
}

/// Dispatcher that only logs; delivery is left to the simulated timers
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl ContactDispatcher for LogDispatcher {
    async fn dispatch(&self, alert: &Alert, _reporter: DeliveryReporter) {
        if alert.contacts.is_empty() {
            warn!(alert_id = %alert.id, "dispatch_no_contacts");
        }
        let message = compose_message(alert);
        for contact in &alert.contacts {
            info!(
                alert_id = %alert.id,
                contact = %contact.name,
                phone = %contact.phone,
                message = %message,
                "dispatch_contact"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Position, Trigger, TriggerKind};

    #[test]
    fn test_compose_with_and_without_position() {
        let mut alert =
            Alert::new(Trigger::new(TriggerKind::Voice, Some("help".into()), 0), Vec::new());
        let no_pos = compose_message(&alert);
        assert!(no_pos.contains("voice (help)"));
        assert!(no_pos.contains("Location unavailable"));

        alert.resolve_position(Some(Position::new(10.5, -3.25, 0)));
        let with_pos = compose_message(&alert);
        assert!(with_pos.contains("10.500000, -3.250000"));
        assert!(with_pos.contains("query=10.5,-3.25"));
    }

    #[test]
    fn test_reporter_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = DeliveryReporter::new(AlertId("a".into()), tx);
        assert!(reporter.delivered());
        drop(rx);
        assert!(!reporter.acknowledged());
    }

    #[test]
    fn test_parse_report() {
        assert_eq!(DeliveryReport::parse("ACK"), Some(DeliveryReport::Acknowledged));
        assert_eq!(DeliveryReport::parse("delivered"), Some(DeliveryReport::Delivered));
        assert_eq!(DeliveryReport::parse("sent"), None);
    }
}
