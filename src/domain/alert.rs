//! Alert data model and lifecycle status

use crate::domain::types::{Contact, Position, Trigger};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Newtype wrapper for alert IDs (UUIDv7, globally unique)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AlertId(pub String);

impl AlertId {
    pub fn generate() -> Self {
        AlertId(new_uuid_v7())
    }
}

impl std::fmt::Display for AlertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Alert lifecycle status, in transition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Pending,
    Sent,
    Delivered,
    Acknowledged,
}

impl AlertStatus {
    pub const ALL: [AlertStatus; 4] =
        [AlertStatus::Pending, AlertStatus::Sent, AlertStatus::Delivered, AlertStatus::Acknowledged];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Sent => "sent",
            AlertStatus::Delivered => "delivered",
            AlertStatus::Acknowledged => "acknowledged",
        }
    }

    /// The only status reachable from this one, if any
    pub fn next(&self) -> Option<AlertStatus> {
        match self {
            AlertStatus::Pending => Some(AlertStatus::Sent),
            AlertStatus::Sent => Some(AlertStatus::Delivered),
            AlertStatus::Delivered => Some(AlertStatus::Acknowledged),
            AlertStatus::Acknowledged => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        *self == AlertStatus::Acknowledged
    }

    #[inline]
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One alert, created in response to exactly one trigger
///
/// Only the lifecycle engine mutates an `Alert`; everyone else sees clones
/// delivered through the notification hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: AlertId,
    /// Epoch ms
    pub created_at: u64,
    pub trigger: Trigger,
    pub position: Option<Position>,
    pub status: AlertStatus,
    pub contacts: Vec<Contact>,
    #[serde(skip)]
    position_resolved: bool,
}

impl Alert {
    /// Create a new alert in `Pending` state.
    ///
    /// # Example
    ///
    /// ```
    /// use sentinel_engine::domain::alert::{Alert, AlertStatus};
    /// use sentinel_engine::domain::types::{Trigger, TriggerKind};
    ///
    /// let alert = Alert::new(Trigger::new(TriggerKind::Manual, None, 0), Vec::new());
    /// assert_eq!(alert.status, AlertStatus::Pending);
    /// assert!(alert.position.is_none());
    /// ```
    pub fn new(trigger: Trigger, contacts: Vec<Contact>) -> Self {
        Self {
            id: AlertId::generate(),
            created_at: epoch_ms(),
            trigger,
            position: None,
            status: AlertStatus::Pending,
            contacts,
            position_resolved: false,
        }
    }

    /// Record the resolved position snapshot
    ///
    /// Only the first call has any effect; `None` counts as a resolution.
    /// Returns false if the position had already been resolved.
    pub fn resolve_position(&mut self, position: Option<Position>) -> bool {
        if self.position_resolved {
            return false;
        }
        self.position = position;
        self.position_resolved = true;
        true
    }

    #[inline]
    pub fn position_resolved(&self) -> bool {
        self.position_resolved
    }

    /// Move to the next status in lifecycle order
    ///
    /// Returns the new status, or None if the alert is already terminal.
    pub fn advance(&mut self) -> Option<AlertStatus> {
        let next = self.status.next()?;
        self.status = next;
        Some(next)
    }

    /// Serialize to a single-line JSON object (JSONL)
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Serialize with device identifier included
    pub fn to_json_with_device(&self, device_id: &str) -> String {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut obj)) => {
                obj.insert("device".to_string(), serde_json::Value::String(device_id.to_string()));
                serde_json::Value::Object(obj).to_string()
            }
            _ => self.to_json(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TriggerKind;

    fn manual_alert() -> Alert {
        Alert::new(Trigger::new(TriggerKind::Manual, None, epoch_ms()), Vec::new())
    }

    #[test]
    fn test_status_order() {
        assert!(AlertStatus::Pending < AlertStatus::Sent);
        assert!(AlertStatus::Sent < AlertStatus::Delivered);
        assert!(AlertStatus::Delivered < AlertStatus::Acknowledged);
        assert_eq!(AlertStatus::Acknowledged.next(), None);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut alert = manual_alert();
        assert_eq!(alert.advance(), Some(AlertStatus::Sent));
        assert_eq!(alert.advance(), Some(AlertStatus::Delivered));
        assert_eq!(alert.advance(), Some(AlertStatus::Acknowledged));
        assert_eq!(alert.advance(), None);
        assert_eq!(alert.status, AlertStatus::Acknowledged);
    }

    #[test]
    fn test_position_set_once() {
        let mut alert = manual_alert();
        assert!(alert.resolve_position(None));
        assert!(!alert.resolve_position(Some(Position::new(1.0, 1.0, 1))));
        assert!(alert.position.is_none());
        assert!(alert.position_resolved());
    }

    #[test]
    fn test_ids_unique() {
        let a = manual_alert();
        let b = manual_alert();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_to_json_with_device() {
        let alert = manual_alert();
        let parsed: serde_json::Value =
            serde_json::from_str(&alert.to_json_with_device("phone-1")).unwrap();
        assert_eq!(parsed["device"], "phone-1");
        assert_eq!(parsed["status"], "pending");
        assert_eq!(parsed["trigger"]["kind"], "manual");
        assert_eq!(parsed["id"], alert.id.0);
    }
}
