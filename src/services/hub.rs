//! Notification hub - fan-out of alert snapshots to observers
//!
//! Explicitly constructed and shared by handle. `publish` iterates a
//! snapshot of the registry taken under the read lock, so concurrent
//! subscribe/unsubscribe never tears an iteration. Each entry carries an
//! `active` flag checked right before its callback, so an observer that
//! unsubscribes mid-publish is not called afterwards. An observer that
//! panics is dropped from the registry and the remaining observers still
//! receive the snapshot.

use crate::domain::alert::Alert;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Receives every alert transition published after it subscribed
pub trait AlertObserver: Send + Sync {
    fn on_alert(&self, alert: &Alert);
}

impl<F> AlertObserver for F
where
    F: Fn(&Alert) + Send + Sync,
{
    fn on_alert(&self, alert: &Alert) {
        self(alert)
    }
}

struct Entry {
    observer: Arc<dyn AlertObserver>,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    entries: RwLock<FxHashMap<u64, Entry>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Handle returned by `subscribe`; `unsubscribe` is idempotent
///
/// Dropping the handle does not unsubscribe.
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.entries.write().remove(&self.id);
            debug!(observer = %self.id, "hub_unsubscribed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[derive(Clone, Default)]
pub struct NotificationHub {
    registry: Arc<Registry>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<O: AlertObserver + 'static>(&self, observer: O) -> Subscription {
        self.subscribe_arc(Arc::new(observer))
    }

    pub fn subscribe_arc(&self, observer: Arc<dyn AlertObserver>) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(!self.registry.closed.load(Ordering::Acquire)));
        if active.load(Ordering::Acquire) {
            self.registry
                .entries
                .write()
                .insert(id, Entry { observer, active: Arc::clone(&active) });
            debug!(observer = %id, "hub_subscribed");
        } else {
            warn!("hub_subscribe_after_close");
        }
        Subscription { id, active, registry: Arc::downgrade(&self.registry) }
    }

    /// Channel-backed subscription for async consumers
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscribe(move |alert: &Alert| {
            let _ = tx.send(alert.clone());
        });
        (sub, rx)
    }

    /// Deliver a snapshot to every observer registered now
    pub fn publish(&self, alert: &Alert) {
        if self.registry.closed.load(Ordering::Acquire) {
            return;
        }
        let snapshot: Vec<(u64, Arc<dyn AlertObserver>, Arc<AtomicBool>)> = self
            .registry
            .entries
            .read()
            .iter()
            .map(|(id, e)| (*id, Arc::clone(&e.observer), Arc::clone(&e.active)))
            .collect();

        debug!(alert_id = %alert.id, status = %alert.status, observers = %snapshot.len(), "hub_publish");
        for (id, observer, active) in snapshot {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| observer.on_alert(alert))).is_err() {
                self.evict(id, &active);
                warn!(observer = %id, alert_id = %alert.id, status = %alert.status, "hub_observer_panicked");
            }
        }
    }

    fn evict(&self, id: u64, active: &AtomicBool) {
        active.store(false, Ordering::Release);
        self.registry.entries.write().remove(&id);
    }

    pub fn observer_count(&self) -> usize {
        self.registry.entries.read().len()
    }

    /// Tear down: drop every observer and ignore further publishes
    pub fn close(&self) {
        if self.registry.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Entry> = self.registry.entries.write().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.active.store(false, Ordering::Release);
        }
        info!(observers = %drained.len(), "hub_closed");
    }

    pub fn is_closed(&self) -> bool {
        self.registry.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alert::AlertStatus;
    use crate::domain::types::{Trigger, TriggerKind};
    use parking_lot::Mutex;

    fn alert() -> Alert {
        Alert::new(Trigger::new(TriggerKind::Manual, None, 0), Vec::new())
    }

    fn recorder() -> (Arc<Mutex<Vec<AlertStatus>>>, impl Fn(&Alert) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        (seen, move |a: &Alert| s.lock().push(a.status))
    }

    #[test]
    fn test_publish_reaches_all_observers() {
        let hub = NotificationHub::new();
        let (a_seen, a) = recorder();
        let (b_seen, b) = recorder();
        let _sa = hub.subscribe(a);
        let _sb = hub.subscribe(b);

        hub.publish(&alert());
        assert_eq!(a_seen.lock().len(), 1);
        assert_eq!(b_seen.lock().len(), 1);
    }

    #[test]
    fn test_no_retroactive_delivery() {
        let hub = NotificationHub::new();
        let mut al = alert();
        hub.publish(&al);

        let (seen, obs) = recorder();
        let _s = hub.subscribe(obs);
        al.advance();
        hub.publish(&al);
        assert_eq!(*seen.lock(), vec![AlertStatus::Sent]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_isolated() {
        let hub = NotificationHub::new();
        let (a_seen, a) = recorder();
        let (b_seen, b) = recorder();
        let sa = hub.subscribe(a);
        let _sb = hub.subscribe(b);

        hub.publish(&alert());
        sa.unsubscribe();
        sa.unsubscribe();
        assert!(!sa.is_active());
        assert_eq!(hub.observer_count(), 1);

        hub.publish(&alert());
        assert_eq!(a_seen.lock().len(), 1);
        assert_eq!(b_seen.lock().len(), 2);
    }

    #[test]
    fn test_unsubscribe_during_publish() {
        let hub = NotificationHub::new();
        let second_calls = Arc::new(AtomicU64::new(0));
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        // Whichever observer runs first unsubscribes the other
        let v = victim.clone();
        let _killer = hub.subscribe(move |_: &Alert| {
            if let Some(sub) = v.lock().take() {
                sub.unsubscribe();
            }
        });
        let calls = second_calls.clone();
        let target = hub.subscribe(move |_: &Alert| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        *victim.lock() = Some(target);

        hub.publish(&alert());
        hub.publish(&alert());
        assert!(second_calls.load(Ordering::SeqCst) <= 1);
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let hub = NotificationHub::new();
        let (before_seen, before) = recorder();
        let _sb = hub.subscribe(before);
        let faulty = hub.subscribe(|_: &Alert| panic!("observer failure"));
        let (after_seen, after) = recorder();
        let _sa = hub.subscribe(after);

        hub.publish(&alert());
        assert_eq!(before_seen.lock().len(), 1);
        assert_eq!(after_seen.lock().len(), 1);
        assert!(!faulty.is_active());
        assert_eq!(hub.observer_count(), 2);

        hub.publish(&alert());
        assert_eq!(before_seen.lock().len(), 2);
        assert_eq!(after_seen.lock().len(), 2);
        faulty.unsubscribe();
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let hub = NotificationHub::new();
        let (_sub, mut rx) = hub.subscribe_channel();
        let al = alert();
        hub.publish(&al);
        assert_eq!(rx.recv().await.unwrap().id, al.id);
    }

    #[test]
    fn test_close_stops_delivery() {
        let hub = NotificationHub::new();
        let (seen, obs) = recorder();
        let sub = hub.subscribe(obs);
        hub.close();
        hub.publish(&alert());
        assert!(seen.lock().is_empty());
        assert!(!sub.is_active());
        sub.unsubscribe();

        let (late_seen, late) = recorder();
        let late_sub = hub.subscribe(late);
        assert!(!late_sub.is_active());
        hub.publish(&alert());
        assert!(late_seen.lock().is_empty());
    }
}
