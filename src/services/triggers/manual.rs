//! Manual press-and-hold adapter
//!
//! A hold that lasts the configured duration fires exactly one Trigger,
//! either from the hold timer or from a release that lands at or after the
//! deadline, whichever runs first. Release before the deadline cancels.
//! A press while a hold is already in progress is ignored.

use super::TriggerSender;
use crate::domain::alert::epoch_ms;
use crate::domain::types::{Trigger, TriggerKind};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Default)]
struct HoldState {
    pressed_at: Option<Instant>,
    fired: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl HoldState {
    /// Claim the trigger for the current hold; true at most once per hold
    fn claim(&mut self) -> bool {
        if self.pressed_at.is_none() || self.fired {
            return false;
        }
        self.fired = true;
        true
    }
}

pub struct ManualTrigger {
    hold: Duration,
    sender: TriggerSender,
    state: Arc<Mutex<HoldState>>,
}

impl ManualTrigger {
    pub fn new(hold: Duration, sender: TriggerSender) -> Self {
        Self { hold, sender, state: Arc::new(Mutex::new(HoldState::default())) }
    }

    pub fn hold_duration(&self) -> Duration {
        self.hold
    }

    pub fn is_holding(&self) -> bool {
        self.state.lock().pressed_at.is_some()
    }

    /// Fraction of the hold completed, 0.0 when idle
    pub fn progress(&self) -> f64 {
        match self.state.lock().pressed_at {
            Some(at) => (at.elapsed().as_secs_f64() / self.hold.as_secs_f64()).min(1.0),
            None => 0.0,
        }
    }

    /// Begin a hold. Returns false if a hold is already in progress.
    pub fn press(&self) -> bool {
        let mut state = self.state.lock();
        if state.pressed_at.is_some() {
            debug!("manual_press_ignored_overlapping");
            return false;
        }
        state.pressed_at = Some(Instant::now());
        state.fired = false;
        state.generation += 1;
        let generation = state.generation;

        let shared = Arc::clone(&self.state);
        let sender = self.sender.clone();
        let hold = self.hold;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            let claimed = {
                let mut s = shared.lock();
                s.generation == generation && s.claim()
            };
            if claimed {
                sender.send(Trigger::new(TriggerKind::Manual, None, epoch_ms()));
            }
        }));
        debug!(hold_ms = %self.hold.as_millis(), "manual_press");
        true
    }

    /// End the hold. Returns true if this hold produced a Trigger.
    pub fn release(&self) -> bool {
        let (fire, fired_before) = {
            let mut state = self.state.lock();
            let Some(pressed_at) = state.pressed_at else {
                return false;
            };
            let fire = pressed_at.elapsed() >= self.hold && state.claim();
            let fired_before = state.fired && !fire;
            state.pressed_at = None;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            (fire, fired_before)
        };

        if fire {
            self.sender.send(Trigger::new(TriggerKind::Manual, None, epoch_ms()));
        } else if !fired_before {
            debug!("manual_hold_cancelled");
        }
        fire || fired_before
    }
}

impl Drop for ManualTrigger {
    fn drop(&mut self) {
        if let Some(timer) = self.state.lock().timer.take() {
            timer.abort();
        }
    }
}
