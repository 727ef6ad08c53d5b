use crate::alarm_state::AlarmState;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::util::error::lock;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type TransitionListener = Arc<dyn Fn(AlarmState) + Send + Sync>;

struct Pending {
    id: u64,
    state: AlarmState,
    timer: TimerHandle,
}

struct Slot {
    next_id: u64,
    pending: Option<Pending>,
}

/// Delivers a state to the listener after a delay.
///
/// Only one transition is ever pending. Scheduling again while one is
/// pending only replaces the state that will be delivered, the
/// original deadline is kept.
pub struct DelayedTransition {
    scheduler: Arc<dyn Scheduler>,
    listener: TransitionListener,
    slot: Arc<Mutex<Slot>>,
}

impl DelayedTransition {
    pub fn new(scheduler: Arc<dyn Scheduler>, listener: TransitionListener) -> DelayedTransition {
        DelayedTransition {
            scheduler,
            listener,
            slot: Arc::new(Mutex::new(Slot {
                next_id: 0,
                pending: None,
            })),
        }
    }

    pub fn schedule(&self, state: AlarmState, delay: Duration) {
        let mut slot = lock(&self.slot);
        if let Some(pending) = &mut slot.pending {
            pending.state = state;
            return;
        }
        let id = slot.next_id;
        slot.next_id += 1;
        let fire_slot = self.slot.clone();
        let listener = self.listener.clone();
        let timer = self.scheduler.schedule(
            delay,
            Box::new(move || {
                let state = {
                    let mut slot = lock(&fire_slot);
                    // A cancel followed by a new schedule leaves another id
                    if slot.pending.as_ref().map(|p| p.id) == Some(id) {
                        slot.pending.take().map(|p| p.state)
                    } else {
                        None
                    }
                };
                if let Some(state) = state {
                    listener(state);
                }
            }),
        );
        slot.pending = Some(Pending { id, state, timer });
    }

    /// State waiting to be delivered, if any
    pub fn pending_state(&self) -> Option<AlarmState> {
        lock(&self.slot).pending.as_ref().map(|p| p.state.clone())
    }

    pub fn cancel(&self) {
        let pending = lock(&self.slot).pending.take();
        if let Some(pending) = pending {
            pending.timer.cancel();
        }
    }
}

impl Drop for DelayedTransition {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
use test_log::test;

#[cfg(test)]
fn recorder() -> (TransitionListener, Arc<Mutex<Vec<AlarmState>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let r = received.clone();
    (
        Arc::new(move |state| r.lock().unwrap().push(state)),
        received,
    )
}

#[cfg(test)]
fn state(severity: crate::severity::SeverityLevel) -> AlarmState {
    AlarmState::new(severity, "test", "0", chrono::Utc::now())
}

#[test]
fn test_schedule_twice_delivers_latest() {
    use crate::scheduler::ManualScheduler;
    use crate::severity::SeverityLevel;
    let scheduler = ManualScheduler::new();
    let (listener, received) = recorder();
    let delayed = DelayedTransition::new(scheduler.clone(), listener);

    delayed.schedule(state(SeverityLevel::Minor), Duration::from_secs(5));
    scheduler.advance(Duration::from_secs(3));
    delayed.schedule(state(SeverityLevel::Major), Duration::from_secs(5));
    assert_eq!(scheduler.pending(), 1);

    // Deadline of the first request holds
    scheduler.advance(Duration::from_secs(2));
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].severity, SeverityLevel::Major);
    assert!(delayed.pending_state().is_none());
}

#[test]
fn test_cancel() {
    use crate::scheduler::ManualScheduler;
    use crate::severity::SeverityLevel;
    let scheduler = ManualScheduler::new();
    let (listener, received) = recorder();
    let delayed = DelayedTransition::new(scheduler.clone(), listener);

    delayed.schedule(state(SeverityLevel::Major), Duration::from_secs(5));
    assert_eq!(
        delayed.pending_state().map(|s| s.severity),
        Some(SeverityLevel::Major)
    );
    delayed.cancel();
    delayed.cancel();
    scheduler.advance(Duration::from_secs(10));
    assert!(received.lock().unwrap().is_empty());

    // Usable again after a cancel
    delayed.schedule(state(SeverityLevel::Minor), Duration::from_secs(1));
    scheduler.advance(Duration::from_secs(1));
    assert_eq!(received.lock().unwrap().len(), 1);
}
