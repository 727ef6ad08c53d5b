use crate::scheduler::{Scheduler, TimerHandle, TimerTask};
use chrono::{DateTime, Utc};
use log::debug;
use std::time::Duration;

/// Re-enables a point at a given time
#[derive(Debug)]
pub struct ScheduledEnable {
    timer: TimerHandle,
}

impl ScheduledEnable {
    /// Run `on_enable` at `date`, right away if that has passed
    pub fn start(scheduler: &dyn Scheduler, date: DateTime<Utc>, on_enable: TimerTask) -> ScheduledEnable {
        let delay = (date - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!("Enabling at {} (in {:?})", date, delay);
        ScheduledEnable {
            timer: scheduler.schedule(delay, on_enable),
        }
    }

    pub fn cancel(&self) {
        self.timer.cancel();
    }
}

#[cfg(test)]
use test_log::test;

#[test]
fn test_scheduled_enable() {
    use crate::scheduler::ManualScheduler;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let scheduler = ManualScheduler::new();
    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    let date = Utc::now() + chrono::Duration::seconds(60);
    let _enable = ScheduledEnable::start(
        scheduler.as_ref(),
        date,
        Box::new(move || f.store(true, Ordering::SeqCst)),
    );
    scheduler.advance(Duration::from_secs(30));
    assert!(!fired.load(Ordering::SeqCst));
    scheduler.advance(Duration::from_secs(31));
    assert!(fired.load(Ordering::SeqCst));

    let cancelled = Arc::new(AtomicBool::new(false));
    let c = cancelled.clone();
    let enable = ScheduledEnable::start(
        scheduler.as_ref(),
        Utc::now() - chrono::Duration::seconds(5),
        Box::new(move || c.store(true, Ordering::SeqCst)),
    );
    enable.cancel();
    scheduler.run_due();
    assert!(!cancelled.load(Ordering::SeqCst));
}
