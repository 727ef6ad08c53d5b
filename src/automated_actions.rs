//! Actions that run when an item stays in alarm for a while.

use crate::alarm_logic::AlarmContext;
use crate::alarm_state::TitleDetailDelay;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::severity::SeverityLevel;
use crate::util::error::lock;
use log::{debug, info};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Prefix of action details naming a PV that receives the severity
pub const SEVERITY_PV_PREFIX: &str = "sevrpv:";

pub trait ActionPerformer: Send + Sync {
    fn perform(&self, path: &str, action: &TitleDetailDelay);
}

/// Performer that only logs what it would do
pub struct LogActionPerformer;

impl ActionPerformer for LogActionPerformer {
    fn perform(&self, path: &str, action: &TitleDetailDelay) {
        info!(
            "Automated action '{}' for {}: {}",
            action.title, path, action.details
        );
    }
}

/// Names of the severity PVs among the actions
pub fn severity_pvs(actions: &[TitleDetailDelay]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|a| a.details.strip_prefix(SEVERITY_PV_PREFIX))
        .map(|pv| pv.trim().to_string())
        .filter(|pv| !pv.is_empty())
        .collect()
}

struct ActionsMut {
    actions: Vec<TitleDetailDelay>,
    pending: Vec<Option<TimerHandle>>,
    last_severity: SeverityLevel,
    // Bumped on every reconfiguration so stale timers do nothing
    generation: u64,
}

impl ActionsMut {
    fn cancel_all(&mut self) {
        for handle in self.pending.iter_mut().filter_map(Option::take) {
            handle.cancel();
        }
    }
}

pub struct AutomatedActions {
    path: String,
    scheduler: Arc<dyn Scheduler>,
    performer: Arc<dyn ActionPerformer>,
    context: Arc<AlarmContext>,
    inner: Mutex<ActionsMut>,
}

impl AutomatedActions {
    pub fn new(
        path: &str,
        scheduler: Arc<dyn Scheduler>,
        performer: Arc<dyn ActionPerformer>,
        context: Arc<AlarmContext>,
    ) -> Arc<AutomatedActions> {
        Arc::new(AutomatedActions {
            path: path.to_string(),
            scheduler,
            performer,
            context,
            inner: Mutex::new(ActionsMut {
                actions: Vec::new(),
                pending: Vec::new(),
                last_severity: SeverityLevel::Ok,
                generation: 0,
            }),
        })
    }

    /// Replace the actions, cancelling anything pending.
    ///
    /// `severity` is the item's severity right now. If it is already in
    /// alarm, only a further rise triggers the new actions.
    pub fn configure(&self, actions: &[TitleDetailDelay], severity: SeverityLevel) {
        let mut inner = lock(&self.inner);
        inner.cancel_all();
        inner.generation += 1;
        inner.actions = actions
            .iter()
            .filter(|a| !a.details.starts_with(SEVERITY_PV_PREFIX))
            .cloned()
            .collect();
        inner.pending = vec![None; inner.actions.len()];
        inner.last_severity = severity;
    }

    pub fn clear(&self) {
        self.configure(&[], SeverityLevel::Ok);
    }

    /// Cancel pending actions but keep the configuration
    pub fn cancel(&self) {
        let mut inner = lock(&self.inner);
        inner.cancel_all();
        inner.last_severity = SeverityLevel::Ok;
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner).pending.iter().filter(|p| p.is_some()).count()
    }

    pub fn handle_severity_update(self: &Arc<Self>, severity: SeverityLevel) {
        let mut inner = lock(&self.inner);
        if !severity.is_active() {
            inner.cancel_all();
        } else if severity > inner.last_severity {
            let generation = inner.generation;
            for index in 0..inner.actions.len() {
                if inner.pending[index].is_some() {
                    continue;
                }
                let delay = Duration::from_secs(u64::from(inner.actions[index].delay));
                debug!(
                    "{}: Scheduling '{}' in {:?}",
                    self.path, inner.actions[index].title, delay
                );
                let weak: Weak<AutomatedActions> = Arc::downgrade(self);
                inner.pending[index] = Some(self.scheduler.schedule(
                    delay,
                    Box::new(move || {
                        if let Some(actions) = weak.upgrade() {
                            actions.fire(generation, index);
                        }
                    }),
                ));
            }
        }
        inner.last_severity = severity;
    }

    fn fire(&self, generation: u64, index: usize) {
        let action = {
            let mut inner = lock(&self.inner);
            if inner.generation != generation {
                return;
            }
            match inner.pending.get_mut(index).and_then(Option::take) {
                Some(_) => inner.actions[index].clone(),
                None => return,
            }
        };
        if self.context.disable_notify() {
            info!(
                "{}: Notifications disabled, skipping '{}'",
                self.path, action.title
            );
            return;
        }
        self.performer.perform(&self.path, &action);
    }
}

impl Drop for AutomatedActions {
    fn drop(&mut self) {
        lock(&self.inner).cancel_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use test_log::test;

    #[derive(Default)]
    struct Performed(Mutex<Vec<String>>);

    impl ActionPerformer for Performed {
        fn perform(&self, path: &str, action: &TitleDetailDelay) {
            self.0
                .lock()
                .unwrap()
                .push(format!("{}:{}", path, action.title));
        }
    }

    fn email() -> TitleDetailDelay {
        TitleDetailDelay {
            title: "Send Email".to_string(),
            details: "mailto:fred@mail.com".to_string(),
            delay: 2,
        }
    }

    fn setup(
        initial: SeverityLevel,
    ) -> (
        Arc<AutomatedActions>,
        Arc<Performed>,
        Arc<ManualScheduler>,
        Arc<AlarmContext>,
    ) {
        let scheduler = ManualScheduler::new();
        let performed = Arc::new(Performed::default());
        let context = AlarmContext::new();
        let actions = AutomatedActions::new(
            "/Test/pv",
            scheduler.clone(),
            performed.clone(),
            context.clone(),
        );
        actions.configure(&[email()], initial);
        (actions, performed, scheduler, context)
    }

    #[test]
    fn test_action_after_delay() {
        let (actions, performed, scheduler, _) = setup(SeverityLevel::Ok);
        actions.handle_severity_update(SeverityLevel::Minor);
        scheduler.advance(Duration::from_secs(1));
        // Rising while pending keeps the original deadline
        actions.handle_severity_update(SeverityLevel::Major);
        assert_eq!(scheduler.pending(), 1);
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(*performed.0.lock().unwrap(), vec!["/Test/pv:Send Email"]);
        assert_eq!(actions.pending_count(), 0);
    }

    #[test]
    fn test_acknowledge_cancels() {
        let (actions, performed, scheduler, _) = setup(SeverityLevel::Ok);
        actions.handle_severity_update(SeverityLevel::Major);
        scheduler.advance(Duration::from_secs(1));
        actions.handle_severity_update(SeverityLevel::MajorAck);
        scheduler.advance(Duration::from_secs(5));
        assert!(performed.0.lock().unwrap().is_empty());

        // Active again after the acknowledgement
        actions.handle_severity_update(SeverityLevel::Major);
        scheduler.advance(Duration::from_secs(2));
        assert_eq!(performed.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_was_in_alarm() {
        let (actions, performed, scheduler, _) = setup(SeverityLevel::Major);
        actions.handle_severity_update(SeverityLevel::Major);
        scheduler.advance(Duration::from_secs(5));
        assert!(performed.0.lock().unwrap().is_empty());

        actions.handle_severity_update(SeverityLevel::Ok);
        actions.handle_severity_update(SeverityLevel::Invalid);
        scheduler.advance(Duration::from_secs(2));
        assert_eq!(performed.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_disable_notify_and_clear() {
        let (actions, performed, scheduler, context) = setup(SeverityLevel::Ok);
        context.set_disable_notify(true);
        actions.handle_severity_update(SeverityLevel::Major);
        scheduler.advance(Duration::from_secs(2));
        assert!(performed.0.lock().unwrap().is_empty());

        context.set_disable_notify(false);
        actions.handle_severity_update(SeverityLevel::Ok);
        actions.handle_severity_update(SeverityLevel::Major);
        actions.clear();
        scheduler.advance(Duration::from_secs(2));
        assert!(performed.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_severity_pvs() {
        let actions = vec![
            email(),
            TitleDetailDelay {
                title: "Severity".to_string(),
                details: "sevrpv:loc://area_sevr".to_string(),
                delay: 0,
            },
        ];
        assert_eq!(severity_pvs(&actions), vec!["loc://area_sevr"]);
    }
}
