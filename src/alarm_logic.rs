//! Alarm state machine of a single point.
//!
//! Combines the current state reported by the value source with the
//! latching, acknowledgement, delay and count policies into the alarm
//! state that operators see.

use crate::alarm_state::AlarmState;
use crate::delayed_transition::DelayedTransition;
use crate::scheduler::Scheduler;
use crate::severity::SeverityLevel;
use crate::state_history::AlarmStateHistory;
use crate::util::error::lock;
use chrono::Utc;
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DISABLED_MESSAGE: &str = "Disabled";

/// Flags shared by all alarm logic instances of one server
#[derive(Debug, Default)]
pub struct AlarmContext {
    maintenance_mode: AtomicBool,
    disable_notify: AtomicBool,
}

impl AlarmContext {
    pub fn new() -> Arc<AlarmContext> {
        Arc::new(AlarmContext::default())
    }

    pub fn maintenance_mode(&self) -> bool {
        self.maintenance_mode.load(Ordering::Acquire)
    }

    /// Returns true if the mode changed
    pub fn set_maintenance_mode(&self, maintenance: bool) -> bool {
        self.maintenance_mode.swap(maintenance, Ordering::AcqRel) != maintenance
    }

    pub fn disable_notify(&self) -> bool {
        self.disable_notify.load(Ordering::Acquire)
    }

    /// Returns true if the setting changed
    pub fn set_disable_notify(&self, disable: bool) -> bool {
        self.disable_notify.swap(disable, Ordering::AcqRel) != disable
    }
}

pub trait AlarmLogicListener: Send + Sync {
    /// Called for every update of the current or alarm state
    fn alarm_state_changed(&self, current: &AlarmState, alarm: &AlarmState);

    /// Called when the alarm state rose to a higher severity
    fn annunciate_alarm(&self, level: SeverityLevel);

    fn alarm_enablement_changed(&self, _enabled: bool) {}
}

/// Initial settings for [`AlarmLogic`]
#[derive(Debug, Clone)]
pub struct LogicConfig {
    pub enabled: bool,
    pub latching: bool,
    pub annunciating: bool,
    pub delay: u32,
    pub count: u32,
}

impl Default for LogicConfig {
    fn default() -> Self {
        LogicConfig {
            enabled: true,
            latching: true,
            annunciating: true,
            delay: 0,
            count: 0,
        }
    }
}

struct LogicStateMut {
    current: AlarmState,
    alarm: AlarmState,
    /// Last state received while disabled, replayed when enabled
    disabled_state: Option<AlarmState>,
    history: Option<AlarmStateHistory>,
}

pub struct AlarmLogic {
    listener: Arc<dyn AlarmLogicListener>,
    context: Arc<AlarmContext>,
    enabled: AtomicBool,
    latching: AtomicBool,
    annunciating: AtomicBool,
    has_priority: AtomicBool,
    delay: AtomicU32,
    count: AtomicU32,
    delayed: DelayedTransition,
    state: Mutex<LogicStateMut>,
}

impl AlarmLogic {
    pub fn new(
        listener: Arc<dyn AlarmLogicListener>,
        context: Arc<AlarmContext>,
        scheduler: Arc<dyn Scheduler>,
        config: &LogicConfig,
        current: AlarmState,
        alarm: AlarmState,
    ) -> Arc<AlarmLogic> {
        Arc::new_cyclic(|weak: &std::sync::Weak<AlarmLogic>| {
            let weak = weak.clone();
            let delayed = DelayedTransition::new(
                scheduler,
                Arc::new(move |state| {
                    if let Some(logic) = weak.upgrade() {
                        logic.delayed_state_update(state);
                    }
                }),
            );
            AlarmLogic {
                listener,
                context,
                enabled: AtomicBool::new(config.enabled),
                latching: AtomicBool::new(config.latching),
                annunciating: AtomicBool::new(config.annunciating),
                has_priority: AtomicBool::new(false),
                delay: AtomicU32::new(config.delay),
                count: AtomicU32::new(config.count),
                delayed,
                state: Mutex::new(LogicStateMut {
                    current,
                    alarm,
                    disabled_state: None,
                    history: None,
                }),
            }
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable or disable. Returns true if this changed anything.
    ///
    /// While disabled the alarm state is OK and the latest received
    /// state is kept, re-enabling replays it.
    pub fn set_enabled(&self, enable: bool) -> bool {
        if self.enabled.swap(enable, Ordering::AcqRel) == enable {
            return false;
        }
        self.listener.alarm_enablement_changed(enable);
        if enable {
            let replay = lock(&self.state).disabled_state.take();
            if let Some(received) = replay {
                self.compute_new_state(received);
            }
        } else {
            self.delayed.cancel();
            let (current, alarm) = {
                let mut state = lock(&self.state);
                let now = Utc::now();
                state.disabled_state = Some(state.current.clone());
                state.current = AlarmState::clear(&state.current.value, now);
                state.alarm = AlarmState::new(SeverityLevel::Ok, DISABLED_MESSAGE, "", now);
                (state.current.clone(), state.alarm.clone())
            };
            self.listener.alarm_state_changed(&current, &alarm);
        }
        true
    }

    pub fn is_latching(&self) -> bool {
        self.latching.load(Ordering::Acquire)
    }

    pub fn set_latching(&self, latching: bool) -> bool {
        self.latching.swap(latching, Ordering::AcqRel) != latching
    }

    pub fn is_annunciating(&self) -> bool {
        self.annunciating.load(Ordering::Acquire)
    }

    pub fn set_annunciating(&self, annunciating: bool) -> bool {
        self.annunciating.swap(annunciating, Ordering::AcqRel) != annunciating
    }

    pub fn has_priority(&self) -> bool {
        self.has_priority.load(Ordering::Acquire)
    }

    /// Priority points are not acknowledged automatically in maintenance mode
    pub fn set_priority(&self, has_priority: bool) -> bool {
        self.has_priority.swap(has_priority, Ordering::AcqRel) != has_priority
    }

    pub fn delay(&self) -> u32 {
        self.delay.load(Ordering::Acquire)
    }

    pub fn set_delay(&self, seconds: u32) -> bool {
        self.delay.swap(seconds, Ordering::AcqRel) != seconds
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn set_count(&self, count: u32) -> bool {
        if self.count.swap(count, Ordering::AcqRel) == count {
            return false;
        }
        lock(&self.state).history = None;
        true
    }

    pub fn current_state(&self) -> AlarmState {
        lock(&self.state).current.clone()
    }

    pub fn alarm_state(&self) -> AlarmState {
        lock(&self.state).alarm.clone()
    }

    /// Current and alarm state, read together
    pub fn states(&self) -> (AlarmState, AlarmState) {
        let state = lock(&self.state);
        (state.current.clone(), state.alarm.clone())
    }

    /// Process a state received from the value source
    pub fn compute_new_state(&self, received: AlarmState) {
        let with_delay;
        {
            let mut state = lock(&self.state);
            if !self.is_enabled() {
                state.disabled_state = Some(received);
                return;
            }
            let unchanged = received.severity == state.current.severity
                && received.message == state.current.message;
            state.current = received.clone();
            if unchanged {
                return;
            }
            let cleared = received.severity == SeverityLevel::Ok && !state.alarm.severity.is_active();
            let leaving_maintenance_alarm = self.context.maintenance_mode()
                && received.severity < SeverityLevel::Invalid
                && state.alarm.severity.unacknowledged() >= SeverityLevel::Invalid;
            if cleared || leaving_maintenance_alarm {
                state.alarm = AlarmState::clear(&received.value, received.time);
                self.delayed.cancel();
            }
            with_delay = self.delay() > 0;
        }
        self.update_state(received, with_delay);
    }

    fn delayed_state_update(&self, delayed: AlarmState) {
        debug!("Delayed alarm state update to {}", delayed);
        self.update_state(delayed, false);
    }

    /// Candidate for the next alarm state, None if the alarm state stays
    fn latch_alarm_state(&self, to_update: &AlarmState, received: &AlarmState) -> Option<AlarmState> {
        if self.is_latching() {
            if received.has_higher_update_priority(to_update) {
                return Some(received.clone().with_latch(true));
            }
            if to_update.latched {
                return Some(to_update.clone().with_latch(false));
            }
            None
        } else if to_update.severity.is_active() || received.has_higher_update_priority(to_update) {
            Some(received.clone().with_latch(false))
        } else {
            None
        }
    }

    /// Feed the count history, true if the alarm should bypass the delay
    fn check_count(&self, state: &mut LogicStateMut, received: &AlarmState) -> bool {
        let count = self.count() as usize;
        if count == 0 {
            return false;
        }
        let history = match &mut state.history {
            Some(history) if history.capacity() == count => history,
            history => history.insert(AlarmStateHistory::new(count)),
        };
        history.add(received.clone());
        if history.within_range(self.delay()) {
            history.reset();
            return true;
        }
        false
    }

    fn update_state(&self, received: AlarmState, with_delay: bool) {
        let mut raised = None;
        let (current, alarm) = {
            let mut state = lock(&self.state);
            let to_update = self
                .delayed
                .pending_state()
                .unwrap_or_else(|| state.alarm.clone());
            if let Some(new_state) = self.latch_alarm_state(&to_update, &received) {
                if with_delay && received.severity != SeverityLevel::Ok {
                    let delay = Duration::from_secs(u64::from(self.delay()));
                    self.delayed.schedule(new_state.clone(), delay);
                    if self.check_count(&mut state, &received) {
                        debug!("Alarm count reached, bypassing delay");
                        self.delayed.cancel();
                        if new_state.has_higher_update_priority(&state.alarm) {
                            raised = Some(new_state.severity);
                        }
                        state.alarm = new_state;
                    }
                } else {
                    if new_state.has_higher_update_priority(&state.alarm) {
                        raised = Some(new_state.severity);
                    }
                    state.alarm = new_state;
                }
            }
            if self.context.maintenance_mode()
                && !self.has_priority()
                && state.alarm.severity >= SeverityLevel::Invalid
            {
                state.alarm = state.alarm.acknowledged();
                raised = None;
            }
            (state.current.clone(), state.alarm.clone())
        };
        self.listener.alarm_state_changed(&current, &alarm);
        if let Some(level) = raised {
            if self.is_annunciating() {
                self.listener.annunciate_alarm(level);
            }
        }
    }

    /// Acknowledge, or un-acknowledge, the alarm
    pub fn acknowledge(&self, acknowledge: bool) {
        let (current, alarm) = {
            let mut state = lock(&self.state);
            if acknowledge {
                if state.current.severity == SeverityLevel::Ok {
                    state.alarm = AlarmState::clear(&state.current.value, Utc::now());
                } else {
                    state.alarm = state.alarm.acknowledged();
                }
            } else {
                state.alarm = state.current.unacknowledged();
            }
            (state.current.clone(), state.alarm.clone())
        };
        self.listener.alarm_state_changed(&current, &alarm);
    }

    /// Drop any pending delayed transition
    pub fn dispose(&self) {
        self.delayed.cancel();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use chrono::{DateTime, Duration as ChronoDuration};
    use test_log::test;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<(AlarmState, AlarmState)>>,
        annunciated: Mutex<Vec<SeverityLevel>>,
        enablement: Mutex<Vec<bool>>,
    }

    impl AlarmLogicListener for Recorder {
        fn alarm_state_changed(&self, current: &AlarmState, alarm: &AlarmState) {
            self.updates
                .lock()
                .unwrap()
                .push((current.clone(), alarm.clone()));
        }

        fn annunciate_alarm(&self, level: SeverityLevel) {
            self.annunciated.lock().unwrap().push(level);
        }

        fn alarm_enablement_changed(&self, enabled: bool) {
            self.enablement.lock().unwrap().push(enabled);
        }
    }

    impl Recorder {
        fn alarm_severities(&self) -> Vec<SeverityLevel> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .map(|(_, alarm)| alarm.severity)
                .collect()
        }

        fn last_alarm(&self) -> AlarmState {
            self.updates.lock().unwrap().last().unwrap().1.clone()
        }

        fn annunciated(&self) -> Vec<SeverityLevel> {
            self.annunciated.lock().unwrap().clone()
        }
    }

    struct Fixture {
        logic: Arc<AlarmLogic>,
        recorder: Arc<Recorder>,
        scheduler: Arc<ManualScheduler>,
        context: Arc<AlarmContext>,
        t0: DateTime<Utc>,
    }

    fn fixture(config: LogicConfig) -> Fixture {
        let recorder = Arc::new(Recorder::default());
        let scheduler = ManualScheduler::new();
        let context = AlarmContext::new();
        let t0 = Utc::now();
        let logic = AlarmLogic::new(
            recorder.clone(),
            context.clone(),
            scheduler.clone(),
            &config,
            AlarmState::clear("", t0),
            AlarmState::clear("", t0),
        );
        Fixture {
            logic,
            recorder,
            scheduler,
            context,
            t0,
        }
    }

    impl Fixture {
        fn receive(&self, severity: SeverityLevel, message: &str, secs: i64) {
            self.logic.compute_new_state(AlarmState::new(
                severity,
                message,
                &secs.to_string(),
                self.t0 + ChronoDuration::seconds(secs),
            ));
        }
    }

    #[test]
    fn test_latching_never_drops() {
        let f = fixture(LogicConfig::default());
        f.receive(SeverityLevel::Minor, "LOW", 0);
        f.receive(SeverityLevel::Major, "LOLO", 1);
        f.receive(SeverityLevel::Minor, "LOW", 2);
        f.receive(SeverityLevel::Ok, "", 3);
        assert_eq!(
            f.recorder.alarm_severities(),
            vec![
                SeverityLevel::Minor,
                SeverityLevel::Major,
                SeverityLevel::Major,
                SeverityLevel::Major
            ]
        );
        let alarm = f.logic.alarm_state();
        assert_eq!(alarm.severity, SeverityLevel::Major);
        assert!(!alarm.latched);
        assert_eq!(
            f.recorder.annunciated(),
            vec![SeverityLevel::Minor, SeverityLevel::Major]
        );

        // Current is OK, so acknowledging clears the alarm
        f.logic.acknowledge(true);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Ok);
    }

    #[test]
    fn test_latching_is_monotonic_for_all_sequences() {
        let levels = [
            SeverityLevel::Ok,
            SeverityLevel::Minor,
            SeverityLevel::Major,
            SeverityLevel::Invalid,
            SeverityLevel::Undefined,
        ];
        for len in 1..=3u32 {
            for n in 0..levels.len().pow(len) {
                let sequence: Vec<SeverityLevel> = (0..len)
                    .map(|i| levels[n / levels.len().pow(i) % levels.len()])
                    .collect();
                let f = fixture(LogicConfig::default());
                let mut previous = SeverityLevel::Ok;
                for (i, severity) in sequence.iter().enumerate() {
                    f.receive(*severity, "", i as i64);
                    let alarm = f.logic.alarm_state().severity;
                    assert!(alarm >= previous, "{:?} dropped to {}", sequence, alarm);
                    assert!(alarm >= *severity, "{:?} below {}", sequence, severity);
                    previous = alarm;
                }
                f.logic.acknowledge(true);
                assert!(
                    !f.logic.alarm_state().severity.is_active(),
                    "{:?} still active after acknowledge",
                    sequence
                );
            }
        }
    }

    #[test]
    fn test_latched_minor_to_major() {
        let f = fixture(LogicConfig::default());
        f.receive(SeverityLevel::Minor, "LOW", 0);
        f.receive(SeverityLevel::Major, "LOLO", 1);
        let alarm = f.recorder.last_alarm();
        assert_eq!(alarm.severity, SeverityLevel::Major);
        assert!(alarm.latched);
        assert!(!f
            .recorder
            .alarm_severities()
            .windows(2)
            .any(|w| w[1] < w[0]));
    }

    #[test]
    fn test_redundant_update_is_ignored() {
        let f = fixture(LogicConfig::default());
        f.receive(SeverityLevel::Minor, "LOW", 0);
        f.receive(SeverityLevel::Minor, "LOW", 1);
        assert_eq!(f.recorder.updates.lock().unwrap().len(), 1);
        // Value is still refreshed
        assert_eq!(f.logic.current_state().value, "1");
        f.receive(SeverityLevel::Minor, "LOW again", 2);
        assert_eq!(f.recorder.updates.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_non_latching_follows_value() {
        let f = fixture(LogicConfig {
            latching: false,
            ..Default::default()
        });
        f.receive(SeverityLevel::Major, "HIHI", 0);
        f.receive(SeverityLevel::Minor, "HIGH", 1);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Minor);
        f.receive(SeverityLevel::Ok, "", 2);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Ok);

        // Acknowledged alarms only move up
        f.receive(SeverityLevel::Major, "HIHI", 3);
        f.logic.acknowledge(true);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::MajorAck);
        f.receive(SeverityLevel::Minor, "HIGH", 4);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::MajorAck);
        f.receive(SeverityLevel::Invalid, "COMM", 5);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Invalid);
    }

    #[test]
    fn test_acknowledge_and_unacknowledge() {
        let f = fixture(LogicConfig::default());
        f.receive(SeverityLevel::Major, "HIHI", 0);
        f.logic.acknowledge(true);
        let acked = f.logic.alarm_state();
        assert_eq!(acked.severity, SeverityLevel::MajorAck);
        assert_eq!(acked.message, "HIHI");

        // A new, higher alarm is annunciated again
        f.receive(SeverityLevel::Invalid, "COMM", 1);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Invalid);

        f.logic.acknowledge(true);
        f.logic.acknowledge(false);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Invalid);
        assert_eq!(f.logic.alarm_state().message, "COMM");
    }

    #[test]
    fn test_delay_cancelled_by_ok() {
        let f = fixture(LogicConfig {
            delay: 5,
            ..Default::default()
        });
        f.receive(SeverityLevel::Major, "HIHI", 0);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Ok);
        f.scheduler.advance(std::time::Duration::from_secs(2));
        f.receive(SeverityLevel::Ok, "", 2);
        f.scheduler.advance(std::time::Duration::from_secs(10));
        assert!(!f
            .recorder
            .alarm_severities()
            .contains(&SeverityLevel::Major));
        assert!(f.recorder.annunciated().is_empty());
    }

    #[test]
    fn test_delay_elapses() {
        let f = fixture(LogicConfig {
            delay: 5,
            ..Default::default()
        });
        f.receive(SeverityLevel::Minor, "LOW", 0);
        f.scheduler.advance(std::time::Duration::from_secs(2));
        f.receive(SeverityLevel::Major, "LOLO", 2);
        f.scheduler.advance(std::time::Duration::from_secs(2));
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Ok);
        // Fires at the first deadline with the latest target
        f.scheduler.advance(std::time::Duration::from_secs(1));
        let alarm = f.logic.alarm_state();
        assert_eq!(alarm.severity, SeverityLevel::Major);
        assert!(alarm.latched);
        assert_eq!(f.recorder.annunciated(), vec![SeverityLevel::Major]);
    }

    #[test]
    fn test_count_bypasses_delay() {
        let f = fixture(LogicConfig {
            delay: 10,
            count: 3,
            ..Default::default()
        });
        f.receive(SeverityLevel::Minor, "LOW", 0);
        f.receive(SeverityLevel::Major, "LOLO", 3);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Ok);
        f.receive(SeverityLevel::Minor, "LOW", 6);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Major);
        assert_eq!(f.recorder.annunciated(), vec![SeverityLevel::Major]);
        assert_eq!(f.scheduler.pending(), 0);

        // History was reset, a fresh burst is needed
        f.receive(SeverityLevel::Invalid, "COMM", 7);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Major);
        f.scheduler.advance(std::time::Duration::from_secs(10));
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Invalid);
    }

    #[test]
    fn test_count_outside_window() {
        let f = fixture(LogicConfig {
            delay: 10,
            count: 3,
            ..Default::default()
        });
        f.receive(SeverityLevel::Minor, "LOW", 0);
        f.receive(SeverityLevel::Major, "LOLO", 6);
        f.receive(SeverityLevel::Minor, "LOW", 12);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Ok);
    }

    #[test]
    fn test_maintenance_mode_auto_acknowledge() {
        let f = fixture(LogicConfig::default());
        f.context.set_maintenance_mode(true);
        f.receive(SeverityLevel::Invalid, "COMM", 0);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::InvalidAck);
        assert!(f.recorder.annunciated().is_empty());

        // Leaving INVALID returns to OK even though the alarm latched
        f.receive(SeverityLevel::Minor, "LOW", 1);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Minor);

        // Below INVALID is still annunciated
        assert_eq!(f.recorder.annunciated(), vec![SeverityLevel::Minor]);
    }

    #[test]
    fn test_maintenance_mode_priority_point() {
        let f = fixture(LogicConfig::default());
        f.logic.set_priority(true);
        f.context.set_maintenance_mode(true);
        f.receive(SeverityLevel::Undefined, "Disconnected", 0);
        assert_eq!(f.logic.alarm_state().severity, SeverityLevel::Undefined);
        assert_eq!(f.recorder.annunciated(), vec![SeverityLevel::Undefined]);
    }

    #[test]
    fn test_disable_and_replay() {
        let f = fixture(LogicConfig::default());
        f.receive(SeverityLevel::Major, "HIHI", 0);
        assert!(f.logic.set_enabled(false));
        assert!(!f.logic.set_enabled(false));
        let alarm = f.logic.alarm_state();
        assert_eq!(alarm.severity, SeverityLevel::Ok);
        assert_eq!(alarm.message, DISABLED_MESSAGE);

        // Updates while disabled are only remembered
        f.receive(SeverityLevel::Minor, "HIGH", 1);
        assert_eq!(f.logic.alarm_state().message, DISABLED_MESSAGE);

        assert!(f.logic.set_enabled(true));
        let alarm = f.logic.alarm_state();
        assert_eq!(alarm.severity, SeverityLevel::Minor);
        assert_eq!(alarm.message, "HIGH");
        assert_eq!(*f.recorder.enablement.lock().unwrap(), vec![false, true]);
    }

    #[test]
    fn test_disable_cancels_delay() {
        let f = fixture(LogicConfig {
            delay: 5,
            ..Default::default()
        });
        f.receive(SeverityLevel::Major, "HIHI", 0);
        f.logic.set_enabled(false);
        f.scheduler.advance(std::time::Duration::from_secs(10));
        assert_eq!(f.logic.alarm_state().message, DISABLED_MESSAGE);
    }

    #[test]
    fn test_setters_report_change() {
        let f = fixture(LogicConfig::default());
        assert!(!f.logic.set_latching(true));
        assert!(f.logic.set_latching(false));
        assert!(f.logic.set_delay(4));
        assert!(!f.logic.set_delay(4));
        assert!(f.logic.set_count(2));
        assert!(f.logic.set_annunciating(false));
        assert_eq!(
            (f.logic.delay(), f.logic.count(), f.logic.is_annunciating()),
            (4, 2, false)
        );
    }
}
