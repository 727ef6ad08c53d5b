use crate::alarm_logic::{AlarmLogic, AlarmLogicListener, LogicConfig};
use crate::alarm_state::{AlarmState, ClientState, EnabledState};
use crate::alarm_tree::{AlarmTree, AlarmTreeItem, HasSeverity, TreeServices};
use crate::automated_actions::AutomatedActions;
use crate::filter::expression::{parse_expression, Expression};
use crate::filter::formula::FormulaFilter;
use crate::filter::scheduled::ScheduledEnable;
use crate::filter::EnablementFilter;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::severity::SeverityLevel;
use crate::tree_path;
use crate::util::error::lock;
use crate::value_source::{Subscription, ValueSource, ValueUpdate};
use crate::wire::{ItemConfig, ItemState, StateMessage};
use chrono::Utc;
use log::{debug, info, warn};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub const NO_PV_MESSAGE: &str = "No PV";
pub const DISCONNECTED_MESSAGE: &str = "Disconnected";

/// User and host of configuration changes made by the server itself
pub const SERVER_USER: &str = "alarm-server";

struct PointRun {
    running: bool,
    subscription: Option<Box<dyn Subscription>>,
    watchdog: Option<TimerHandle>,
    filter: Option<EnablementFilter>,
}

/// Leaf of the alarm tree, watching one PV
pub struct AlarmPoint {
    path: String,
    name: String,
    parent: String,
    tree: Weak<AlarmTree>,
    source: Arc<dyn ValueSource>,
    scheduler: Arc<dyn Scheduler>,
    connection_timeout: Duration,
    logic: Arc<AlarmLogic>,
    config: Mutex<ItemConfig>,
    expression: Mutex<Option<Expression>>,
    run: Mutex<PointRun>,
    connected: AtomicBool,
    // Cleared when the point is removed from the tree
    attached: AtomicBool,
    actions: Arc<AutomatedActions>,
}

struct PointListener {
    point: Weak<AlarmPoint>,
}

impl AlarmLogicListener for PointListener {
    fn alarm_state_changed(&self, current: &AlarmState, alarm: &AlarmState) {
        if let Some(point) = self.point.upgrade() {
            point.state_changed(current, alarm);
        }
    }

    fn annunciate_alarm(&self, level: SeverityLevel) {
        if let Some(point) = self.point.upgrade() {
            point.annunciate(level);
        }
    }

    fn alarm_enablement_changed(&self, enabled: bool) {
        if let Some(point) = self.point.upgrade() {
            if enabled {
                let actions = lock(&point.config).actions.clone();
                point
                    .actions
                    .configure(&actions, point.logic.alarm_state().severity);
            } else {
                point.actions.cancel();
            }
        }
    }
}

impl AlarmPoint {
    pub fn new(
        tree: Weak<AlarmTree>,
        services: &TreeServices,
        path: &str,
        parent: &str,
        initial: Option<ClientState>,
    ) -> Arc<AlarmPoint> {
        Arc::new_cyclic(|weak| {
            let (current, alarm) = match initial {
                Some(state) => {
                    debug!("{} starts from {}", path, state.alarm);
                    let mut current = state.current_state();
                    current.value = "?".to_string();
                    (current, state.alarm)
                }
                None => {
                    let now = Utc::now();
                    (AlarmState::clear("", now), AlarmState::clear("", now))
                }
            };
            let logic = AlarmLogic::new(
                Arc::new(PointListener {
                    point: weak.clone(),
                }),
                services.context.clone(),
                services.scheduler.clone(),
                &LogicConfig::default(),
                current,
                alarm,
            );
            AlarmPoint {
                path: path.to_string(),
                name: tree_path::name(path),
                parent: parent.to_string(),
                tree,
                source: services.source.clone(),
                scheduler: services.scheduler.clone(),
                connection_timeout: services.connection_timeout,
                logic,
                config: Mutex::new(ItemConfig {
                    description: Some(String::new()),
                    ..Default::default()
                }),
                expression: Mutex::new(None),
                run: Mutex::new(PointRun {
                    running: false,
                    subscription: None,
                    watchdog: None,
                    filter: None,
                }),
                connected: AtomicBool::new(false),
                attached: AtomicBool::new(true),
                actions: AutomatedActions::new(
                    path,
                    services.scheduler.clone(),
                    services.performer.clone(),
                    services.context.clone(),
                ),
            }
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Name of the PV
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_path(&self) -> &str {
        &self.parent
    }

    pub fn logic(&self) -> &AlarmLogic {
        &self.logic
    }

    pub fn actions(&self) -> &Arc<AutomatedActions> {
        &self.actions
    }

    pub fn config(&self) -> ItemConfig {
        lock(&self.config).clone()
    }

    pub fn description(&self) -> String {
        match lock(&self.config).description.as_deref() {
            Some(description) if !description.is_empty() => description.to_string(),
            _ => self.name.clone(),
        }
    }

    pub fn severity(&self) -> SeverityLevel {
        self.logic.alarm_state().severity
    }

    pub fn is_enabled(&self) -> bool {
        self.logic.is_enabled()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.run).running
    }

    pub fn client_state(&self) -> ClientState {
        let (current, alarm) = self.logic.states();
        ClientState::new(&alarm, &current)
    }

    pub fn acknowledge(&self, acknowledge: bool) {
        self.logic.acknowledge(acknowledge);
    }

    /// Enable or disable. Returns true if this changed anything.
    pub fn set_enabled(&self, enable: bool) -> bool {
        self.logic.set_enabled(enable)
    }

    /// Take over a new configuration. The point should be stopped.
    ///
    /// Returns true if anything changed.
    pub fn apply_config(&self, mut config: ItemConfig) -> bool {
        let old = self.config();
        if config.filter != old.filter {
            if self.is_running() {
                warn!(
                    "{}: Cannot change filter while running, keeping '{}'",
                    self.path,
                    old.filter.as_deref().unwrap_or("")
                );
                config.filter = old.filter.clone();
            } else {
                *lock(&self.expression) = match config.filter.as_deref() {
                    Some(text) => match parse_expression(text) {
                        Ok(expression) => Some(expression),
                        Err(e) => {
                            warn!("{}: Invalid filter '{}': {}", self.path, text, e);
                            None
                        }
                    },
                    None => None,
                };
            }
        }
        let mut changed = config != old;
        changed |= self.logic.set_latching(config.latching);
        changed |= self.logic.set_annunciating(config.annunciating);
        changed |= self.logic.set_delay(config.delay);
        changed |= self.logic.set_count(config.count);
        let actions_changed = config.actions != old.actions;
        *lock(&self.config) = config.clone();
        changed |= self.logic.set_enabled(config.enabled.enabled);
        if actions_changed {
            self.actions
                .configure(&config.actions, self.logic.alarm_state().severity);
        }
        changed
    }

    /// Subscribe to the PV and start the filter.
    ///
    /// A disabled point only waits for its enable date, if it has one.
    pub fn start(self: &Arc<Self>) {
        let config = self.config();
        let weak = Arc::downgrade(self);
        {
            let mut run = lock(&self.run);
            if run.running || run.filter.is_some() {
                return;
            }
            if !config.enabled.enabled {
                if let Some(date) = config.enabled.enabled_date {
                    run.filter = Some(EnablementFilter::Scheduled(ScheduledEnable::start(
                        self.scheduler.as_ref(),
                        date,
                        Box::new(move || {
                            if let Some(point) = weak.upgrade() {
                                point.scheduled_enable();
                            }
                        }),
                    )));
                }
                return;
            }
            run.running = true;
            self.connected.store(false, Ordering::Release);
            let w = weak.clone();
            run.watchdog = Some(self.scheduler.schedule(
                self.connection_timeout,
                Box::new(move || {
                    if let Some(point) = w.upgrade() {
                        point.check_connection();
                    }
                }),
            ));
        }
        debug!("Start {}", self.name);

        let w = weak.clone();
        let subscription = self.source.subscribe(
            &self.name,
            Arc::new(move |update| {
                if let Some(point) = w.upgrade() {
                    point.handle_value_update(update);
                }
            }),
        );
        match subscription {
            Ok(subscription) => {
                let mut run = lock(&self.run);
                if run.running {
                    run.subscription = Some(subscription);
                }
            }
            Err(e) => {
                warn!("Cannot subscribe for {}: {}", self.path, e);
                self.logic.compute_new_state(AlarmState::new(
                    SeverityLevel::Undefined,
                    NO_PV_MESSAGE,
                    "",
                    Utc::now(),
                ));
            }
        }

        let expression = lock(&self.expression).clone();
        if let Some(expression) = expression {
            let w = weak;
            let filter = FormulaFilter::new(
                expression,
                self.source.clone(),
                self.scheduler.clone(),
                Arc::new(move |value| {
                    if let Some(point) = w.upgrade() {
                        point.filter_changed(value);
                    }
                }),
            );
            {
                let mut run = lock(&self.run);
                if !run.running {
                    return;
                }
                run.filter = Some(EnablementFilter::Formula(filter.clone()));
            }
            filter.start();
        }
    }

    /// Release the PV and cancel all timers. Stopping twice is fine.
    pub fn stop(&self) {
        self.logic.dispose();
        self.actions.cancel();
        let (subscription, watchdog, filter) = {
            let mut run = lock(&self.run);
            run.running = false;
            (
                run.subscription.take(),
                run.watchdog.take(),
                run.filter.take(),
            )
        };
        if let Some(watchdog) = watchdog {
            watchdog.cancel();
        }
        if let Some(filter) = filter {
            filter.stop();
        }
        if subscription.is_some() {
            debug!("Stop {}", self.name);
        }
        drop(subscription);
        self.connected.store(false, Ordering::Release);
    }

    /// Stop publishing, the point is no longer part of the tree
    pub(crate) fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    fn handle_value_update(&self, update: ValueUpdate) {
        match update {
            ValueUpdate::Disconnected => self.disconnected(),
            ValueUpdate::Value(sample) => {
                self.connected.store(true, Ordering::Release);
                self.logic.compute_new_state(AlarmState::new(
                    sample.severity,
                    &sample.message,
                    &sample.value,
                    sample.time,
                ));
            }
        }
    }

    fn check_connection(&self) {
        if !self.is_connected() {
            warn!("{} connection timed out", self.path);
            self.disconnected();
        }
    }

    fn disconnected(&self) {
        debug!("{} disconnected", self.path);
        self.connected.store(false, Ordering::Release);
        self.logic.compute_new_state(AlarmState::new(
            SeverityLevel::Undefined,
            DISCONNECTED_MESSAGE,
            "",
            Utc::now(),
        ));
    }

    fn filter_changed(&self, value: f64) {
        debug!("{} filter value {}", self.path, value);
        self.logic.set_enabled(value > 0.0);
    }

    fn scheduled_enable(self: &Arc<Self>) {
        info!("{} enabled as scheduled", self.path);
        let config = {
            let mut config = lock(&self.config);
            config.enabled = EnabledState::enabled();
            config.user = Some(SERVER_USER.to_string());
            config.host = Some(SERVER_USER.to_string());
            config.clone()
        };
        lock(&self.run).filter = None;
        self.logic.set_enabled(true);
        if self.attached.load(Ordering::Acquire) {
            if let Some(tree) = self.tree.upgrade() {
                tree.publisher().send_config_update(&self.path, Some(&config));
            }
        }
        self.start();
    }

    fn state_changed(&self, current: &AlarmState, alarm: &AlarmState) {
        if !self.attached.load(Ordering::Acquire) {
            debug!("{} ignores change to {} since no longer in tree", self.path, alarm);
            return;
        }
        let tree = match self.tree.upgrade() {
            Some(tree) => tree,
            None => return,
        };
        debug!("{} changes to {}, {}", self.path, current, alarm);
        let msg = StateMessage {
            state: ItemState::Point(ClientState::new(alarm, current)),
            flags: None,
        };
        tree.publisher().send_state_update(&self.path, Some(&msg));
        self.actions.handle_severity_update(alarm.severity);
        if let Some(AlarmTreeItem::Node(parent)) = tree.get(&self.parent) {
            parent.maximize_severity();
        }
    }

    fn annunciate(&self, level: SeverityLevel) {
        if !self.attached.load(Ordering::Acquire) {
            return;
        }
        if let Some(tree) = self.tree.upgrade() {
            tree.publisher()
                .send_annunciation(&self.path, level, &self.description());
        }
    }
}

impl HasSeverity for AlarmPoint {
    fn severity(&self) -> SeverityLevel {
        AlarmPoint::severity(self)
    }

    fn is_enabled(&self) -> bool {
        AlarmPoint::is_enabled(self)
    }
}

impl Display for AlarmPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{} [{}]", self.path, self.description())?;
        if self.is_running() {
            if self.is_connected() {
                f.write_str(" - connected")?;
            } else {
                f.write_str(" - disconnected")?;
            }
        }
        if !self.is_enabled() {
            f.write_str(" - disabled")?;
        }
        if self.logic.is_annunciating() {
            f.write_str(" - annunciating")?;
        }
        if self.logic.is_latching() {
            f.write_str(" - latching")?;
        }
        let (delay, count) = (self.logic.delay(), self.logic.count());
        if delay > 0 {
            if count > 0 {
                write!(f, " - {} counts within {} sec", count, delay)?;
            } else {
                write!(f, " - {} sec delay", delay)?;
            }
        }
        let (current, alarm) = self.logic.states();
        write!(f, " - current {}, alarm {}", current, alarm)?;
        if let Some(expression) = lock(&self.expression).as_ref() {
            if self.is_enabled() {
                write!(f, " - dynamically enabled via {}", expression)?;
            } else {
                write!(f, " - dynamically disabled via {}", expression)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alarm_tree::test_support::{point_config, test_tree, Published};
    use crate::value_source::PvSample;
    use std::collections::HashMap;
    use test_log::test;

    #[test]
    fn test_value_updates() {
        let t = test_tree(HashMap::new());
        let point = t.add_point("/Test/pv1", point_config());
        assert!(point.is_running());
        t.source
            .set("pv1", PvSample::new(SeverityLevel::Minor, "LOW", "3"));
        assert!(point.is_connected());
        let state = t.publisher.point_state("/Test/pv1").unwrap();
        assert_eq!(state.alarm.severity, SeverityLevel::Minor);
        assert_eq!(state.current_message, "LOW");
        assert_eq!(t.publisher.talk(), vec!["Test point".to_string()]);

        t.source.disconnect("pv1");
        assert!(!point.is_connected());
        let state = t.publisher.point_state("/Test/pv1").unwrap();
        assert_eq!(state.alarm.severity, SeverityLevel::Undefined);
        assert_eq!(state.current_message, DISCONNECTED_MESSAGE);
    }

    #[test]
    fn test_connection_timeout() {
        let t = test_tree(HashMap::new());
        let point = t.add_point("/Test/pv1", point_config());
        t.scheduler.advance(Duration::from_secs(29));
        assert_eq!(point.severity(), SeverityLevel::Ok);
        t.scheduler.advance(Duration::from_secs(1));
        assert_eq!(point.severity(), SeverityLevel::Undefined);
        assert_eq!(point.logic().current_state().message, DISCONNECTED_MESSAGE);

        // A value that arrived in time cancels the watchdog's effect
        let other = t.add_point("/Test/pv2", point_config());
        t.source.set("pv2", PvSample::value("1"));
        t.scheduler.advance(Duration::from_secs(30));
        assert_eq!(other.severity(), SeverityLevel::Ok);
    }

    #[test]
    fn test_no_pv() {
        let t = test_tree(HashMap::new());
        // The local source refuses blank names
        let point = t.add_point("/Test/ ", point_config());
        assert_eq!(point.severity(), SeverityLevel::Undefined);
        assert_eq!(point.logic().alarm_state().message, NO_PV_MESSAGE);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let t = test_tree(HashMap::new());
        let point = t.add_point("/Test/pv1", point_config());
        assert_eq!(t.source.subscriber_count("pv1"), 1);
        point.stop();
        point.stop();
        assert!(!point.is_running());
        assert_eq!(t.source.subscriber_count("pv1"), 0);
        assert_eq!(t.scheduler.pending(), 0);
    }

    #[test]
    fn test_initial_state() {
        let now = Utc::now();
        let mut initial = HashMap::new();
        initial.insert(
            "/Test/pv1".to_string(),
            ClientState::new(
                &AlarmState::new(SeverityLevel::Major, "HIHI", "10", now),
                &AlarmState::new(SeverityLevel::Major, "HIHI", "10", now),
            ),
        );
        let t = test_tree(initial);
        let point = t.add_point("/Test/pv1", point_config());
        assert_eq!(point.severity(), SeverityLevel::Major);
        // The same alarm again is not announced
        t.source
            .set("pv1", PvSample::new(SeverityLevel::Major, "HIHI", "11"));
        assert!(t.publisher.talk().is_empty());
        assert_eq!(t.tree.root().severity(), SeverityLevel::Major);
    }

    #[test]
    fn test_filter_enablement() {
        let t = test_tree(HashMap::new());
        t.source.set("enable", PvSample::value("0"));
        let point = t.add_point(
            "/Test/pv1",
            ItemConfig {
                filter: Some("enable > 0".to_string()),
                ..point_config()
            },
        );
        t.source
            .set("pv1", PvSample::new(SeverityLevel::Major, "HIHI", "1"));
        t.scheduler.run_due();
        assert!(!point.is_enabled());
        assert_eq!(point.severity(), SeverityLevel::Ok);
        assert_eq!(t.tree.root().severity(), SeverityLevel::Ok);

        // Enabling replays what arrived meanwhile
        t.source.set("enable", PvSample::value("1"));
        t.scheduler.run_due();
        assert!(point.is_enabled());
        assert_eq!(point.severity(), SeverityLevel::Major);
        assert!(point.to_string().contains("dynamically enabled via"));

        // Filter can't change while running
        point.apply_config(ItemConfig {
            filter: Some("other".to_string()),
            ..point_config()
        });
        assert_eq!(point.config().filter.as_deref(), Some("enable > 0"));
    }

    #[test]
    fn test_scheduled_enable() {
        let t = test_tree(HashMap::new());
        let date = Utc::now() + chrono::Duration::seconds(60);
        let point = t.add_point(
            "/Test/pv1",
            ItemConfig {
                enabled: EnabledState::disabled_until(date),
                ..point_config()
            },
        );
        assert!(!point.is_enabled());
        assert!(!point.is_running());
        assert_eq!(t.source.subscriber_count("pv1"), 0);

        t.scheduler.advance(Duration::from_secs(61));
        assert!(point.is_enabled());
        assert!(point.is_running());
        assert_eq!(t.source.subscriber_count("pv1"), 1);
        let republished = t.publisher.published.lock().unwrap().iter().any(|p| {
            matches!(p, Published::Config(path, Some(config))
                if path == "/Test/pv1" && config.enabled.enabled
                    && config.user.as_deref() == Some(SERVER_USER))
        });
        assert!(republished);
    }
}
