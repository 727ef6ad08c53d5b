//! The alarm server model: reads configuration and commands from the
//! log, maintains the alarm tree and publishes its state.

use crate::alarm_state::ClientState;
use crate::alarm_tree::{AlarmTree, AlarmTreeItem, StatePublisher, TreeServices};
use crate::alarm_logic::AlarmContext;
use crate::automated_actions::ActionPerformer;
use crate::commands::CommandHandler;
use crate::scheduler::Scheduler;
use crate::settings::ServerSettings;
use crate::severity::SeverityLevel;
use crate::topic::{LogRecord, TopicConsumer, TopicProducer, Topics};
use crate::util::error::{lock, DynResult};
use crate::value_source::ValueSource;
use crate::wire::{
    encode_config, encode_state, encode_talk, make_key, parse_config, parse_key, ItemConfig,
    RecordType, StateMessage,
};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info_span;

pub const STARTED_MESSAGE: &str = "* Alarm server started";
pub const RECONNECTED_MESSAGE: &str = "* Alarm server reconnected";

/// Publishes to the log, remembering when it last did so
pub struct LogPublisher {
    producer: Arc<dyn TopicProducer>,
    topics: Topics,
    last_state_update: Mutex<Instant>,
    last_annunciation: Mutex<Instant>,
}

impl LogPublisher {
    pub fn new(producer: Arc<dyn TopicProducer>, topics: Topics) -> LogPublisher {
        let now = Instant::now();
        LogPublisher {
            producer,
            topics,
            last_state_update: Mutex::new(now),
            last_annunciation: Mutex::new(now),
        }
    }

    pub fn last_state_update(&self) -> Instant {
        *lock(&self.last_state_update)
    }

    pub fn last_annunciation(&self) -> Instant {
        *lock(&self.last_annunciation)
    }

    fn send(&self, record: LogRecord) {
        debug!("Publish {}: {:?}", record.key, record.value);
        if let Err(e) = self.producer.send(record) {
            error!("Failed to publish: {}", e);
        }
    }
}

impl StatePublisher for LogPublisher {
    fn send_state_update(&self, path: &str, state: Option<&StateMessage>) {
        let value = match state.map(encode_state).transpose() {
            Ok(value) => value,
            Err(e) => {
                error!("Cannot encode state of {}: {}", path, e);
                return;
            }
        };
        self.send(LogRecord::new(
            &self.topics.config,
            &make_key(RecordType::State, path),
            value,
        ));
        *lock(&self.last_state_update) = Instant::now();
    }

    fn send_config_update(&self, path: &str, config: Option<&ItemConfig>) {
        let value = match config.map(encode_config).transpose() {
            Ok(value) => value,
            Err(e) => {
                error!("Cannot encode config of {}: {}", path, e);
                return;
            }
        };
        self.send(LogRecord::new(
            &self.topics.config,
            &make_key(RecordType::Config, path),
            value,
        ));
    }

    fn send_annunciation(&self, path: &str, severity: SeverityLevel, message: &str) {
        match encode_talk(severity, message) {
            Ok(value) => self.send(LogRecord::new(
                &self.topics.talk,
                &make_key(RecordType::Talk, path),
                Some(value),
            )),
            Err(e) => error!("Cannot encode annunciation for {}: {}", path, e),
        }
        *lock(&self.last_annunciation) = Instant::now();
    }
}

struct Timing {
    last_connectivity_check: Instant,
    connected: bool,
}

pub struct ServerModel {
    tree: Arc<AlarmTree>,
    publisher: Arc<LogPublisher>,
    handler: Arc<dyn CommandHandler>,
    topics: Topics,
    idle_timeout: Duration,
    nag_period: Option<Duration>,
    connectivity_check_period: Duration,
    poll_timeout: Duration,
    timing: Mutex<Timing>,
    stop: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ServerModel {
    pub fn new(
        settings: &ServerSettings,
        producer: Arc<dyn TopicProducer>,
        source: Arc<dyn ValueSource>,
        scheduler: Arc<dyn Scheduler>,
        performer: Arc<dyn ActionPerformer>,
        handler: Arc<dyn CommandHandler>,
        initial_states: HashMap<String, ClientState>,
    ) -> Arc<ServerModel> {
        let topics = settings.topics();
        let publisher = Arc::new(LogPublisher::new(producer, topics.clone()));
        let tree = AlarmTree::new(
            &settings.config_name,
            TreeServices {
                publisher: publisher.clone(),
                context: AlarmContext::new(),
                scheduler,
                source,
                performer,
                connection_timeout: settings.connection_timeout(),
            },
            initial_states,
        );
        let now = Instant::now();
        Arc::new(ServerModel {
            tree,
            publisher,
            handler,
            topics,
            idle_timeout: settings.idle_timeout(),
            nag_period: settings.nag_period(),
            connectivity_check_period: settings.connectivity_check_period(),
            poll_timeout: settings.poll_timeout(),
            timing: Mutex::new(Timing {
                last_connectivity_check: now,
                connected: true,
            }),
            stop: CancellationToken::new(),
            thread: Mutex::new(None),
        })
    }

    pub fn tree(&self) -> &Arc<AlarmTree> {
        &self.tree
    }

    pub fn publisher(&self) -> &Arc<LogPublisher> {
        &self.publisher
    }

    /// Start processing records in a thread of its own
    pub fn start(self: &Arc<Self>, consumer: Box<dyn TopicConsumer>) -> DynResult<()> {
        let model = self.clone();
        let span = info_span!("model", config = %self.topics.config);
        let handle = thread::Builder::new()
            .name("ServerModel".to_string())
            .spawn(move || {
                let _entered = span.enter();
                model.run(consumer);
            })?;
        *lock(&self.thread) = Some(handle);
        info!("Alarm server model for '{}' started", self.topics.config);
        self.publisher
            .send_annunciation(self.tree.root().path(), SeverityLevel::Ok, STARTED_MESSAGE);
        Ok(())
    }

    fn run(&self, mut consumer: Box<dyn TopicConsumer>) {
        while !self.stop.is_cancelled() {
            match consumer.poll(self.poll_timeout) {
                Ok(records) => {
                    for record in records {
                        self.handle_record(&record);
                    }
                }
                Err(e) => {
                    debug!("Poll failed: {}", e);
                    // Do not spin while the log is unreachable
                    thread::sleep(self.poll_timeout);
                }
            }
            let now = Instant::now();
            self.check_idle(now);
            self.check_nag(now);
            let check = {
                let mut timing = lock(&self.timing);
                if now.duration_since(timing.last_connectivity_check)
                    >= self.connectivity_check_period
                {
                    timing.last_connectivity_check = now;
                    true
                } else {
                    false
                }
            };
            if check {
                self.check_connectivity(consumer.as_mut());
            }
        }
        debug!("Processing loop ends");
    }

    pub fn handle_record(&self, record: &LogRecord) {
        let (record_type, path) = match parse_key(&record.key) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Ignoring record on {}: {}", record.topic, e);
                return;
            }
        };
        if record.topic == self.topics.command || record_type == RecordType::Command {
            match &record.value {
                Some(json) => self.handler.handle_command(&self.tree, path, json),
                None => debug!("Ignoring empty command for {}", path),
            }
            return;
        }
        match record_type {
            RecordType::Config => self.process_config(path, record.value.as_deref()),
            _ => debug!("Ignoring {}", record.key),
        }
    }

    fn process_config(&self, path: &str, json: Option<&str>) {
        let json = match json {
            Some(json) => json,
            None => {
                debug!("Delete {}", path);
                if let Err(e) = self.tree.delete(path) {
                    warn!("Cannot delete {}: {}", path, e);
                }
                return;
            }
        };
        let config = match parse_config(json) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring config for {}: {}", path, e);
                return;
            }
        };
        let (item, created) = match self.tree.find_or_create(path, config.is_leaf()) {
            Ok(found) => found,
            Err(e) => {
                warn!("Ignoring config for {}: {}", path, e);
                return;
            }
        };
        debug!("{} {}", if created { "Add" } else { "Update" }, path);
        match item {
            AlarmTreeItem::Point(point) => {
                if !created {
                    point.stop();
                }
                point.apply_config(config);
                if let Some(AlarmTreeItem::Node(parent)) = self.tree.get(point.parent_path()) {
                    parent.maximize_severity();
                }
                point.start();
            }
            AlarmTreeItem::Node(node) => {
                if config.is_leaf() {
                    warn!("{} is a node, ignoring point configuration", path);
                }
                node.set_config(config);
            }
        }
    }

    /// Publish the root state when nothing was published for a while
    pub fn check_idle(&self, now: Instant) {
        if now.saturating_duration_since(self.publisher.last_state_update()) > self.idle_timeout {
            debug!("Idle, publishing root state");
            self.tree.send_root_state();
        }
    }

    /// Repeat the number of active alarms when nothing was announced
    /// for a nag period
    pub fn check_nag(&self, now: Instant) {
        let period = match self.nag_period {
            Some(period) => period,
            None => return,
        };
        if now.saturating_duration_since(self.publisher.last_annunciation()) <= period {
            return;
        }
        let active = self.tree.count_active_alarms();
        if active == 0 {
            return;
        }
        let message = if active == 1 {
            "* There is 1 active alarm".to_string()
        } else {
            format!("* There are {} active alarms", active)
        };
        self.publisher.send_annunciation(
            self.tree.root().path(),
            self.tree.root().severity(),
            &message,
        );
    }

    /// Result of the last connectivity check
    pub fn is_connected(&self) -> bool {
        lock(&self.timing).connected
    }

    /// Probe the log. After an outage the complete state is sent again
    /// since whatever was published in between was lost.
    pub fn check_connectivity(&self, consumer: &mut dyn TopicConsumer) -> bool {
        let connected = match consumer.probe(self.poll_timeout) {
            Ok(()) => true,
            Err(e) => {
                debug!("Probe failed: {}", e);
                false
            }
        };
        let was_connected = {
            let mut timing = lock(&self.timing);
            std::mem::replace(&mut timing.connected, connected)
        };
        if was_connected && !connected {
            warn!("Lost connection to the log");
        } else if !was_connected && connected {
            info!("Connection to the log restored, resending state");
            self.tree
                .resend(&AlarmTreeItem::Node(self.tree.root().clone()));
            self.publisher.send_annunciation(
                self.tree.root().path(),
                SeverityLevel::Ok,
                RECONNECTED_MESSAGE,
            );
        }
        connected
    }

    /// Stop processing and release the tree
    pub fn shutdown(&self) {
        self.stop.cancel();
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Processing loop panicked");
            }
        }
        self.tree.shutdown();
        info!("Alarm server model for '{}' stopped", self.topics.config);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::automated_actions::LogActionPerformer;
    use crate::client_model::AlarmClientModel;
    use crate::commands::{AlarmCommands, ServerControl};
    use crate::scheduler::ManualScheduler;
    use crate::topic::memory::MemoryLog;
    use crate::topic::StartFrom;
    use crate::value_source::{LocalValueSource, PvSample};
    use crate::wire::{make_talk, parse_talk, ItemState};
    use test_log::test;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct Fixture {
        log: Arc<MemoryLog>,
        source: Arc<LocalValueSource>,
        model: Arc<ServerModel>,
        _control: UnboundedReceiver<ServerControl>,
    }

    fn settings() -> ServerSettings {
        ServerSettings {
            config_name: "Test".to_string(),
            idle_timeout: 10,
            nag_period: 60,
            connectivity_check_period: 0,
            poll_timeout_ms: 10,
            ..Default::default()
        }
    }

    fn fixture() -> Fixture {
        let log = MemoryLog::new();
        let source = LocalValueSource::new();
        let (tx, rx) = unbounded_channel();
        let model = ServerModel::new(
            &settings(),
            log.clone(),
            source.clone(),
            ManualScheduler::new(),
            Arc::new(LogActionPerformer),
            Arc::new(AlarmCommands::new(tx)),
            HashMap::new(),
        );
        Fixture {
            log,
            source,
            model,
            _control: rx,
        }
    }

    fn config(path: &str, json: Option<&str>) -> LogRecord {
        LogRecord::new("Test", &format!("config:{}", path), json.map(str::to_string))
    }

    fn talk(log: &MemoryLog) -> Vec<String> {
        log.records("TestTalk")
            .iter()
            .filter_map(|r| r.value.as_deref())
            .filter_map(|v| parse_talk(v).ok())
            .map(|t| t.talk)
            .collect()
    }

    fn spoken(message: &str) -> String {
        make_talk(SeverityLevel::Ok, message).talk
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        for _ in 0..500 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_config_records() {
        let f = fixture();
        f.model.handle_record(&config("/Test/Area", Some("{}")));
        f.model.handle_record(&config(
            "/Test/Area/pv1",
            Some(r#"{"description":"Tank pressure"}"#),
        ));
        assert_eq!(f.model.tree().len(), 3);
        let point = f.model.tree().find_pv("pv1").unwrap();
        assert!(point.is_running());
        assert_eq!(point.description(), "Tank pressure");

        f.source
            .set("pv1", PvSample::new(SeverityLevel::Major, "HIHI", "12"));
        assert_eq!(f.model.tree().root().severity(), SeverityLevel::Major);
        assert!(f
            .log
            .records("Test")
            .iter()
            .any(|r| r.key == "state:/Test/Area/pv1" && r.value.is_some()));

        // Update restarts the point with the new settings
        f.model.handle_record(&config(
            "/Test/Area/pv1",
            Some(r#"{"description":"Tank pressure","latching":false}"#),
        ));
        let point = f.model.tree().find_pv("pv1").unwrap();
        assert!(point.is_running());
        assert!(!point.logic().is_latching());

        // Malformed records change nothing
        f.model.handle_record(&config("/Test/Area/pv2", Some("not json")));
        f.model.handle_record(&config("/Other/pv3", Some("{}")));
        f.model
            .handle_record(&LogRecord::new("Test", "bogus", Some("{}".to_string())));
        assert_eq!(f.model.tree().len(), 3);

        f.model.handle_record(&config("/Test/Area", None));
        assert_eq!(f.model.tree().len(), 1);
        assert!(!point.is_running());
        let deleted: Vec<String> = f
            .log
            .records("Test")
            .into_iter()
            .filter(|r| r.value.is_none())
            .map(|r| r.key)
            .collect();
        assert_eq!(deleted, vec!["state:/Test/Area/pv1", "state:/Test/Area"]);
        assert_eq!(f.model.tree().root().severity(), SeverityLevel::Ok);
    }

    #[test]
    fn test_commands() {
        let f = fixture();
        f.model
            .handle_record(&config("/Test/pv1", Some(r#"{"description":"One"}"#)));
        f.source
            .set("pv1", PvSample::new(SeverityLevel::Minor, "LOW", "1"));
        f.model.handle_record(&LogRecord::new(
            "TestCommand",
            "command:/Test",
            Some(r#"{"user":"fred","host":"pc","command":"acknowledge"}"#.to_string()),
        ));
        assert_eq!(
            f.model.tree().find_pv("pv1").unwrap().severity(),
            SeverityLevel::MinorAck
        );
    }

    #[test]
    fn test_idle_and_nag() {
        let f = fixture();
        f.model.handle_record(&config(
            "/Test/pv1",
            Some(r#"{"description":"One","annunciating":false}"#),
        ));
        f.model.handle_record(&config(
            "/Test/pv2",
            Some(r#"{"description":"Two","annunciating":false}"#),
        ));
        let last_update = f.model.publisher().last_state_update();
        let count = f.log.records("Test").len();
        f.model.check_idle(last_update + Duration::from_secs(10));
        assert_eq!(f.log.records("Test").len(), count);
        f.model.check_idle(last_update + Duration::from_secs(11));
        let records = f.log.records("Test");
        assert_eq!(records.len(), count + 1);
        assert_eq!(records[count].key, "state:/Test");

        // No active alarms, nothing to say
        let last_talk = f.model.publisher().last_annunciation();
        f.model.check_nag(last_talk + Duration::from_secs(61));
        assert!(talk(&f.log).is_empty());

        f.source
            .set("pv1", PvSample::new(SeverityLevel::Minor, "LOW", "1"));
        f.model.check_nag(last_talk + Duration::from_secs(60));
        assert!(talk(&f.log).is_empty());
        f.model.check_nag(last_talk + Duration::from_secs(61));
        assert_eq!(talk(&f.log).last().unwrap(), "There is 1 active alarm");

        // Any annunciation holds the next nag back
        f.model
            .publisher()
            .send_annunciation("/Test", SeverityLevel::Minor, "* Shift change");
        let last_talk = f.model.publisher().last_annunciation();
        f.source
            .set("pv2", PvSample::new(SeverityLevel::Major, "HIHI", "1"));
        f.model.check_nag(last_talk + Duration::from_secs(59));
        assert_eq!(talk(&f.log).last().unwrap(), "Shift change");
        assert_eq!(talk(&f.log).len(), 2);
        f.model.check_nag(last_talk + Duration::from_secs(61));
        assert_eq!(talk(&f.log).last().unwrap(), "There are 2 active alarms");
    }

    #[test]
    fn test_connectivity() {
        let f = fixture();
        f.model
            .handle_record(&config("/Test/pv1", Some(r#"{"description":"One"}"#)));
        let mut consumer = f.log.consumer(&[("Test", StartFrom::End)]);
        assert!(f.model.check_connectivity(&mut consumer));

        f.log.set_connected(false);
        assert!(!f.model.check_connectivity(&mut consumer));
        f.source
            .set("pv1", PvSample::new(SeverityLevel::Major, "HIHI", "1"));
        assert!(!f
            .log
            .records("Test")
            .iter()
            .any(|r| r.key == "state:/Test/pv1"));

        let before = f.log.records("Test").len();
        f.log.set_connected(true);
        assert!(f.model.check_connectivity(&mut consumer));
        let records = f.log.records("Test");
        let resent: Vec<&str> = records[before..]
            .iter()
            .filter(|r| r.key.starts_with("state:"))
            .map(|r| r.key.as_str())
            .collect();
        assert_eq!(resent, vec!["state:/Test", "state:/Test/pv1"]);
        assert_eq!(talk(&f.log), vec![spoken(RECONNECTED_MESSAGE)]);
    }

    #[test]
    fn test_client_converges_after_outage() {
        let f = fixture();
        f.log.append(config("/Test/Area", Some("{}")));
        f.log.append(config(
            "/Test/Area/pv1",
            Some(r#"{"description":"Tank pressure"}"#),
        ));
        f.log.append(config(
            "/Test/Area/pv2",
            Some(r#"{"description":"Tank level"}"#),
        ));
        let consumer = f
            .log
            .consumer(&[("Test", StartFrom::Beginning), ("TestCommand", StartFrom::End)]);
        f.model.start(Box::new(consumer)).unwrap();
        assert!(wait_for(|| f.model.tree().find_pv("pv2").is_some()));
        assert_eq!(talk(&f.log), vec![spoken(STARTED_MESSAGE)]);

        f.source
            .set("pv1", PvSample::new(SeverityLevel::Minor, "LOW", "1"));
        f.source.set("pv2", PvSample::value("5"));

        // Changes during the outage are lost
        f.log.set_connected(false);
        assert!(wait_for(|| !f.model.is_connected()));
        f.source
            .set("pv1", PvSample::new(SeverityLevel::Major, "HIHI", "20"));
        f.log.set_connected(true);
        assert!(wait_for(|| talk(&f.log).contains(&spoken(RECONNECTED_MESSAGE))));

        let client = AlarmClientModel::new("Test", Duration::from_secs(10));
        let mut client_consumer = f.log.consumer(&[("Test", StartFrom::Beginning)]);
        client.apply(client_consumer.poll(Duration::ZERO).unwrap());

        let server_point = f.model.tree().find_pv("pv1").unwrap();
        let client_point = client.get("/Test/Area/pv1").unwrap();
        assert_eq!(client_point.severity, server_point.severity());
        assert_eq!(client_point.severity, SeverityLevel::Major);
        assert!(matches!(
            client_point.state,
            Some(ItemState::Point(ref state)) if state.current_message == "HIHI"
        ));
        assert_eq!(client.get("/Test/Area").unwrap().severity, SeverityLevel::Major);
        assert_eq!(client.get("/Test").unwrap().severity, SeverityLevel::Major);
        assert!(client.is_server_alive(Instant::now()));

        f.model.shutdown();
        assert_eq!(f.model.tree().len(), 1);
        assert!(!server_point.is_running());
    }
}
