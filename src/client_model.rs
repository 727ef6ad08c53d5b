//! Mirror of the alarm tree as seen by a client reading the
//! config/state topic.

use crate::severity::SeverityLevel;
use crate::topic::LogRecord;
use crate::tree_path;
use crate::util::error::lock;
use crate::wire::{parse_config, parse_key, parse_state, ItemConfig, ItemState, RecordType};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct ClientItem {
    pub path: String,
    pub config: Option<ItemConfig>,
    pub severity: SeverityLevel,
    pub state: Option<ItemState>,
}

impl ClientItem {
    fn new(path: &str) -> ClientItem {
        ClientItem {
            path: path.to_string(),
            config: None,
            severity: SeverityLevel::Ok,
            state: None,
        }
    }
}

struct ClientMut {
    items: HashMap<String, ClientItem>,
    deleted: HashSet<String>,
    maintenance_mode: bool,
    notify: bool,
    last_state_update: Option<Instant>,
}

pub struct AlarmClientModel {
    root_path: String,
    idle_timeout: Duration,
    inner: Mutex<ClientMut>,
}

impl AlarmClientModel {
    pub fn new(config_name: &str, idle_timeout: Duration) -> AlarmClientModel {
        let root_path = tree_path::make_path(None, config_name);
        let mut items = HashMap::new();
        items.insert(root_path.clone(), ClientItem::new(&root_path));
        AlarmClientModel {
            root_path,
            idle_timeout,
            inner: Mutex::new(ClientMut {
                items,
                deleted: HashSet::new(),
                maintenance_mode: false,
                notify: true,
                last_state_update: None,
            }),
        }
    }

    pub fn get(&self, path: &str) -> Option<ClientItem> {
        lock(&self.inner).items.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn was_deleted(&self, path: &str) -> bool {
        lock(&self.inner).deleted.contains(path)
    }

    pub fn maintenance_mode(&self) -> bool {
        lock(&self.inner).maintenance_mode
    }

    pub fn notify(&self) -> bool {
        lock(&self.inner).notify
    }

    /// The server publishes at least the root state within the idle
    /// timeout, so a long silence means it is gone
    pub fn is_server_alive(&self, now: Instant) -> bool {
        match lock(&self.inner).last_state_update {
            Some(last) => now.saturating_duration_since(last) < self.idle_timeout * 3,
            None => false,
        }
    }

    pub fn apply(&self, records: Vec<LogRecord>) {
        for record in records {
            self.handle_record(&record);
        }
    }

    pub fn handle_record(&self, record: &LogRecord) {
        let (record_type, path) = match parse_key(&record.key) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        if !self.is_under_root(path) {
            debug!("Ignoring {} outside of {}", path, self.root_path);
            return;
        }
        let mut inner = lock(&self.inner);
        match record_type {
            RecordType::Config => match &record.value {
                None => Self::delete(&mut inner, path),
                Some(json) => match parse_config(json) {
                    Ok(config) => {
                        inner.deleted.remove(path);
                        Self::find_or_create(&mut inner, path).config = Some(config);
                    }
                    Err(e) => warn!("Ignoring config for {}: {}", path, e),
                },
            },
            RecordType::State => {
                inner.last_state_update = Some(Instant::now());
                let json = match &record.value {
                    Some(json) => json,
                    None => return,
                };
                if inner.deleted.contains(path) {
                    debug!("Ignoring state of deleted {}", path);
                    return;
                }
                let msg = match parse_state(json) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Ignoring state for {}: {}", path, e);
                        return;
                    }
                };
                if path == self.root_path {
                    if let Some(flags) = msg.flags {
                        inner.maintenance_mode = flags.maintenance_mode;
                        inner.notify = !flags.disable_notify;
                    }
                }
                let item = Self::find_or_create(&mut inner, path);
                item.severity = msg.state.severity();
                item.state = Some(msg.state);
            }
            _ => {}
        }
    }

    fn is_under_root(&self, path: &str) -> bool {
        path == self.root_path
            || path
                .strip_prefix(self.root_path.as_str())
                .map_or(false, |rest| rest.starts_with('/'))
    }

    fn find_or_create<'a>(inner: &'a mut ClientMut, path: &str) -> &'a mut ClientItem {
        let elements = tree_path::split(path);
        for i in 1..elements.len() {
            let parent = tree_path::join(&elements[..i]);
            inner
                .items
                .entry(parent.clone())
                .or_insert_with(|| ClientItem::new(&parent));
        }
        inner
            .items
            .entry(path.to_string())
            .or_insert_with(|| ClientItem::new(path))
    }

    fn delete(inner: &mut ClientMut, path: &str) {
        let below = format!("{}/", path);
        let removed: Vec<String> = inner
            .items
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&below))
            .cloned()
            .collect();
        for p in removed {
            inner.items.remove(&p);
            inner.deleted.insert(p);
        }
        inner.deleted.insert(path.to_string());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alarm_state::{AlarmState, ClientState};
    use crate::wire::{encode_state, GlobalFlags, StateMessage};
    use chrono::Utc;
    use test_log::test;

    fn config(path: &str, json: Option<&str>) -> LogRecord {
        LogRecord::new("Test", &format!("config:{}", path), json.map(str::to_string))
    }

    fn state(path: &str, msg: &StateMessage) -> LogRecord {
        LogRecord::new(
            "Test",
            &format!("state:{}", path),
            Some(encode_state(msg).unwrap()),
        )
    }

    fn point_state(severity: SeverityLevel) -> StateMessage {
        let alarm = AlarmState::new(severity, "HIHI", "3", Utc::now());
        StateMessage {
            state: ItemState::Point(ClientState::new(&alarm, &alarm)),
            flags: None,
        }
    }

    #[test]
    fn test_client_mirror() {
        let client = AlarmClientModel::new("Test", Duration::from_secs(10));
        assert!(!client.is_server_alive(Instant::now()));
        client.apply(vec![
            config("/Test/Area/pv1", Some(r#"{"description":"One"}"#)),
            state("/Test/Area/pv1", &point_state(SeverityLevel::Major)),
            state(
                "/Test/Area",
                &StateMessage {
                    state: ItemState::Node(SeverityLevel::Major),
                    flags: None,
                },
            ),
            state(
                "/Test",
                &StateMessage {
                    state: ItemState::Node(SeverityLevel::Major),
                    flags: Some(GlobalFlags {
                        maintenance_mode: true,
                        disable_notify: true,
                    }),
                },
            ),
            config("/Other/pv2", Some(r#"{"description":"Other"}"#)),
        ]);
        assert_eq!(client.len(), 3);
        let pv1 = client.get("/Test/Area/pv1").unwrap();
        assert_eq!(pv1.severity, SeverityLevel::Major);
        assert_eq!(pv1.config.unwrap().description.as_deref(), Some("One"));
        assert_eq!(client.get("/Test/Area").unwrap().severity, SeverityLevel::Major);
        assert!(client.maintenance_mode());
        assert!(!client.notify());

        let now = Instant::now();
        assert!(client.is_server_alive(now));
        assert!(!client.is_server_alive(now + Duration::from_secs(31)));

        // Late state of a deleted item does not bring it back
        client.apply(vec![
            config("/Test/Area", None),
            state("/Test/Area/pv1", &point_state(SeverityLevel::Minor)),
        ]);
        assert_eq!(client.len(), 1);
        assert!(client.was_deleted("/Test/Area/pv1"));
        assert!(client.get("/Test/Area/pv1").is_none());

        client.apply(vec![config("/Test/Area/pv1", Some(r#"{"description":"One"}"#))]);
        assert!(!client.was_deleted("/Test/Area/pv1"));
        assert_eq!(client.len(), 3);
    }
}
