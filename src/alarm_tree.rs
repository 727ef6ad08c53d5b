//! The alarm tree, kept as an arena of items addressed by path.
//!
//! Nodes own an ordered list of child paths and points know the path
//! of their parent, so no item holds a reference to another item.

use crate::alarm_logic::AlarmContext;
use crate::alarm_node::AlarmNode;
use crate::alarm_point::AlarmPoint;
use crate::alarm_state::ClientState;
use crate::automated_actions::ActionPerformer;
use crate::scheduler::Scheduler;
use crate::severity::SeverityLevel;
use crate::tree_path;
use crate::util::error::lock;
use crate::value_source::ValueSource;
use crate::wire::{GlobalFlags, ItemConfig, ItemState, StateMessage};
use log::debug;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Where items send what they have to say
pub trait StatePublisher: Send + Sync {
    /// `None` deletes the state
    fn send_state_update(&self, path: &str, state: Option<&StateMessage>);

    fn send_config_update(&self, path: &str, config: Option<&ItemConfig>);

    fn send_annunciation(&self, path: &str, severity: SeverityLevel, message: &str);
}

#[derive(Debug, PartialEq)]
pub enum PathError {
    NotUnderRoot(String),
    LeafParent(String),
}

impl std::error::Error for PathError {}

impl Display for PathError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            PathError::NotUnderRoot(path) => {
                write!(f, "Path '{}' is not in this alarm configuration", path)
            }
            PathError::LeafParent(path) => {
                write!(f, "'{}' is an alarm point and can't have children", path)
            }
        }
    }
}

pub trait HasSeverity {
    fn severity(&self) -> SeverityLevel;

    fn is_enabled(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub enum AlarmTreeItem {
    Node(Arc<AlarmNode>),
    Point(Arc<AlarmPoint>),
}

impl AlarmTreeItem {
    pub fn path(&self) -> &str {
        match self {
            AlarmTreeItem::Node(node) => node.path(),
            AlarmTreeItem::Point(point) => point.path(),
        }
    }

    pub fn name(&self) -> String {
        tree_path::name(self.path())
    }

    pub fn as_node(&self) -> Option<&Arc<AlarmNode>> {
        match self {
            AlarmTreeItem::Node(node) => Some(node),
            AlarmTreeItem::Point(_) => None,
        }
    }

    pub fn as_point(&self) -> Option<&Arc<AlarmPoint>> {
        match self {
            AlarmTreeItem::Point(point) => Some(point),
            AlarmTreeItem::Node(_) => None,
        }
    }

    pub fn clear_actions(&self) {
        match self {
            AlarmTreeItem::Node(node) => node.actions().clear(),
            AlarmTreeItem::Point(point) => point.actions().clear(),
        }
    }
}

impl HasSeverity for AlarmTreeItem {
    fn severity(&self) -> SeverityLevel {
        match self {
            AlarmTreeItem::Node(node) => node.severity(),
            AlarmTreeItem::Point(point) => point.severity(),
        }
    }

    fn is_enabled(&self) -> bool {
        match self {
            AlarmTreeItem::Node(node) => node.is_enabled(),
            AlarmTreeItem::Point(point) => point.is_enabled(),
        }
    }
}

/// Everything items need from their surroundings
pub struct TreeServices {
    pub publisher: Arc<dyn StatePublisher>,
    pub context: Arc<AlarmContext>,
    pub scheduler: Arc<dyn Scheduler>,
    pub source: Arc<dyn ValueSource>,
    pub performer: Arc<dyn ActionPerformer>,
    /// Time a started point waits for its first value
    pub connection_timeout: Duration,
}

pub struct AlarmTree {
    services: TreeServices,
    root: Arc<AlarmNode>,
    items: RwLock<HashMap<String, AlarmTreeItem>>,
    /// Last published states, used once when a point is created
    initial_states: Mutex<HashMap<String, ClientState>>,
}

impl AlarmTree {
    pub fn new(
        root_name: &str,
        services: TreeServices,
        initial_states: HashMap<String, ClientState>,
    ) -> Arc<AlarmTree> {
        Arc::new_cyclic(|weak| {
            let root_path = tree_path::make_path(None, root_name);
            let root = AlarmNode::new(weak.clone(), &services, &root_path, None);
            let mut items = HashMap::new();
            items.insert(root_path, AlarmTreeItem::Node(root.clone()));
            AlarmTree {
                services,
                root,
                items: RwLock::new(items),
                initial_states: Mutex::new(initial_states),
            }
        })
    }

    fn read_items(&self) -> RwLockReadGuard<'_, HashMap<String, AlarmTreeItem>> {
        self.items.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_items(&self) -> RwLockWriteGuard<'_, HashMap<String, AlarmTreeItem>> {
        self.items.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn publisher(&self) -> &dyn StatePublisher {
        self.services.publisher.as_ref()
    }

    pub fn context(&self) -> &AlarmContext {
        &self.services.context
    }

    pub fn root(&self) -> &Arc<AlarmNode> {
        &self.root
    }

    pub fn root_name(&self) -> String {
        tree_path::name(self.root.path())
    }

    pub fn len(&self) -> usize {
        self.read_items().len()
    }

    pub fn is_empty(&self) -> bool {
        // The root is always there
        false
    }

    /// Look up an item by its exact path
    pub fn get(&self, path: &str) -> Option<AlarmTreeItem> {
        self.read_items().get(path).cloned()
    }

    /// Children of a node, in configuration order
    pub fn children(&self, node: &AlarmNode) -> Vec<AlarmTreeItem> {
        let paths = node.child_paths();
        let items = self.read_items();
        paths.iter().filter_map(|p| items.get(p).cloned()).collect()
    }

    fn check_path(&self, path: &str) -> Result<Vec<String>, PathError> {
        let elements = tree_path::split(path);
        match elements.first() {
            Some(first) if *first == self.root_name() => Ok(elements),
            _ => Err(PathError::NotUnderRoot(path.to_string())),
        }
    }

    /// Find an existing item. `Ok(None)` if the path is unknown.
    pub fn find_node(&self, path: &str) -> Result<Option<AlarmTreeItem>, PathError> {
        let elements = self.check_path(path)?;
        Ok(self.get(&tree_path::join(&elements)))
    }

    /// Find an item, creating it and any missing parents.
    ///
    /// Returns the item and whether it was created.
    pub fn find_or_create(
        &self,
        path: &str,
        is_leaf: bool,
    ) -> Result<(AlarmTreeItem, bool), PathError> {
        let elements = self.check_path(path)?;
        let mut items = self.write_items();
        let mut parent = self.root.clone();
        for (i, name) in elements.iter().enumerate().skip(1) {
            let last = i == elements.len() - 1;
            let child_path = tree_path::make_path(Some(parent.path()), name);
            let item = match items.get(&child_path) {
                Some(item) => {
                    if last {
                        return Ok((item.clone(), false));
                    }
                    item.clone()
                }
                None => {
                    let item = if last && is_leaf {
                        let initial = lock(&self.initial_states).remove(&child_path);
                        AlarmTreeItem::Point(AlarmPoint::new(
                            self.root.tree(),
                            &self.services,
                            &child_path,
                            parent.path(),
                            initial,
                        ))
                    } else {
                        AlarmTreeItem::Node(AlarmNode::new(
                            self.root.tree(),
                            &self.services,
                            &child_path,
                            Some(parent.path()),
                        ))
                    };
                    debug!("Created {}", child_path);
                    items.insert(child_path.clone(), item.clone());
                    parent.add_child(&child_path);
                    if last {
                        return Ok((item, true));
                    }
                    item
                }
            };
            parent = match item {
                AlarmTreeItem::Node(node) => node,
                AlarmTreeItem::Point(_) => return Err(PathError::LeafParent(child_path)),
            };
        }
        Ok((AlarmTreeItem::Node(parent), false))
    }

    /// Depth-first list of an item and everything below it
    pub fn subtree(&self, start: &AlarmTreeItem) -> Vec<AlarmTreeItem> {
        let mut result = Vec::new();
        let mut stack = vec![start.clone()];
        while let Some(item) = stack.pop() {
            if let AlarmTreeItem::Node(node) = &item {
                let mut children = self.children(node);
                children.reverse();
                stack.extend(children);
            }
            result.push(item);
        }
        result
    }

    pub fn points(&self) -> Vec<Arc<AlarmPoint>> {
        self.subtree(&AlarmTreeItem::Node(self.root.clone()))
            .into_iter()
            .filter_map(|item| match item {
                AlarmTreeItem::Point(point) => Some(point),
                AlarmTreeItem::Node(_) => None,
            })
            .collect()
    }

    /// Find a point by PV name, ignoring case
    pub fn find_pv(&self, name: &str) -> Option<Arc<AlarmPoint>> {
        self.points()
            .into_iter()
            .find(|point| point.name().eq_ignore_ascii_case(name))
    }

    /// Remove an item and everything below it.
    ///
    /// Points are stopped and their states deleted. Deleting a path
    /// this tree never knew is not an error.
    pub fn delete(&self, path: &str) -> Result<Option<AlarmTreeItem>, PathError> {
        let item = match self.find_node(path)? {
            Some(item) => item,
            None => {
                debug!("Ignoring deletion of unknown {}", path);
                return Ok(None);
            }
        };
        let removed = self.subtree(&item);
        let parent = {
            let mut items = self.write_items();
            for r in &removed {
                if r.path() != self.root.path() {
                    items.remove(r.path());
                }
            }
            match &item {
                AlarmTreeItem::Node(node) if node.path() == self.root.path() => {
                    node.clear_children();
                    None
                }
                _ => tree_path::parent(item.path())
                    .and_then(|p| items.get(&p).cloned())
                    .and_then(|p| p.as_node().cloned()),
            }
        };
        if let Some(parent) = &parent {
            parent.remove_child(item.path());
        }
        for r in &removed {
            r.clear_actions();
            if let AlarmTreeItem::Point(point) = r {
                point.detach();
                point.stop();
                self.publisher().send_state_update(point.path(), None);
            }
        }
        if item.as_node().is_some() && item.path() != self.root.path() {
            self.publisher().send_state_update(item.path(), None);
        }
        match parent {
            Some(parent) => parent.maximize_severity(),
            None => self.root.maximize_severity(),
        }
        Ok(Some(item))
    }

    /// Flags carried by the root's state
    pub fn flags(&self) -> GlobalFlags {
        GlobalFlags {
            maintenance_mode: self.services.context.maintenance_mode(),
            disable_notify: self.services.context.disable_notify(),
        }
    }

    pub fn state_message(&self, item: &AlarmTreeItem) -> StateMessage {
        match item {
            AlarmTreeItem::Node(node) => StateMessage {
                state: ItemState::Node(node.severity()),
                flags: if node.is_root() {
                    Some(self.flags())
                } else {
                    None
                },
            },
            AlarmTreeItem::Point(point) => StateMessage {
                state: ItemState::Point(point.client_state()),
                flags: None,
            },
        }
    }

    pub fn send_root_state(&self) {
        let root = AlarmTreeItem::Node(self.root.clone());
        self.publisher()
            .send_state_update(self.root.path(), Some(&self.state_message(&root)));
    }

    /// Publish the state of every item below `start`, parents first
    pub fn resend(&self, start: &AlarmTreeItem) {
        for item in self.subtree(start) {
            self.publisher()
                .send_state_update(item.path(), Some(&self.state_message(&item)));
        }
    }

    /// Enabled points with an active alarm
    pub fn count_active_alarms(&self) -> usize {
        self.points()
            .iter()
            .filter(|p| p.is_enabled() && p.severity().is_active())
            .count()
    }

    /// Stop all points and drop the configuration, leaving the root
    pub fn shutdown(&self) {
        let root = AlarmTreeItem::Node(self.root.clone());
        for item in self.subtree(&root) {
            item.clear_actions();
            if let AlarmTreeItem::Point(point) = &item {
                point.stop();
                point.detach();
            }
        }
        {
            let mut items = self.write_items();
            items.retain(|path, _| path == self.root.path());
        }
        self.root.clear_children();
        self.root.maximize_severity();
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::alarm_logic::AlarmContext;
    use crate::automated_actions::LogActionPerformer;
    use crate::scheduler::ManualScheduler;
    use crate::value_source::LocalValueSource;
    use crate::wire::ItemState;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Published {
        State(String, Option<StateMessage>),
        Config(String, Option<ItemConfig>),
        Talk(String, SeverityLevel, String),
    }

    #[derive(Default)]
    pub struct RecordingPublisher {
        pub published: Mutex<Vec<Published>>,
    }

    impl StatePublisher for RecordingPublisher {
        fn send_state_update(&self, path: &str, state: Option<&StateMessage>) {
            self.published
                .lock()
                .unwrap()
                .push(Published::State(path.to_string(), state.cloned()));
        }

        fn send_config_update(&self, path: &str, config: Option<&ItemConfig>) {
            self.published
                .lock()
                .unwrap()
                .push(Published::Config(path.to_string(), config.cloned()));
        }

        fn send_annunciation(&self, path: &str, severity: SeverityLevel, message: &str) {
            self.published.lock().unwrap().push(Published::Talk(
                path.to_string(),
                severity,
                message.to_string(),
            ));
        }
    }

    impl RecordingPublisher {
        /// Severity of the last published state for the path
        pub fn last_severity(&self, path: &str) -> Option<SeverityLevel> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find_map(|p| match p {
                    Published::State(p, Some(msg)) if p == path => Some(msg.state.severity()),
                    _ => None,
                })
        }

        pub fn talk(&self) -> Vec<String> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .filter_map(|p| match p {
                    Published::Talk(_, _, text) => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn deleted_states(&self) -> Vec<String> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .filter_map(|p| match p {
                    Published::State(path, None) => Some(path.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn point_state(&self, path: &str) -> Option<ClientState> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find_map(|p| match p {
                    Published::State(p, Some(msg)) if p == path => match &msg.state {
                        ItemState::Point(state) => Some(state.clone()),
                        ItemState::Node(_) => None,
                    },
                    _ => None,
                })
        }
    }

    pub struct TestTree {
        pub tree: Arc<AlarmTree>,
        pub publisher: Arc<RecordingPublisher>,
        pub source: Arc<LocalValueSource>,
        pub scheduler: Arc<ManualScheduler>,
        pub context: Arc<AlarmContext>,
    }

    pub fn test_tree(initial_states: HashMap<String, ClientState>) -> TestTree {
        let publisher = Arc::new(RecordingPublisher::default());
        let source = LocalValueSource::new();
        let scheduler = ManualScheduler::new();
        let context = AlarmContext::new();
        let tree = AlarmTree::new(
            "Test",
            TreeServices {
                publisher: publisher.clone(),
                context: context.clone(),
                scheduler: scheduler.clone(),
                source: source.clone(),
                performer: Arc::new(LogActionPerformer),
                connection_timeout: Duration::from_secs(30),
            },
            initial_states,
        );
        TestTree {
            tree,
            publisher,
            source,
            scheduler,
            context,
        }
    }

    impl TestTree {
        /// Create and start a point with the given configuration
        pub fn add_point(&self, path: &str, config: ItemConfig) -> Arc<AlarmPoint> {
            let (item, _) = self.tree.find_or_create(path, true).unwrap();
            let point = item.as_point().unwrap().clone();
            point.apply_config(config);
            if let Some(AlarmTreeItem::Node(parent)) = self.tree.get(point.parent_path()) {
                parent.maximize_severity();
            }
            point.start();
            point
        }
    }

    pub fn point_config() -> ItemConfig {
        ItemConfig {
            description: Some("Test point".to_string()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_support::*;
    use super::*;
    use crate::value_source::PvSample;
    use test_log::test;

    #[test]
    fn test_find_or_create() {
        let t = test_tree(HashMap::new());
        let (item, created) = t.tree.find_or_create("/Test/A/B/pv1", true).unwrap();
        assert!(created);
        assert!(item.as_point().is_some());
        assert!(t.tree.get("/Test/A").and_then(|i| i.as_node().cloned()).is_some());
        assert_eq!(t.tree.len(), 4);

        let (_, created) = t.tree.find_or_create("/Test/A/B/pv1", true).unwrap();
        assert!(!created);

        assert_eq!(
            t.tree.find_node("/Other/A").err(),
            Some(PathError::NotUnderRoot("/Other/A".to_string()))
        );
        assert!(t.tree.find_node("/Test/X").unwrap().is_none());
        assert!(matches!(
            t.tree.find_or_create("/Test/A/B/pv1/child", false),
            Err(PathError::LeafParent(_))
        ));
        assert!(t.tree.find_pv("PV1").is_some());
    }

    #[test]
    fn test_severity_percolates() {
        let t = test_tree(HashMap::new());
        let pv1 = t.add_point("/Test/A/B/pv1", point_config());
        t.add_point("/Test/A/B/pv2", point_config());
        t.source
            .set("pv1", PvSample::new(SeverityLevel::Major, "HIHI", "10"));
        t.source.set("pv2", PvSample::value("1"));

        let b = t.tree.get("/Test/A/B").unwrap();
        let a = t.tree.get("/Test/A").unwrap();
        assert_eq!(b.severity(), SeverityLevel::Major);
        assert_eq!(a.severity(), SeverityLevel::Major);
        assert_eq!(t.tree.root().severity(), SeverityLevel::Major);
        assert_eq!(
            t.publisher.last_severity("/Test/A"),
            Some(SeverityLevel::Major)
        );

        // Disabling the alarming point clears the whole branch
        pv1.set_enabled(false);
        assert_eq!(b.severity(), SeverityLevel::Ok);
        assert_eq!(a.severity(), SeverityLevel::Ok);

        // Recomputing gives the same result
        b.as_node().unwrap().maximize_severity();
        assert_eq!(a.severity(), SeverityLevel::Ok);
        assert_eq!(t.tree.count_active_alarms(), 0);
    }

    #[test]
    fn test_delete_subtree() {
        let t = test_tree(HashMap::new());
        t.add_point("/Test/A/pv1", point_config());
        t.add_point("/Test/A/pv2", point_config());
        t.add_point("/Test/B/pv3", point_config());
        t.source
            .set("pv1", PvSample::new(SeverityLevel::Minor, "LOW", "1"));
        assert_eq!(t.tree.root().severity(), SeverityLevel::Minor);

        assert!(t.tree.delete("/Test/A").unwrap().is_some());
        assert!(t.tree.get("/Test/A/pv1").is_none());
        assert_eq!(t.source.subscriber_count("pv1"), 0);
        let deleted = t.publisher.deleted_states();
        assert!(deleted.contains(&"/Test/A/pv1".to_string()));
        assert!(deleted.contains(&"/Test/A/pv2".to_string()));
        assert!(deleted.contains(&"/Test/A".to_string()));
        assert_eq!(t.tree.root().severity(), SeverityLevel::Ok);

        // Updates for the deleted point go nowhere
        let published = t.publisher.published.lock().unwrap().len();
        t.source
            .set("pv1", PvSample::new(SeverityLevel::Major, "HIHI", "1"));
        assert_eq!(t.publisher.published.lock().unwrap().len(), published);

        assert!(t.tree.delete("/Test/Unknown").unwrap().is_none());
        assert_eq!(t.tree.points().len(), 1);
    }

    #[test]
    fn test_resend_and_shutdown() {
        let t = test_tree(HashMap::new());
        t.add_point("/Test/A/pv1", point_config());
        t.publisher.published.lock().unwrap().clear();
        t.tree.resend(&AlarmTreeItem::Node(t.tree.root().clone()));
        let paths: Vec<String> = t
            .publisher
            .published
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| match p {
                Published::State(path, Some(_)) => Some(path.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(paths, vec!["/Test", "/Test/A", "/Test/A/pv1"]);

        t.tree.shutdown();
        assert_eq!(t.tree.len(), 1);
        assert!(t.tree.root().child_paths().is_empty());
        assert_eq!(t.source.subscriber_count("pv1"), 0);
    }
}
