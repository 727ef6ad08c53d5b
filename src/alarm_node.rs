use crate::alarm_tree::{AlarmTree, AlarmTreeItem, HasSeverity, TreeServices};
use crate::automated_actions::{severity_pvs, AutomatedActions};
use crate::severity::SeverityLevel;
use crate::tree_path;
use crate::util::error::lock;
use crate::value_source::ValueSource;
use crate::wire::{ItemConfig, ItemState, StateMessage};
use log::{debug, warn};
use std::sync::{Arc, Mutex, Weak};

/// Internal node of the alarm tree.
///
/// The severity of a node is derived from its children and only
/// changes through [`AlarmNode::maximize_severity`].
pub struct AlarmNode {
    path: String,
    parent: Option<String>,
    tree: Weak<AlarmTree>,
    source: Arc<dyn ValueSource>,
    config: Mutex<ItemConfig>,
    children: Mutex<Vec<String>>,
    // None until first computed
    severity: Mutex<Option<SeverityLevel>>,
    actions: Arc<AutomatedActions>,
}

impl AlarmNode {
    pub fn new(
        tree: Weak<AlarmTree>,
        services: &TreeServices,
        path: &str,
        parent: Option<&str>,
    ) -> Arc<AlarmNode> {
        Arc::new(AlarmNode {
            path: path.to_string(),
            parent: parent.map(str::to_string),
            tree,
            source: services.source.clone(),
            config: Mutex::new(ItemConfig::default()),
            children: Mutex::new(Vec::new()),
            severity: Mutex::new(None),
            actions: AutomatedActions::new(
                path,
                services.scheduler.clone(),
                services.performer.clone(),
                services.context.clone(),
            ),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> String {
        tree_path::name(&self.path)
    }

    pub fn parent_path(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub(crate) fn tree(&self) -> Weak<AlarmTree> {
        self.tree.clone()
    }

    pub fn config(&self) -> ItemConfig {
        lock(&self.config).clone()
    }

    /// Returns true if the configuration changed
    pub fn set_config(&self, config: ItemConfig) -> bool {
        let mut current = lock(&self.config);
        if *current == config {
            return false;
        }
        if current.actions != config.actions {
            self.actions.configure(&config.actions, self.severity());
        }
        *current = config;
        true
    }

    pub fn actions(&self) -> &Arc<AutomatedActions> {
        &self.actions
    }

    pub fn child_paths(&self) -> Vec<String> {
        lock(&self.children).clone()
    }

    pub(crate) fn add_child(&self, path: &str) {
        let mut children = lock(&self.children);
        if !children.iter().any(|c| c == path) {
            children.push(path.to_string());
        }
    }

    pub(crate) fn remove_child(&self, path: &str) {
        lock(&self.children).retain(|c| c != path);
    }

    pub(crate) fn clear_children(&self) {
        lock(&self.children).clear();
    }

    pub fn severity(&self) -> SeverityLevel {
        lock(&self.severity).unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        true
    }

    /// Recompute the severity from the enabled children.
    ///
    /// On a change the new severity is published and the parent is
    /// recomputed in turn, up to the root.
    pub fn maximize_severity(&self) {
        let tree = match self.tree.upgrade() {
            Some(tree) => tree,
            None => return,
        };
        let new_severity = {
            let mut severity = lock(&self.severity);
            let computed = tree
                .children(self)
                .iter()
                .filter(|child| child.is_enabled())
                .map(|child| child.severity())
                .max()
                .unwrap_or(SeverityLevel::Ok);
            if *severity == Some(computed) {
                return;
            }
            *severity = Some(computed);
            debug!("{} changes to {}", self.path, computed);
            let msg = StateMessage {
                state: ItemState::Node(computed),
                flags: if self.is_root() {
                    Some(tree.flags())
                } else {
                    None
                },
            };
            tree.publisher().send_state_update(&self.path, Some(&msg));
            computed
        };
        self.actions.handle_severity_update(new_severity);
        self.write_severity_pvs(new_severity);

        if let Some(parent) = &self.parent {
            if let Some(AlarmTreeItem::Node(parent)) = tree.get(parent) {
                parent.maximize_severity();
            }
        }
    }

    fn write_severity_pvs(&self, severity: SeverityLevel) {
        let pvs = severity_pvs(&lock(&self.config).actions);
        let value = (severity as u8).to_string();
        for pv in pvs {
            if let Err(e) = self.source.write(&pv, &value) {
                warn!("{}: {}", self.path, e);
            }
        }
    }
}

impl HasSeverity for AlarmNode {
    fn severity(&self) -> SeverityLevel {
        AlarmNode::severity(self)
    }
}

#[cfg(test)]
use test_log::test;

#[test]
fn test_node_maximize() {
    use crate::alarm_tree::test_support::{point_config, test_tree};
    use crate::value_source::PvSample;
    use std::collections::HashMap;

    let t = test_tree(HashMap::new());
    t.add_point("/Test/A/B/pv1", point_config());
    t.add_point("/Test/A/B/pv2", point_config());
    t.add_point("/Test/A/pv3", point_config());
    let b = t.tree.get("/Test/A/B").unwrap();
    let a = t.tree.get("/Test/A").unwrap();

    // Acknowledged alarms rank below active ones
    t.source
        .set("pv3", PvSample::new(SeverityLevel::Invalid, "COMM", "0"));
    t.tree.find_pv("pv3").unwrap().acknowledge(true);
    t.source
        .set("pv1", PvSample::new(SeverityLevel::Minor, "LOW", "1"));
    assert_eq!(b.severity(), SeverityLevel::Minor);
    assert_eq!(a.severity(), SeverityLevel::Minor);

    // Order of recomputation does not matter
    t.source
        .set("pv2", PvSample::new(SeverityLevel::Major, "HIHI", "9"));
    a.as_node().unwrap().maximize_severity();
    b.as_node().unwrap().maximize_severity();
    assert_eq!(a.severity(), SeverityLevel::Major);
    assert_eq!(
        t.publisher.last_severity("/Test"),
        Some(SeverityLevel::Major)
    );
}

#[test]
fn test_maximize_ignores_child_order() {
    use crate::alarm_tree::test_support::{point_config, test_tree};
    use crate::value_source::PvSample;
    use std::collections::HashMap;

    // (name, severity received, acknowledged)
    let child_sets = [
        [
            ("pv1", SeverityLevel::Minor, false),
            ("pv2", SeverityLevel::Invalid, true),
            ("pv3", SeverityLevel::Ok, false),
        ],
        [
            ("pv1", SeverityLevel::Major, true),
            ("pv2", SeverityLevel::Undefined, true),
            ("pv3", SeverityLevel::Minor, true),
        ],
        [
            ("pv1", SeverityLevel::Major, false),
            ("pv2", SeverityLevel::Invalid, false),
            ("pv3", SeverityLevel::Undefined, true),
        ],
    ];
    let permutations = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    for children in &child_sets {
        let mut expected = None;
        for order in &permutations {
            let t = test_tree(HashMap::new());
            for &i in order {
                let (name, severity, acknowledged) = children[i];
                let point = t.add_point(&format!("/Test/Area/{}", name), point_config());
                t.source.set(name, PvSample::new(severity, "", "1"));
                if acknowledged {
                    point.acknowledge(true);
                }
            }
            let area = t.tree.get("/Test/Area").unwrap();
            let max = t
                .tree
                .points()
                .iter()
                .map(|p| p.severity())
                .max()
                .unwrap();
            assert_eq!(area.severity(), max, "order {:?}", order);
            match expected {
                None => expected = Some(max),
                Some(first) => assert_eq!(max, first, "order {:?}", order),
            }
        }
    }
}

#[test]
fn test_severity_pv() {
    use crate::alarm_state::TitleDetailDelay;
    use crate::alarm_tree::test_support::{point_config, test_tree};
    use crate::value_source::PvSample;
    use std::collections::HashMap;

    let t = test_tree(HashMap::new());
    let (area, _) = t.tree.find_or_create("/Test/Area", false).unwrap();
    area.as_node().unwrap().set_config(ItemConfig {
        actions: vec![TitleDetailDelay {
            title: "Area severity".to_string(),
            details: "sevrpv:area_sevr".to_string(),
            delay: 0,
        }],
        ..Default::default()
    });
    t.add_point("/Test/Area/pv1", point_config());
    t.source
        .set("pv1", PvSample::new(SeverityLevel::Major, "HIHI", "1"));
    assert_eq!(
        t.source.last("area_sevr").map(|s| s.value),
        Some((SeverityLevel::Major as u8).to_string())
    );
}
