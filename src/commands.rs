//! Commands received on the command topic.

use crate::alarm_tree::{AlarmTree, AlarmTreeItem, PathError};
use crate::severity::SeverityLevel;
use crate::wire::{parse_command, WireError};
use log::{debug, info, warn};
use std::fmt::{self, Display, Formatter};
use tokio::sync::mpsc::UnboundedSender;

pub const CMD_MAINTENANCE: &str = "maintenance";
pub const CMD_NORMAL: &str = "normal";
pub const CMD_DISABLE_NOTIFY: &str = "disable_notify";
pub const CMD_ENABLE_NOTIFY: &str = "enable_notify";

/// Requests for the process running the model
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServerControl {
    Restart,
    Shutdown,
}

pub trait CommandHandler: Send + Sync {
    fn handle_command(&self, tree: &AlarmTree, path: &str, json: &str);
}

#[derive(Debug)]
pub enum CommandError {
    Wire(WireError),
    Path(PathError),
    UnknownNode(String),
    UnknownPv(String),
    UnknownCommand(String),
    ControlClosed,
}

impl std::error::Error for CommandError {}

impl Display for CommandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            CommandError::Wire(e) => write!(f, "Invalid command: {}", e),
            CommandError::Path(e) => e.fmt(f),
            CommandError::UnknownNode(path) => write!(f, "Unknown alarm tree node '{}'", path),
            CommandError::UnknownPv(name) => write!(f, "Unknown PV '{}'", name),
            CommandError::UnknownCommand(cmd) => write!(f, "Unknown command '{}'", cmd),
            CommandError::ControlClosed => f.write_str("Nobody listens for server control"),
        }
    }
}

impl From<WireError> for CommandError {
    fn from(e: WireError) -> Self {
        CommandError::Wire(e)
    }
}

impl From<PathError> for CommandError {
    fn from(e: PathError) -> Self {
        CommandError::Path(e)
    }
}

/// Which points to list
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PvMode {
    All,
    InActiveAlarm,
    InAlarm,
    Disconnected,
    Disabled,
}

/// Acknowledge, or un-acknowledge, every point below `item`
pub fn acknowledge(tree: &AlarmTree, item: &AlarmTreeItem, acknowledge: bool) {
    for item in tree.subtree(item) {
        if let AlarmTreeItem::Point(point) = item {
            point.acknowledge(acknowledge);
        }
    }
}

/// Entering maintenance mode acknowledges all INVALID and UNDEFINED alarms
pub fn set_maintenance_mode(tree: &AlarmTree, maintenance: bool) {
    if !tree.context().set_maintenance_mode(maintenance) {
        return;
    }
    info!("Maintenance mode: {}", maintenance);
    if maintenance {
        for point in tree.points() {
            if point.severity() >= SeverityLevel::Invalid {
                point.acknowledge(true);
            }
        }
    }
    tree.send_root_state();
}

pub fn set_disable_notify(tree: &AlarmTree, disable: bool) {
    if !tree.context().set_disable_notify(disable) {
        return;
    }
    info!("Disable notify: {}", disable);
    tree.send_root_state();
}

/// One line per matching point below `item`
pub fn list_pvs(tree: &AlarmTree, item: &AlarmTreeItem, mode: PvMode) -> Vec<String> {
    tree.subtree(item)
        .iter()
        .filter_map(AlarmTreeItem::as_point)
        .filter(|point| match mode {
            PvMode::All => true,
            PvMode::Disabled => !point.is_enabled(),
            PvMode::Disconnected => point.is_enabled() && !point.is_connected(),
            PvMode::InActiveAlarm => point.is_enabled() && point.severity().is_active(),
            PvMode::InAlarm => point.is_enabled() && point.severity() != SeverityLevel::Ok,
        })
        .enumerate()
        .map(|(i, point)| format!("{:3} : {}", i + 1, point))
        .collect()
}

/// Indented listing of the tree below `item`
pub fn dump(tree: &AlarmTree, item: &AlarmTreeItem) -> Vec<String> {
    let mut lines = Vec::new();
    dump_item(tree, item, 0, &mut lines);
    lines
}

fn dump_item(tree: &AlarmTree, item: &AlarmTreeItem, level: usize, lines: &mut Vec<String>) {
    let indent = "  ".repeat(level);
    match item {
        AlarmTreeItem::Node(node) => {
            lines.push(format!("{}{} - {}", indent, node.name(), node.severity()));
            for child in tree.children(node) {
                dump_item(tree, &child, level + 1, lines);
            }
        }
        AlarmTreeItem::Point(point) => lines.push(format!("{}{}", indent, point)),
    }
}

/// Handles commands on the tree, passing restart and shutdown on
pub struct AlarmCommands {
    control: UnboundedSender<ServerControl>,
}

impl AlarmCommands {
    pub fn new(control: UnboundedSender<ServerControl>) -> AlarmCommands {
        AlarmCommands { control }
    }

    fn find(tree: &AlarmTree, path: &str) -> Result<AlarmTreeItem, CommandError> {
        tree.find_node(path)?
            .ok_or_else(|| CommandError::UnknownNode(path.to_string()))
    }

    fn print(title: &str, lines: Vec<String>) {
        info!("{}:", title);
        for line in lines {
            info!("{}", line);
        }
    }

    fn send_control(&self, control: ServerControl) -> Result<(), CommandError> {
        self.control
            .send(control)
            .map_err(|_| CommandError::ControlClosed)
    }

    pub fn execute(&self, tree: &AlarmTree, path: &str, command: &str) -> Result<(), CommandError> {
        debug!("Command '{}' for {}", command, path);
        if command.starts_with("ack") {
            acknowledge(tree, &Self::find(tree, path)?, true);
        } else if command.starts_with("unack") {
            acknowledge(tree, &Self::find(tree, path)?, false);
        } else if command == CMD_MAINTENANCE {
            set_maintenance_mode(tree, true);
        } else if command == CMD_NORMAL {
            set_maintenance_mode(tree, false);
        } else if command == CMD_DISABLE_NOTIFY {
            set_disable_notify(tree, true);
        } else if command == CMD_ENABLE_NOTIFY {
            set_disable_notify(tree, false);
        } else if command.eq_ignore_ascii_case("dump") {
            let item = Self::find(tree, path)?;
            Self::print(item.path(), dump(tree, &item));
        } else if command.eq_ignore_ascii_case("pvs") {
            let item = Self::find(tree, path)?;
            Self::print(
                &format!("PVs for {}", item.path()),
                list_pvs(tree, &item, PvMode::All),
            );
        } else if command.eq_ignore_ascii_case("disconnected") {
            let item = Self::find(tree, path)?;
            Self::print(
                &format!("Disconnected PVs for {}", item.path()),
                list_pvs(tree, &item, PvMode::Disconnected),
            );
        } else if command.eq_ignore_ascii_case("pv") {
            let point = tree
                .find_pv(path)
                .ok_or_else(|| CommandError::UnknownPv(path.to_string()))?;
            info!("{}", point);
        } else if command == "shutdown" {
            info!("Shutdown requested");
            self.send_control(ServerControl::Shutdown)?;
        } else if command.eq_ignore_ascii_case("restart") {
            info!("Restart requested");
            self.send_control(ServerControl::Restart)?;
        } else {
            return Err(CommandError::UnknownCommand(command.to_string()));
        }
        Ok(())
    }
}

impl CommandHandler for AlarmCommands {
    fn handle_command(&self, tree: &AlarmTree, path: &str, json: &str) {
        let result = parse_command(json)
            .map_err(CommandError::from)
            .and_then(|msg| {
                if !msg.user.is_empty() {
                    debug!("Command from {}@{}", msg.user, msg.host);
                }
                self.execute(tree, path, &msg.command)
            });
        if let Err(e) = result {
            warn!("Error for command. path: '{}', JSON: '{}': {}", path, json, e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alarm_tree::test_support::{point_config, test_tree};
    use crate::value_source::PvSample;
    use crate::wire::{encode_command, CommandMessage, ItemState, StateMessage};
    use std::collections::HashMap;
    use test_log::test;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_acknowledge_subtree() {
        let t = test_tree(HashMap::new());
        t.add_point("/Test/A/pv1", point_config());
        t.add_point("/Test/A/pv2", point_config());
        t.add_point("/Test/B/pv3", point_config());
        for pv in ["pv1", "pv2", "pv3"] {
            t.source
                .set(pv, PvSample::new(SeverityLevel::Major, "HIHI", "1"));
        }
        let (tx, _rx) = unbounded_channel();
        let commands = AlarmCommands::new(tx);
        let json = encode_command(&CommandMessage {
            user: "fred".to_string(),
            host: "pc".to_string(),
            command: "acknowledge".to_string(),
        })
        .unwrap();
        commands.handle_command(&t.tree, "/Test/A", &json);
        assert_eq!(t.tree.find_pv("pv1").unwrap().severity(), SeverityLevel::MajorAck);
        assert_eq!(t.tree.find_pv("pv2").unwrap().severity(), SeverityLevel::MajorAck);
        assert_eq!(t.tree.find_pv("pv3").unwrap().severity(), SeverityLevel::Major);

        commands.handle_command(&t.tree, "/Test/A/pv1", r#"{"command":"unacknowledge"}"#);
        assert_eq!(t.tree.find_pv("pv1").unwrap().severity(), SeverityLevel::Major);

        // Errors are only logged
        commands.handle_command(&t.tree, "/Test/X", r#"{"command":"acknowledge"}"#);
        commands.handle_command(&t.tree, "/Test", r#"{"command":"bogus"}"#);
        commands.handle_command(&t.tree, "/Test", "not json");
        assert!(matches!(
            commands.execute(&t.tree, "/Test", "bogus"),
            Err(CommandError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_maintenance_mode() {
        let t = test_tree(HashMap::new());
        t.add_point("/Test/pv1", point_config());
        t.add_point("/Test/pv2", point_config());
        t.source
            .set("pv1", PvSample::new(SeverityLevel::Invalid, "COMM", ""));
        t.source
            .set("pv2", PvSample::new(SeverityLevel::Major, "HIHI", "1"));
        let (tx, _rx) = unbounded_channel();
        let commands = AlarmCommands::new(tx);
        commands.execute(&t.tree, "/Test", CMD_MAINTENANCE).unwrap();
        assert!(t.context.maintenance_mode());
        assert_eq!(t.tree.find_pv("pv1").unwrap().severity(), SeverityLevel::InvalidAck);
        assert_eq!(t.tree.find_pv("pv2").unwrap().severity(), SeverityLevel::Major);

        let root_state = t.publisher.published.lock().unwrap().iter().rev().find_map(|p| match p {
            crate::alarm_tree::test_support::Published::State(path, Some(msg)) if path == "/Test" => {
                Some(msg.clone())
            }
            _ => None,
        });
        assert!(matches!(
            root_state,
            Some(StateMessage {
                state: ItemState::Node(SeverityLevel::Major),
                flags: Some(flags)
            }) if flags.maintenance_mode
        ));

        commands.execute(&t.tree, "/Test", CMD_NORMAL).unwrap();
        commands.execute(&t.tree, "/Test", CMD_DISABLE_NOTIFY).unwrap();
        assert!(!t.context.maintenance_mode());
        assert!(t.context.disable_notify());
    }

    #[test]
    fn test_listings() {
        let t = test_tree(HashMap::new());
        t.add_point("/Test/A/pv1", point_config());
        t.add_point("/Test/A/pv2", point_config());
        let pv3 = t.add_point("/Test/pv3", point_config());
        t.source
            .set("pv1", PvSample::new(SeverityLevel::Minor, "LOW", "1"));
        t.source.set("pv3", PvSample::value("0"));
        pv3.set_enabled(false);

        let root = AlarmTreeItem::Node(t.tree.root().clone());
        assert_eq!(list_pvs(&t.tree, &root, PvMode::All).len(), 3);
        let disconnected = list_pvs(&t.tree, &root, PvMode::Disconnected);
        assert_eq!(disconnected.len(), 1);
        assert!(disconnected[0].starts_with("  1 : /Test/A/pv2"));
        assert_eq!(list_pvs(&t.tree, &root, PvMode::InAlarm).len(), 1);
        assert_eq!(list_pvs(&t.tree, &root, PvMode::InActiveAlarm).len(), 1);
        let disabled = list_pvs(&t.tree, &root, PvMode::Disabled);
        assert_eq!(disabled.len(), 1);
        assert!(disabled[0].contains(" - disabled"));

        let lines = dump(&t.tree, &root);
        assert_eq!(lines[0], "Test - MINOR");
        assert_eq!(lines[1], "  A - MINOR");
        assert!(lines[2].starts_with("    /Test/A/pv1"));
    }

    #[test]
    fn test_control() {
        let t = test_tree(HashMap::new());
        let (tx, mut rx) = unbounded_channel();
        let commands = AlarmCommands::new(tx);
        commands.handle_command(&t.tree, "/Test", r#"{"command":"restart"}"#);
        commands.handle_command(&t.tree, "/Test", r#"{"command":"shutdown"}"#);
        assert_eq!(rx.try_recv().ok(), Some(ServerControl::Restart));
        assert_eq!(rx.try_recv().ok(), Some(ServerControl::Shutdown));
        drop(rx);
        assert!(matches!(
            commands.execute(&t.tree, "/Test", "shutdown"),
            Err(CommandError::ControlClosed)
        ));
    }
}
