//! JSON messages exchanged through the alarm topics.
//!
//! Records are keyed `<type>:<path>`. The compacted config topic holds
//! both `config:` and `state:` records, commands and annunciations go
//! to their own topics.

use crate::alarm_state::{AlarmState, ClientState, EnabledState, TitleDetail, TitleDetailDelay};
use crate::severity::SeverityLevel;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

pub const CONFIG_PREFIX: &str = "config";
pub const STATE_PREFIX: &str = "state";
pub const COMMAND_PREFIX: &str = "command";
pub const TALK_PREFIX: &str = "talk";

const MODE_MAINTENANCE: &str = "maintenance";
const MODE_NORMAL: &str = "normal";

#[derive(Debug)]
pub enum WireError {
    Json(serde_json::Error),
    MissingKeyType(String),
    UnknownKeyType(String),
    InvalidTime(i64, u32),
    InvalidDate(String),
}

impl std::error::Error for WireError {}

impl Display for WireError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            WireError::Json(e) => write!(f, "Invalid JSON: {}", e),
            WireError::MissingKeyType(key) => write!(f, "Key '{}' has no type prefix", key),
            WireError::UnknownKeyType(key) => write!(f, "Key '{}' has an unknown type", key),
            WireError::InvalidTime(secs, nano) => {
                write!(f, "Time {}.{:09} is out of range", secs, nano)
            }
            WireError::InvalidDate(date) => write!(f, "Can't parse date '{}'", date),
        }
    }
}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        WireError::Json(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordType {
    Config,
    State,
    Command,
    Talk,
}

impl RecordType {
    pub fn prefix(&self) -> &'static str {
        match self {
            RecordType::Config => CONFIG_PREFIX,
            RecordType::State => STATE_PREFIX,
            RecordType::Command => COMMAND_PREFIX,
            RecordType::Talk => TALK_PREFIX,
        }
    }
}

pub fn make_key(record_type: RecordType, path: &str) -> String {
    format!("{}:{}", record_type.prefix(), path)
}

/// Split `type:path`. Only the first colon separates, paths may contain more.
pub fn parse_key(key: &str) -> Result<(RecordType, &str), WireError> {
    let (prefix, path) = key
        .split_once(':')
        .ok_or_else(|| WireError::MissingKeyType(key.to_string()))?;
    let record_type = match prefix {
        CONFIG_PREFIX => RecordType::Config,
        STATE_PREFIX => RecordType::State,
        COMMAND_PREFIX => RecordType::Command,
        TALK_PREFIX => RecordType::Talk,
        _ => return Err(WireError::UnknownKeyType(key.to_string())),
    };
    Ok((record_type, path))
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_true(b: &bool) -> bool {
    *b
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug)]
struct TimeJson {
    seconds: i64,
    nano: u32,
}

impl From<&DateTime<Utc>> for TimeJson {
    fn from(time: &DateTime<Utc>) -> Self {
        TimeJson {
            seconds: time.timestamp(),
            nano: time.timestamp_subsec_nanos(),
        }
    }
}

impl TimeJson {
    fn to_date_time(&self) -> Result<DateTime<Utc>, WireError> {
        Utc.timestamp_opt(self.seconds, self.nano)
            .single()
            .ok_or(WireError::InvalidTime(self.seconds, self.nano))
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StateJson {
    severity: SeverityLevel,
    #[serde(default, skip_serializing_if = "is_false")]
    latch: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<TimeJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_severity: Option<SeverityLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    notify: Option<bool>,
}

/// Process wide flags, only carried by the root's state
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GlobalFlags {
    pub maintenance_mode: bool,
    pub disable_notify: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemState {
    /// Aggregated severity of an internal node
    Node(SeverityLevel),
    Point(ClientState),
}

impl ItemState {
    pub fn severity(&self) -> SeverityLevel {
        match self {
            ItemState::Node(severity) => *severity,
            ItemState::Point(state) => state.alarm.severity,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateMessage {
    pub state: ItemState,
    pub flags: Option<GlobalFlags>,
}

pub fn encode_state(msg: &StateMessage) -> Result<String, WireError> {
    let mut json = match &msg.state {
        ItemState::Node(severity) => StateJson {
            severity: *severity,
            latch: false,
            message: None,
            value: None,
            time: None,
            current_severity: None,
            current_message: None,
            mode: None,
            notify: None,
        },
        ItemState::Point(state) => StateJson {
            severity: state.alarm.severity,
            latch: state.alarm.latched,
            message: Some(state.alarm.message.clone()),
            value: Some(state.alarm.value.clone()),
            time: Some(TimeJson::from(&state.alarm.time)),
            current_severity: Some(state.current_severity),
            current_message: Some(state.current_message.clone()),
            mode: None,
            notify: None,
        },
    };
    if let Some(flags) = &msg.flags {
        json.mode = Some(
            if flags.maintenance_mode {
                MODE_MAINTENANCE
            } else {
                MODE_NORMAL
            }
            .to_string(),
        );
        json.notify = Some(!flags.disable_notify);
    }
    Ok(serde_json::to_string(&json)?)
}

pub fn parse_state(text: &str) -> Result<StateMessage, WireError> {
    let json: StateJson = serde_json::from_str(text)?;
    let flags = if json.mode.is_some() || json.notify.is_some() {
        Some(GlobalFlags {
            maintenance_mode: json.mode.as_deref() == Some(MODE_MAINTENANCE),
            disable_notify: json.notify == Some(false),
        })
    } else {
        None
    };
    let state = match json.current_severity {
        None => ItemState::Node(json.severity),
        Some(current_severity) => {
            let time = match &json.time {
                Some(time) => time.to_date_time()?,
                None => Utc::now(),
            };
            let alarm = AlarmState::new(
                json.severity,
                json.message.as_deref().unwrap_or(""),
                json.value.as_deref().unwrap_or(""),
                time,
            )
            .with_latch(json.latch);
            ItemState::Point(ClientState {
                alarm,
                current_severity,
                current_message: json.current_message.unwrap_or_default(),
            })
        }
    };
    Ok(StateMessage { state, flags })
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(untagged)]
enum EnabledJson {
    Flag(bool),
    Date(String),
}

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn parse_date(date: &str) -> Result<DateTime<Utc>, WireError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(date) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(date, DATE_FORMAT)
        .map(|t| Utc.from_utc_datetime(&t))
        .map_err(|_| WireError::InvalidDate(date.to_string()))
}

#[derive(Serialize, Deserialize, Debug)]
struct ConfigJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_severity: Option<SeverityLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enabled: Option<EnabledJson>,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    latching: bool,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    annunciating: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    delay: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    guidance: Vec<TitleDetail>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    displays: Vec<TitleDetail>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    commands: Vec<TitleDetail>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    actions: Vec<TitleDetailDelay>,
}

/// Configuration of a node or point.
///
/// Points are recognized by having a description. The point-only
/// fields keep their defaults for nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemConfig {
    pub user: Option<String>,
    pub host: Option<String>,
    pub description: Option<String>,
    pub enabled: EnabledState,
    pub latching: bool,
    pub annunciating: bool,
    pub delay: u32,
    pub count: u32,
    pub filter: Option<String>,
    pub guidance: Vec<TitleDetail>,
    pub displays: Vec<TitleDetail>,
    pub commands: Vec<TitleDetail>,
    pub actions: Vec<TitleDetailDelay>,
}

impl Default for ItemConfig {
    fn default() -> Self {
        ItemConfig {
            user: None,
            host: None,
            description: None,
            enabled: EnabledState::enabled(),
            latching: true,
            annunciating: true,
            delay: 0,
            count: 0,
            filter: None,
            guidance: Vec::new(),
            displays: Vec::new(),
            commands: Vec::new(),
            actions: Vec::new(),
        }
    }
}

impl ItemConfig {
    pub fn is_leaf(&self) -> bool {
        self.description.is_some()
    }
}

pub fn parse_config(text: &str) -> Result<ItemConfig, WireError> {
    let json: ConfigJson = serde_json::from_str(text)?;
    let enabled = match json.enabled {
        None | Some(EnabledJson::Flag(true)) => EnabledState::enabled(),
        Some(EnabledJson::Flag(false)) => EnabledState::disabled(),
        Some(EnabledJson::Date(date)) => EnabledState::disabled_until(parse_date(&date)?),
    };
    // A point config copied from a state record has no description
    let description = match (json.description, json.current_severity) {
        (None, Some(_)) => Some(String::new()),
        (description, _) => description,
    };
    Ok(ItemConfig {
        user: json.user,
        host: json.host,
        description,
        enabled,
        latching: json.latching,
        annunciating: json.annunciating,
        delay: json.delay,
        count: json.count,
        filter: json.filter.filter(|f| !f.trim().is_empty()),
        guidance: json.guidance,
        displays: json.displays,
        commands: json.commands,
        actions: json.actions,
    })
}

pub fn encode_config(config: &ItemConfig) -> Result<String, WireError> {
    let leaf = config.is_leaf();
    let enabled = match config.enabled {
        EnabledState { enabled: true, .. } => None,
        EnabledState {
            enabled_date: Some(date),
            ..
        } => Some(EnabledJson::Date(date.to_rfc3339())),
        EnabledState { .. } => Some(EnabledJson::Flag(false)),
    };
    let json = ConfigJson {
        user: config.user.clone(),
        host: config.host.clone(),
        description: config.description.clone(),
        current_severity: None,
        enabled: if leaf { enabled } else { None },
        latching: !leaf || config.latching,
        annunciating: !leaf || config.annunciating,
        delay: if leaf { config.delay } else { 0 },
        count: if leaf { config.count } else { 0 },
        filter: if leaf { config.filter.clone() } else { None },
        guidance: config.guidance.clone(),
        displays: config.displays.clone(),
        commands: config.commands.clone(),
        actions: config.actions.clone(),
    };
    Ok(serde_json::to_string(&json)?)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandMessage {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub host: String,
    pub command: String,
}

pub fn parse_command(text: &str) -> Result<CommandMessage, WireError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_command(msg: &CommandMessage) -> Result<String, WireError> {
    Ok(serde_json::to_string(msg)?)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TalkMessage {
    pub severity: SeverityLevel,
    #[serde(default)]
    pub standout: bool,
    pub talk: String,
}

/// Build an annunciation.
///
/// `*text` is spoken as is, `!text` is spoken as is and marked as
/// standout. Anything else gets the severity prepended.
pub fn make_talk(severity: SeverityLevel, message: &str) -> TalkMessage {
    if let Some(text) = message.strip_prefix('*') {
        TalkMessage {
            severity,
            standout: false,
            talk: text.trim_start().to_string(),
        }
    } else if let Some(text) = message.strip_prefix('!') {
        TalkMessage {
            severity,
            standout: true,
            talk: text.trim_start().to_string(),
        }
    } else {
        TalkMessage {
            severity,
            standout: false,
            talk: format!("{} Alarm: {}", severity, message),
        }
    }
}

pub fn encode_talk(severity: SeverityLevel, message: &str) -> Result<String, WireError> {
    Ok(serde_json::to_string(&make_talk(severity, message))?)
}

pub fn parse_talk(text: &str) -> Result<TalkMessage, WireError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
use test_log::test;

#[test]
fn test_parse_key() {
    let (t, path) = parse_key("config:/Acc/Vac/sim://ramp").unwrap();
    assert_eq!(t, RecordType::Config);
    assert_eq!(path, "/Acc/Vac/sim://ramp");
    assert!(matches!(parse_key("/Acc"), Err(WireError::MissingKeyType(_))));
    assert!(matches!(parse_key("other:/Acc"), Err(WireError::UnknownKeyType(_))));
    assert_eq!(make_key(RecordType::Talk, "/Acc"), "talk:/Acc");
}

#[test]
fn test_point_state_round_trip() {
    let time = Utc.timestamp_opt(1_700_000_000, 123_456_789).single().unwrap();
    let alarm = AlarmState::new(SeverityLevel::MajorAck, "HIHI", "42.1", time).with_latch(true);
    let current = AlarmState::new(SeverityLevel::Minor, "HIGH", "42.1", time);
    let msg = StateMessage {
        state: ItemState::Point(ClientState::new(&alarm, &current)),
        flags: None,
    };
    let text = encode_state(&msg).unwrap();
    assert!(!text.contains("mode"));
    assert!(text.contains("\"latch\":true"));
    assert_eq!(parse_state(&text).unwrap(), msg);
}

#[test]
fn test_root_state_flags() {
    let msg = StateMessage {
        state: ItemState::Node(SeverityLevel::Invalid),
        flags: Some(GlobalFlags {
            maintenance_mode: true,
            disable_notify: true,
        }),
    };
    let text = encode_state(&msg).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["mode"], "maintenance");
    assert_eq!(json["notify"], false);
    assert_eq!(parse_state(&text).unwrap(), msg);

    let plain = parse_state("{\"severity\":\"MINOR\"}").unwrap();
    assert_eq!(plain.state, ItemState::Node(SeverityLevel::Minor));
    assert_eq!(plain.flags, None);
}

#[test]
fn test_config_defaults() {
    let config = parse_config("{\"user\":\"fred\",\"host\":\"ops1\",\"description\":\"Pump pressure\"}")
        .unwrap();
    assert!(config.is_leaf());
    assert_eq!(config.enabled, EnabledState::enabled());
    assert!(config.latching && config.annunciating);
    assert_eq!((config.delay, config.count), (0, 0));

    let node = parse_config("{\"guidance\":[{\"title\":\"Call\",\"details\":\"555-1234\"}]}").unwrap();
    assert!(!node.is_leaf());
    assert_eq!(node.guidance.len(), 1);
}

#[test]
fn test_config_encoding() {
    let config = parse_config(
        r#"{"description":"Temp","enabled":"2026-10-20 08:00:00","latching":false,
            "delay":5,"count":3,"filter":"'loc://en' > 0",
            "actions":[{"title":"Mail","details":"mailto:ops@site","delay":30}]}"#,
    )
    .unwrap();
    assert!(!config.enabled.enabled);
    assert_eq!(
        config.enabled.enabled_date,
        Utc.with_ymd_and_hms(2026, 10, 20, 8, 0, 0).single()
    );
    assert!(!config.latching);
    assert_eq!(config.actions[0].delay, 30);

    let text = encode_config(&config).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["latching"], false);
    assert!(json.get("annunciating").is_none());
    assert_eq!(json["delay"], 5);
    assert_eq!(parse_config(&text).unwrap(), config);
}

#[test]
fn test_bad_config() {
    assert!(matches!(parse_config("{\"description\":"), Err(WireError::Json(_))));
    assert!(matches!(
        parse_config("{\"description\":\"x\",\"enabled\":\"tomorrow\"}"),
        Err(WireError::InvalidDate(_))
    ));
}

#[test]
fn test_talk_format() {
    let talk = make_talk(SeverityLevel::Major, "Pump tripped");
    assert_eq!(talk.talk, "MAJOR Alarm: Pump tripped");
    assert!(!talk.standout);
    let talk = make_talk(SeverityLevel::Minor, "*There is 1 active alarm");
    assert_eq!(talk.talk, "There is 1 active alarm");
    let talk = make_talk(SeverityLevel::Invalid, "!Beam loss");
    assert!(talk.standout);
    assert_eq!(talk.talk, "Beam loss");
}
