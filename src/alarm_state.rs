use crate::severity::SeverityLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Severity, message, value and time of an alarm.
///
/// Used both for the raw state reported by a value source and for the
/// alarm state computed from it. Transitions build new values instead
/// of mutating old ones.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmState {
    pub severity: SeverityLevel,
    pub message: String,
    pub value: String,
    pub time: DateTime<Utc>,
    pub latched: bool,
}

impl AlarmState {
    pub fn new(
        severity: SeverityLevel,
        message: &str,
        value: &str,
        time: DateTime<Utc>,
    ) -> AlarmState {
        AlarmState {
            severity,
            message: message.to_string(),
            value: value.to_string(),
            time,
            latched: false,
        }
    }

    pub fn clear(value: &str, time: DateTime<Utc>) -> AlarmState {
        AlarmState::new(SeverityLevel::Ok, "", value, time)
    }

    pub fn with_latch(mut self, latched: bool) -> AlarmState {
        self.latched = latched;
        self
    }

    pub fn acknowledged(&self) -> AlarmState {
        AlarmState {
            severity: self.severity.acknowledged(),
            message: self.message.clone(),
            value: self.value.clone(),
            time: self.time,
            latched: false,
        }
    }

    pub fn unacknowledged(&self) -> AlarmState {
        AlarmState {
            severity: self.severity.unacknowledged(),
            message: self.message.clone(),
            value: self.value.clone(),
            time: self.time,
            latched: false,
        }
    }

    pub fn has_higher_update_priority(&self, other: &AlarmState) -> bool {
        self.severity.update_priority() > other.severity.update_priority()
    }
}

impl Display for AlarmState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "{}/{}/{} ({})",
            self.severity,
            self.message,
            self.value,
            self.time.format("%Y-%m-%d %H:%M:%S%.3f")
        )?;
        if self.latched {
            f.write_str(" - latched")?;
        }
        Ok(())
    }
}

/// What a point publishes: the alarm state plus the current severity
/// and message of the underlying value.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientState {
    pub alarm: AlarmState,
    pub current_severity: SeverityLevel,
    pub current_message: String,
}

impl ClientState {
    pub fn new(alarm: &AlarmState, current: &AlarmState) -> ClientState {
        ClientState {
            alarm: alarm.clone(),
            current_severity: current.severity,
            current_message: current.message.clone(),
        }
    }

    /// The current state, as far as it can be reconstructed
    pub fn current_state(&self) -> AlarmState {
        AlarmState::new(
            self.current_severity,
            &self.current_message,
            &self.alarm.value,
            self.alarm.time,
        )
    }
}

/// Either enabled, disabled, or disabled until a point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnabledState {
    pub enabled: bool,
    pub enabled_date: Option<DateTime<Utc>>,
}

impl EnabledState {
    pub fn enabled() -> EnabledState {
        EnabledState {
            enabled: true,
            enabled_date: None,
        }
    }

    pub fn disabled() -> EnabledState {
        EnabledState {
            enabled: false,
            enabled_date: None,
        }
    }

    pub fn disabled_until(date: DateTime<Utc>) -> EnabledState {
        EnabledState {
            enabled: false,
            enabled_date: Some(date),
        }
    }
}

impl Default for EnabledState {
    fn default() -> Self {
        EnabledState::enabled()
    }
}

/// Guidance, display link or command attached to an item
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TitleDetail {
    pub title: String,
    #[serde(default)]
    pub details: String,
}

/// Automated action with the number of seconds an alarm has to
/// persist before it runs
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TitleDetailDelay {
    pub title: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub delay: u32,
}

#[cfg(test)]
use test_log::test;

#[test]
fn test_acknowledge_twins() {
    let t = Utc::now();
    let state = AlarmState::new(SeverityLevel::Major, "HIHI", "12.5", t).with_latch(true);
    let acked = state.acknowledged();
    assert_eq!(acked.severity, SeverityLevel::MajorAck);
    assert_eq!(acked.message, "HIHI");
    assert!(!acked.latched);
    assert_eq!(acked.unacknowledged().severity, SeverityLevel::Major);
    assert!(state.has_higher_update_priority(&acked));
    assert!(!acked.has_higher_update_priority(&state));

    let clear = AlarmState::clear("3", t);
    assert_eq!(clear.severity, SeverityLevel::Ok);
    assert_eq!(clear.message, "");
    assert_eq!(clear.value, "3");
}
