use const_str::convert_ascii_case;
use num_enum::TryFromPrimitive;
use paste::paste;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Alarm severity.
///
/// The declaration order is the ordinal used when aggregating severities
/// in the tree: every active level ranks above every acknowledged one.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum SeverityLevel {
    Ok = 0,
    MinorAck = 1,
    MajorAck = 2,
    InvalidAck = 3,
    UndefinedAck = 4,
    Minor = 5,
    Major = 6,
    Invalid = 7,
    Undefined = 8,
}

// Define a string constant and a lowercase version with _LC appended to the name
macro_rules! makelc {
    ($n: ident, $str: expr) => {
        const $n: &str = $str;
        paste! {const [<$n _LC>]: &str = convert_ascii_case!(lower, $str);}
    };
}

makelc!(OK, "OK");
makelc!(MINOR_ACK, "MINOR_ACK");
makelc!(MAJOR_ACK, "MAJOR_ACK");
makelc!(INVALID_ACK, "INVALID_ACK");
makelc!(UNDEFINED_ACK, "UNDEFINED_ACK");
makelc!(MINOR, "MINOR");
makelc!(MAJOR, "MAJOR");
makelc!(INVALID, "INVALID");
makelc!(UNDEFINED, "UNDEFINED");

#[derive(Debug, PartialEq)]
pub struct SeverityError(String);

impl std::error::Error for SeverityError {}

impl Display for SeverityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for SeverityLevel {
    type Err = SeverityError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(ordinal) = s.parse::<u8>() {
            return SeverityLevel::try_from(ordinal).map_err(|_| {
                SeverityError(format!("Integer {} is not a valid severity", ordinal))
            });
        }
        match s.trim().to_lowercase().as_str() {
            OK_LC => Ok(SeverityLevel::Ok),
            MINOR_ACK_LC => Ok(SeverityLevel::MinorAck),
            MAJOR_ACK_LC => Ok(SeverityLevel::MajorAck),
            INVALID_ACK_LC => Ok(SeverityLevel::InvalidAck),
            UNDEFINED_ACK_LC => Ok(SeverityLevel::UndefinedAck),
            MINOR_LC => Ok(SeverityLevel::Minor),
            MAJOR_LC => Ok(SeverityLevel::Major),
            INVALID_LC => Ok(SeverityLevel::Invalid),
            UNDEFINED_LC => Ok(SeverityLevel::Undefined),
            _ => Err(SeverityError(format!(
                "String \"{}\" is not a valid severity",
                s
            ))),
        }
    }
}

impl SeverityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityLevel::Ok => OK,
            SeverityLevel::MinorAck => MINOR_ACK,
            SeverityLevel::MajorAck => MAJOR_ACK,
            SeverityLevel::InvalidAck => INVALID_ACK,
            SeverityLevel::UndefinedAck => UNDEFINED_ACK,
            SeverityLevel::Minor => MINOR,
            SeverityLevel::Major => MAJOR,
            SeverityLevel::Invalid => INVALID,
            SeverityLevel::Undefined => UNDEFINED,
        }
    }

    /// Active alarms are the ones an operator still has to acknowledge
    pub fn is_active(&self) -> bool {
        *self > SeverityLevel::UndefinedAck
    }

    /// Rank used when deciding if a new state supersedes the present
    /// one. Each severity sits just above its acknowledged twin.
    pub fn update_priority(&self) -> u8 {
        match self {
            SeverityLevel::Ok => 0,
            SeverityLevel::MinorAck => 1,
            SeverityLevel::Minor => 2,
            SeverityLevel::MajorAck => 3,
            SeverityLevel::Major => 4,
            SeverityLevel::InvalidAck => 5,
            SeverityLevel::Invalid => 6,
            SeverityLevel::UndefinedAck => 7,
            SeverityLevel::Undefined => 8,
        }
    }

    pub fn acknowledged(&self) -> SeverityLevel {
        match self {
            SeverityLevel::Minor => SeverityLevel::MinorAck,
            SeverityLevel::Major => SeverityLevel::MajorAck,
            SeverityLevel::Invalid => SeverityLevel::InvalidAck,
            SeverityLevel::Undefined => SeverityLevel::UndefinedAck,
            other => *other,
        }
    }

    pub fn unacknowledged(&self) -> SeverityLevel {
        match self {
            SeverityLevel::MinorAck => SeverityLevel::Minor,
            SeverityLevel::MajorAck => SeverityLevel::Major,
            SeverityLevel::InvalidAck => SeverityLevel::Invalid,
            SeverityLevel::UndefinedAck => SeverityLevel::Undefined,
            other => *other,
        }
    }
}

impl Default for SeverityLevel {
    fn default() -> Self {
        SeverityLevel::Ok
    }
}

impl Display for SeverityLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(self.as_str())
    }
}

impl Serialize for SeverityLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SeverityLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        SeverityLevel::from_str(&name).map_err(de::Error::custom)
    }
}

#[cfg(test)]
use test_log::test;

#[test]
fn test_severity_parse() {
    assert_eq!(SeverityLevel::from_str("MAJOR"), Ok(SeverityLevel::Major));
    assert_eq!(SeverityLevel::from_str("minor_ack"), Ok(SeverityLevel::MinorAck));
    assert_eq!(SeverityLevel::from_str("Undefined_Ack"), Ok(SeverityLevel::UndefinedAck));
    assert_eq!(SeverityLevel::from_str("7"), Ok(SeverityLevel::Invalid));
    assert!(SeverityLevel::from_str("9").is_err());
    assert!(SeverityLevel::from_str("SEVERE").is_err());
    assert_eq!(SeverityLevel::from_str("0").map(|s| s.as_str()), Ok("OK"));
}

#[test]
fn test_severity_order() {
    assert!(SeverityLevel::Ok < SeverityLevel::MinorAck);
    assert!(SeverityLevel::UndefinedAck < SeverityLevel::Minor);
    assert!(SeverityLevel::Minor < SeverityLevel::Major && SeverityLevel::Major < SeverityLevel::Invalid && SeverityLevel::Invalid < SeverityLevel::Undefined);
    assert!(!SeverityLevel::Ok.is_active());
    assert!(!SeverityLevel::MajorAck.is_active());
    assert!(SeverityLevel::Minor.is_active());
    assert!(SeverityLevel::Major.update_priority() > SeverityLevel::MajorAck.update_priority());
    assert!(SeverityLevel::MajorAck.update_priority() > SeverityLevel::Minor.update_priority());
    assert_eq!(SeverityLevel::Invalid.acknowledged(), SeverityLevel::InvalidAck);
    assert_eq!(SeverityLevel::InvalidAck.unacknowledged(), SeverityLevel::Invalid);
    assert_eq!(SeverityLevel::Ok.acknowledged(), SeverityLevel::Ok);
}

#[test]
fn test_severity_serde() {
    assert_eq!(serde_json::to_string(&SeverityLevel::MajorAck).unwrap(), "\"MAJOR_ACK\"");
    let sev: SeverityLevel = serde_json::from_str("\"UNDEFINED\"").unwrap();
    assert_eq!(sev, SeverityLevel::Undefined);
    assert!(serde_json::from_str::<SeverityLevel>("\"BAD\"").is_err());
}
