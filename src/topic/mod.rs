//! Access to the distributed log that carries configuration, state,
//! commands and annunciations.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// One record of a topic. A `None` value deletes the key.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub topic: String,
    pub key: String,
    pub value: Option<String>,
}

impl LogRecord {
    pub fn new(topic: &str, key: &str, value: Option<String>) -> LogRecord {
        LogRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            value,
        }
    }
}

#[derive(Debug)]
pub enum LogError {
    Disconnected,
    Transport(String),
}

impl std::error::Error for LogError {}

impl Display for LogError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            LogError::Disconnected => f.write_str("Not connected to the log"),
            LogError::Transport(e) => write!(f, "Log transport error: {}", e),
        }
    }
}

/// Where a consumer starts reading a topic
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StartFrom {
    Beginning,
    End,
}

pub trait TopicConsumer: Send {
    /// Wait up to `timeout` for new records
    fn poll(&mut self, timeout: Duration) -> Result<Vec<LogRecord>, LogError>;

    /// Check that the log can be reached
    fn probe(&mut self, timeout: Duration) -> Result<(), LogError>;
}

/// Sending does not wait for the record to be stored
pub trait TopicProducer: Send + Sync {
    fn send(&self, record: LogRecord) -> Result<(), LogError>;
}

/// Names of the topics of one alarm configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Topics {
    pub config: String,
    pub command: String,
    pub talk: String,
}

impl Topics {
    pub fn new(config_name: &str, command_suffix: &str, talk_suffix: &str) -> Topics {
        Topics {
            config: config_name.to_string(),
            command: format!("{}{}", config_name, command_suffix),
            talk: format!("{}{}", config_name, talk_suffix),
        }
    }
}
