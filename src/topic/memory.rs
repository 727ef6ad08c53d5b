//! A compacted log that lives in this process.
//!
//! Used by tests and for running the server without a broker.

use super::{LogError, LogRecord, StartFrom, TopicConsumer, TopicProducer};
use crate::util::error::lock;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct TopicLog {
    next_offset: u64,
    records: Vec<(u64, LogRecord)>,
}

struct LogMut {
    topics: HashMap<String, TopicLog>,
    connected: bool,
}

pub struct MemoryLog {
    inner: Mutex<LogMut>,
    changed: Condvar,
}

impl MemoryLog {
    pub fn new() -> Arc<MemoryLog> {
        Arc::new(MemoryLog {
            inner: Mutex::new(LogMut {
                topics: HashMap::new(),
                connected: true,
            }),
            changed: Condvar::new(),
        })
    }

    /// While disconnected sends are dropped and probes fail
    pub fn set_connected(&self, connected: bool) {
        lock(&self.inner).connected = connected;
        self.changed.notify_all();
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }

    /// Add a record regardless of the connection state
    pub fn append(&self, record: LogRecord) {
        {
            let mut inner = lock(&self.inner);
            let topic = inner.topics.entry(record.topic.clone()).or_default();
            let offset = topic.next_offset;
            topic.next_offset += 1;
            topic.records.push((offset, record));
        }
        self.changed.notify_all();
    }

    pub fn records(&self, topic: &str) -> Vec<LogRecord> {
        lock(&self.inner)
            .topics
            .get(topic)
            .map(|t| t.records.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    /// Keep only the last record of each key, dropping deleted keys
    pub fn compact(&self, topic: &str) {
        let mut inner = lock(&self.inner);
        if let Some(topic) = inner.topics.get_mut(topic) {
            let mut seen = HashSet::new();
            let mut kept: Vec<(u64, LogRecord)> = topic
                .records
                .drain(..)
                .rev()
                .filter(|(_, r)| seen.insert(r.key.clone()) && r.value.is_some())
                .collect();
            kept.reverse();
            debug!("Compacted to {} records", kept.len());
            topic.records = kept;
        }
    }

    pub fn consumer(self: &Arc<Self>, topics: &[(&str, StartFrom)]) -> MemoryConsumer {
        let mut inner = lock(&self.inner);
        let positions = topics
            .iter()
            .map(|(name, start)| {
                let position = match start {
                    StartFrom::Beginning => 0,
                    StartFrom::End => inner
                        .topics
                        .entry(name.to_string())
                        .or_default()
                        .next_offset,
                };
                (name.to_string(), position)
            })
            .collect();
        MemoryConsumer {
            log: self.clone(),
            positions,
        }
    }
}

impl TopicProducer for MemoryLog {
    fn send(&self, record: LogRecord) -> Result<(), LogError> {
        if !self.is_connected() {
            debug!("Dropping {} while disconnected", record.key);
            return Ok(());
        }
        self.append(record);
        Ok(())
    }
}

pub struct MemoryConsumer {
    log: Arc<MemoryLog>,
    positions: Vec<(String, u64)>,
}

impl MemoryConsumer {
    fn take_new(&mut self, inner: &MutexGuard<'_, LogMut>) -> Vec<LogRecord> {
        let mut result = Vec::new();
        if !inner.connected {
            return result;
        }
        for (name, position) in self.positions.iter_mut() {
            if let Some(topic) = inner.topics.get(name.as_str()) {
                for (offset, record) in topic.records.iter() {
                    if *offset >= *position {
                        result.push(record.clone());
                    }
                }
                *position = topic.next_offset;
            }
        }
        result
    }
}

impl TopicConsumer for MemoryConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<LogRecord>, LogError> {
        let log = self.log.clone();
        let inner = lock(&log.inner);
        let records = self.take_new(&inner);
        if !records.is_empty() || timeout.is_zero() {
            return Ok(records);
        }
        let (inner, _) = log
            .changed
            .wait_timeout(inner, timeout)
            .unwrap_or_else(|e| e.into_inner());
        Ok(self.take_new(&inner))
    }

    fn probe(&mut self, _timeout: Duration) -> Result<(), LogError> {
        if self.log.is_connected() {
            Ok(())
        } else {
            Err(LogError::Disconnected)
        }
    }
}

#[cfg(test)]
use test_log::test;

#[test]
fn test_memory_log() {
    let log = MemoryLog::new();
    log.send(LogRecord::new("Test", "config:/Test/a", Some("{}".to_string())))
        .unwrap();
    let mut from_start = log.consumer(&[("Test", StartFrom::Beginning)]);
    let mut from_end = log.consumer(&[("Test", StartFrom::End), ("TestCommand", StartFrom::End)]);
    log.send(LogRecord::new("Test", "config:/Test/a", None)).unwrap();
    log.send(LogRecord::new("TestCommand", "command:/Test", Some("{}".to_string())))
        .unwrap();

    assert_eq!(from_start.poll(Duration::ZERO).unwrap().len(), 2);
    let records = from_end.poll(Duration::ZERO).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].value, None);
    assert!(from_end.poll(Duration::from_millis(10)).unwrap().is_empty());

    // Outage: nothing is stored or delivered
    log.set_connected(false);
    log.send(LogRecord::new("Test", "config:/Test/b", Some("{}".to_string())))
        .unwrap();
    assert!(from_end.probe(Duration::ZERO).is_err());
    log.set_connected(true);
    assert!(from_end.poll(Duration::ZERO).unwrap().is_empty());

    log.send(LogRecord::new("Test", "config:/Test/c", Some("{}".to_string())))
        .unwrap();
    log.compact("Test");
    let keys: Vec<String> = log.records("Test").into_iter().map(|r| r.key).collect();
    assert_eq!(keys, vec!["config:/Test/c"]);
}
