//! Source of live values for alarm points and filters.
//!
//! The control system connection itself lives outside this crate, it
//! only has to deliver [`ValueUpdate`]s for named values.

use crate::severity::SeverityLevel;
use crate::util::error::lock;
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex, Weak};

/// A value with its alarm information
#[derive(Debug, Clone, PartialEq)]
pub struct PvSample {
    pub severity: SeverityLevel,
    pub message: String,
    pub value: String,
    pub time: DateTime<Utc>,
}

impl PvSample {
    pub fn new(severity: SeverityLevel, message: &str, value: &str) -> PvSample {
        PvSample {
            severity,
            message: message.to_string(),
            value: value.to_string(),
            time: Utc::now(),
        }
    }

    /// A plain value without alarm
    pub fn value(value: &str) -> PvSample {
        PvSample::new(SeverityLevel::Ok, "", value)
    }

    pub fn as_number(&self) -> Option<f64> {
        self.value.trim().parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueUpdate {
    Disconnected,
    Value(PvSample),
}

pub type ValueCallback = Arc<dyn Fn(ValueUpdate) + Send + Sync>;

#[derive(Debug)]
pub enum SourceError {
    InvalidName(String),
    WriteFailed(String, String),
}

impl std::error::Error for SourceError {}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            SourceError::InvalidName(name) => write!(f, "Invalid value name '{}'", name),
            SourceError::WriteFailed(name, reason) => {
                write!(f, "Failed to write '{}': {}", name, reason)
            }
        }
    }
}

/// Subscription to a value. Dropping it ends the subscription.
pub trait Subscription: Send {}

pub trait ValueSource: Send + Sync {
    fn subscribe(
        &self,
        name: &str,
        callback: ValueCallback,
    ) -> Result<Box<dyn Subscription>, SourceError>;

    fn write(&self, name: &str, value: &str) -> Result<(), SourceError>;
}

struct LocalValue {
    last: Option<PvSample>,
    subscribers: Vec<(u64, ValueCallback)>,
}

struct LocalMut {
    next_id: u64,
    values: HashMap<String, LocalValue>,
}

/// Values that only exist inside this process.
///
/// New subscribers get the last value right away. Writing a value
/// delivers it without alarm.
pub struct LocalValueSource {
    inner: Arc<Mutex<LocalMut>>,
}

struct LocalSubscription {
    name: String,
    id: u64,
    source: Weak<Mutex<LocalMut>>,
}

impl Subscription for LocalSubscription {}

impl Drop for LocalSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.source.upgrade() {
            let mut inner = lock(&inner);
            if let Some(value) = inner.values.get_mut(&self.name) {
                value.subscribers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl LocalValueSource {
    pub fn new() -> Arc<LocalValueSource> {
        Arc::new(LocalValueSource {
            inner: Arc::new(Mutex::new(LocalMut {
                next_id: 0,
                values: HashMap::new(),
            })),
        })
    }

    fn deliver(&self, name: &str, update: ValueUpdate) {
        let callbacks: Vec<ValueCallback> = {
            let mut inner = lock(&self.inner);
            let value = inner
                .values
                .entry(name.to_string())
                .or_insert_with(|| LocalValue {
                    last: None,
                    subscribers: Vec::new(),
                });
            value.last = match &update {
                ValueUpdate::Value(sample) => Some(sample.clone()),
                ValueUpdate::Disconnected => None,
            };
            value.subscribers.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in callbacks {
            callback(update.clone());
        }
    }

    pub fn set(&self, name: &str, sample: PvSample) {
        self.deliver(name, ValueUpdate::Value(sample));
    }

    pub fn disconnect(&self, name: &str) {
        self.deliver(name, ValueUpdate::Disconnected);
    }

    pub fn last(&self, name: &str) -> Option<PvSample> {
        lock(&self.inner)
            .values
            .get(name)
            .and_then(|v| v.last.clone())
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        lock(&self.inner)
            .values
            .get(name)
            .map(|v| v.subscribers.len())
            .unwrap_or(0)
    }
}

impl ValueSource for LocalValueSource {
    fn subscribe(
        &self,
        name: &str,
        callback: ValueCallback,
    ) -> Result<Box<dyn Subscription>, SourceError> {
        if name.trim().is_empty() {
            return Err(SourceError::InvalidName(name.to_string()));
        }
        let (id, last) = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            let value = inner
                .values
                .entry(name.to_string())
                .or_insert_with(|| LocalValue {
                    last: None,
                    subscribers: Vec::new(),
                });
            value.subscribers.push((id, callback.clone()));
            (id, value.last.clone())
        };
        debug!("Subscribed to {}", name);
        if let Some(sample) = last {
            callback(ValueUpdate::Value(sample));
        }
        Ok(Box::new(LocalSubscription {
            name: name.to_string(),
            id,
            source: Arc::downgrade(&self.inner),
        }))
    }

    fn write(&self, name: &str, value: &str) -> Result<(), SourceError> {
        if name.trim().is_empty() {
            return Err(SourceError::InvalidName(name.to_string()));
        }
        self.set(name, PvSample::value(value));
        Ok(())
    }
}

#[cfg(test)]
use test_log::test;

#[test]
fn test_local_source() {
    let source = LocalValueSource::new();
    source.set("loc://a", PvSample::new(SeverityLevel::Minor, "LOW", "1"));
    let received = Arc::new(Mutex::new(Vec::new()));
    let r = received.clone();
    let subscription = source
        .subscribe(
            "loc://a",
            Arc::new(move |update| r.lock().unwrap().push(update)),
        )
        .unwrap();
    source.disconnect("loc://a");
    source.write("loc://a", "2").unwrap();
    assert_eq!(source.subscriber_count("loc://a"), 1);
    drop(subscription);
    assert_eq!(source.subscriber_count("loc://a"), 0);
    source.write("loc://a", "3").unwrap();

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 3);
    assert!(matches!(&received[0], ValueUpdate::Value(s) if s.severity == SeverityLevel::Minor));
    assert_eq!(received[1], ValueUpdate::Disconnected);
    assert!(matches!(&received[2], ValueUpdate::Value(s) if s.as_number() == Some(2.0)));
    assert!(source.subscribe(" ", Arc::new(|_| {})).is_err());
}
