//! Last known alarm states, read before the server builds its tree so
//! that a restart does not announce old alarms again.

use crate::alarm_state::ClientState;
use crate::topic::{LogError, TopicConsumer};
use crate::wire::{parse_key, parse_state, ItemState, RecordType};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;

/// Read state records until there are no more.
///
/// Only point states are kept, a deleted state removes the point.
pub fn read_initial_states(
    consumer: &mut dyn TopicConsumer,
    timeout: Duration,
) -> Result<HashMap<String, ClientState>, LogError> {
    let mut states = HashMap::new();
    loop {
        let records = consumer.poll(timeout)?;
        if records.is_empty() {
            break;
        }
        for record in records {
            let path = match parse_key(&record.key) {
                Ok((RecordType::State, path)) => path.to_string(),
                Ok(_) => continue,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };
            match record.value.as_deref() {
                None => {
                    states.remove(&path);
                }
                Some(json) => match parse_state(json) {
                    Ok(msg) => match msg.state {
                        ItemState::Point(state) => {
                            states.insert(path, state);
                        }
                        ItemState::Node(_) => {}
                    },
                    Err(e) => debug!("Ignoring state of {}: {}", path, e),
                },
            }
        }
    }
    info!("Found {} initial alarm states", states.len());
    Ok(states)
}

#[cfg(test)]
use test_log::test;

#[test]
fn test_read_initial_states() {
    use crate::alarm_state::AlarmState;
    use crate::severity::SeverityLevel;
    use crate::topic::memory::MemoryLog;
    use crate::topic::{LogRecord, StartFrom};
    use crate::wire::{encode_state, StateMessage};
    use chrono::Utc;

    let log = MemoryLog::new();
    let state = |severity| {
        let alarm = AlarmState::new(severity, "HIHI", "3", Utc::now());
        Some(
            encode_state(&StateMessage {
                state: ItemState::Point(ClientState::new(&alarm, &alarm)),
                flags: None,
            })
            .unwrap(),
        )
    };
    log.append(LogRecord::new("Test", "state:/Test/a", state(SeverityLevel::Minor)));
    log.append(LogRecord::new("Test", "state:/Test/a", state(SeverityLevel::Major)));
    log.append(LogRecord::new("Test", "state:/Test/b", state(SeverityLevel::Major)));
    log.append(LogRecord::new("Test", "state:/Test/b", None));
    log.append(LogRecord::new("Test", "config:/Test/c", Some("{}".to_string())));
    log.append(LogRecord::new("Test", "state:/Test", Some(r#"{"severity":"MAJOR"}"#.to_string())));

    let mut consumer = log.consumer(&[("Test", StartFrom::Beginning)]);
    let states = read_initial_states(&mut consumer, Duration::from_millis(10)).unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states["/Test/a"].alarm.severity, SeverityLevel::Major);
}
