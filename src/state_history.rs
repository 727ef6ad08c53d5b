use crate::alarm_state::AlarmState;
use std::collections::VecDeque;

/// The last `count` alarm states of a point
#[derive(Debug)]
pub struct AlarmStateHistory {
    capacity: usize,
    states: VecDeque<AlarmState>,
}

impl AlarmStateHistory {
    pub fn new(count: usize) -> AlarmStateHistory {
        let capacity = count.max(1);
        AlarmStateHistory {
            capacity,
            states: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Add a state, dropping the oldest one when full
    pub fn add(&mut self, state: AlarmState) {
        if self.states.len() == self.capacity {
            self.states.pop_front();
        }
        self.states.push_back(state);
    }

    /// True if the history is full and spans at most `seconds`
    pub fn within_range(&self, seconds: u32) -> bool {
        if self.states.len() < self.capacity {
            return false;
        }
        match (self.states.front(), self.states.back()) {
            (Some(oldest), Some(newest)) => {
                (newest.time - oldest.time).num_milliseconds() <= i64::from(seconds) * 1000
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.states.clear();
    }
}

#[cfg(test)]
use test_log::test;

#[cfg(test)]
fn state_at(t0: chrono::DateTime<chrono::Utc>, secs: i64) -> AlarmState {
    use crate::severity::SeverityLevel;
    AlarmState::new(
        SeverityLevel::Minor,
        "LOW",
        "1",
        t0 + chrono::Duration::seconds(secs),
    )
}

#[test]
fn test_within_range() {
    let t0 = chrono::Utc::now();
    let mut history = AlarmStateHistory::new(3);
    history.add(state_at(t0, 0));
    history.add(state_at(t0, 3));
    assert!(!history.within_range(10));
    history.add(state_at(t0, 6));
    assert!(history.within_range(10));
    assert!(history.within_range(6));
    assert!(!history.within_range(5));

    // Oldest entry is dropped, span is now 3..20
    history.add(state_at(t0, 20));
    assert_eq!(history.len(), 3);
    assert!(!history.within_range(10));
    assert!(history.within_range(17));

    history.reset();
    assert!(history.is_empty());
    history.add(state_at(t0, 21));
    assert!(!history.within_range(100));
}
