//! One-shot timers.
//!
//! Everything time dependent in the alarm logic goes through a
//! [`Scheduler`] so the same code runs on tokio in the server and on a
//! manually advanced clock in tests.

use crate::util::error::lock;
use log::error;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Cancels a scheduled task. Cancelling twice, or after the task ran,
/// does nothing.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    fn new() -> TimerHandle {
        TimerHandle {
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

fn run_task(task: TimerTask) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
        error!("Timer task failed: {}", panic_message(&payload));
    }
}

/// Runs timers as tasks on a tokio runtime
pub struct TokioScheduler {
    runtime: Handle,
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> Arc<TokioScheduler> {
        Arc::new(TokioScheduler { runtime })
    }

    /// Use the runtime of the calling task
    pub fn current() -> Arc<TokioScheduler> {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle::new();
        let token = handle.token.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        run_task(task);
                    }
                }
            }
        });
        handle
    }
}

struct ManualTask {
    deadline: Duration,
    seq: u64,
    handle: TimerHandle,
    task: TimerTask,
}

struct ManualMut {
    now: Duration,
    next_seq: u64,
    tasks: Vec<ManualTask>,
}

/// Scheduler driven by an explicit clock.
///
/// Nothing runs until [`ManualScheduler::advance`] is called. Tasks
/// are then run in deadline order on the calling thread, including
/// tasks scheduled by other tasks as long as they fall within the step.
pub struct ManualScheduler {
    inner: Mutex<ManualMut>,
}

impl ManualScheduler {
    pub fn new() -> Arc<ManualScheduler> {
        Arc::new(ManualScheduler {
            inner: Mutex::new(ManualMut {
                now: Duration::ZERO,
                next_seq: 0,
                tasks: Vec::new(),
            }),
        })
    }

    /// Time passed since creation
    pub fn elapsed(&self) -> Duration {
        lock(&self.inner).now
    }

    /// Number of scheduled tasks that are neither cancelled nor run
    pub fn pending(&self) -> usize {
        let inner = lock(&self.inner);
        inner
            .tasks
            .iter()
            .filter(|t| !t.handle.is_cancelled())
            .count()
    }

    fn next_due(&self, target: Duration) -> Option<TimerTask> {
        let mut inner = lock(&self.inner);
        inner.tasks.retain(|t| !t.handle.is_cancelled());
        let index = inner
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.deadline <= target)
            .min_by_key(|(_, t)| (t.deadline, t.seq))
            .map(|(i, _)| i)?;
        let due = inner.tasks.remove(index);
        if due.deadline > inner.now {
            inner.now = due.deadline;
        }
        Some(due.task)
    }

    pub fn advance(&self, step: Duration) {
        let target = lock(&self.inner).now + step;
        while let Some(task) = self.next_due(target) {
            run_task(task);
        }
        lock(&self.inner).now = target;
    }

    /// Run whatever is due right now
    pub fn run_due(&self) {
        self.advance(Duration::ZERO);
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut inner = lock(&self.inner);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let deadline = inner.now + delay;
        inner.tasks.push(ManualTask {
            deadline,
            seq,
            handle: handle.clone(),
            task,
        });
        handle
    }
}

#[cfg(test)]
use test_log::test;

#[test]
fn test_manual_order_and_cancel() {
    let scheduler = ManualScheduler::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = log.clone();
    scheduler.schedule(Duration::from_secs(5), Box::new(move || l.lock().unwrap().push(5)));
    let l = log.clone();
    let cancelled = scheduler.schedule(
        Duration::from_secs(3),
        Box::new(move || l.lock().unwrap().push(3)),
    );
    let l = log.clone();
    scheduler.schedule(Duration::from_secs(1), Box::new(move || l.lock().unwrap().push(1)));
    cancelled.cancel();
    cancelled.cancel();
    assert_eq!(scheduler.pending(), 2);

    scheduler.advance(Duration::from_secs(2));
    assert_eq!(*log.lock().unwrap(), vec![1]);
    scheduler.advance(Duration::from_secs(10));
    assert_eq!(*log.lock().unwrap(), vec![1, 5]);
    assert_eq!(scheduler.elapsed(), Duration::from_secs(12));
    assert_eq!(scheduler.pending(), 0);
}

#[test]
fn test_manual_panic_is_contained() {
    let scheduler = ManualScheduler::new();
    let ran = Arc::new(Mutex::new(false));
    scheduler.schedule(Duration::ZERO, Box::new(|| panic!("broken timer")));
    let r = ran.clone();
    scheduler.schedule(Duration::ZERO, Box::new(move || *r.lock().unwrap() = true));
    scheduler.run_due();
    assert!(*ran.lock().unwrap());
}

#[cfg(test)]
#[test(tokio::test)]
async fn test_tokio_timer() {
    let scheduler = TokioScheduler::current();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let tx2 = tx.clone();
    let cancelled = scheduler.schedule(
        Duration::from_millis(10),
        Box::new(move || {
            let _ = tx2.send("cancelled");
        }),
    );
    scheduler.schedule(
        Duration::from_millis(20),
        Box::new(move || {
            let _ = tx.send("fired");
        }),
    );
    cancelled.cancel();
    assert_eq!(rx.recv().await, Some("fired"));
    assert_eq!(rx.recv().await, None);
}
