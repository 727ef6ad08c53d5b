use crate::filter::expression::Expression;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::util::error::lock;
use crate::value_source::{Subscription, ValueSource, ValueUpdate};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub type FilterListener = Arc<dyn Fn(f64) + Send + Sync>;

struct FormulaMut {
    values: HashMap<String, f64>,
    subscriptions: Vec<Box<dyn Subscription>>,
    pending: Option<TimerHandle>,
    last: Option<f64>,
}

/// Evaluates an expression whenever one of its inputs changes.
///
/// Evaluation runs on the scheduler, not in the value callback, and
/// any number of input changes while one is pending result in a single
/// evaluation. The listener only hears about changed results.
pub struct FormulaFilter {
    expression: Expression,
    source: Arc<dyn ValueSource>,
    scheduler: Arc<dyn Scheduler>,
    listener: FilterListener,
    inner: Mutex<FormulaMut>,
}

impl FormulaFilter {
    pub fn new(
        expression: Expression,
        source: Arc<dyn ValueSource>,
        scheduler: Arc<dyn Scheduler>,
        listener: FilterListener,
    ) -> Arc<FormulaFilter> {
        Arc::new(FormulaFilter {
            expression,
            source,
            scheduler,
            listener,
            inner: Mutex::new(FormulaMut {
                values: HashMap::new(),
                subscriptions: Vec::new(),
                pending: None,
                last: None,
            }),
        })
    }

    pub fn start(self: &Arc<Self>) {
        for name in self.expression.inputs() {
            let weak = Arc::downgrade(self);
            let input = name.clone();
            let subscription = self.source.subscribe(
                &name,
                Arc::new(move |update| {
                    if let Some(filter) = weak.upgrade() {
                        filter.input_changed(&input, update);
                    }
                }),
            );
            match subscription {
                Ok(subscription) => lock(&self.inner).subscriptions.push(subscription),
                Err(e) => warn!("Filter {} can't subscribe to {}: {}", self.expression, name, e),
            }
        }
    }

    pub fn stop(&self) {
        let (subscriptions, pending) = {
            let mut inner = lock(&self.inner);
            inner.values.clear();
            inner.last = None;
            (std::mem::take(&mut inner.subscriptions), inner.pending.take())
        };
        if let Some(pending) = pending {
            pending.cancel();
        }
        drop(subscriptions);
    }

    fn input_changed(self: &Arc<Self>, name: &str, update: ValueUpdate) {
        let mut inner = lock(&self.inner);
        match update {
            ValueUpdate::Value(sample) => match sample.as_number() {
                Some(number) => {
                    inner.values.insert(name.to_string(), number);
                }
                None => {
                    debug!("Filter input {} is not numeric: {}", name, sample.value);
                    inner.values.remove(name);
                }
            },
            ValueUpdate::Disconnected => {
                inner.values.remove(name);
            }
        }
        if inner.pending.is_none() {
            let weak: Weak<FormulaFilter> = Arc::downgrade(self);
            inner.pending = Some(self.scheduler.schedule(
                Duration::ZERO,
                Box::new(move || {
                    if let Some(filter) = weak.upgrade() {
                        filter.evaluate();
                    }
                }),
            ));
        }
    }

    fn evaluate(&self) {
        let changed = {
            let mut inner = lock(&self.inner);
            if inner.pending.take().is_none() {
                // Stopped in the meantime
                return;
            }
            match self.expression.evaluate(&inner.values) {
                Some(value) if inner.last != Some(value) => {
                    inner.last = Some(value);
                    Some(value)
                }
                _ => None,
            }
        };
        if let Some(value) = changed {
            debug!("Filter {} changed to {}", self.expression, value);
            (self.listener)(value);
        }
    }
}

impl Drop for FormulaFilter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
use test_log::test;

#[test]
fn test_formula_filter() {
    use crate::filter::expression::parse_expression;
    use crate::scheduler::ManualScheduler;
    use crate::value_source::{LocalValueSource, PvSample};

    let source = LocalValueSource::new();
    let scheduler = ManualScheduler::new();
    let results = Arc::new(Mutex::new(Vec::new()));
    let r = results.clone();
    let filter = FormulaFilter::new(
        parse_expression("a > 5 && b").unwrap(),
        source.clone(),
        scheduler.clone(),
        Arc::new(move |v| r.lock().unwrap().push(v)),
    );
    filter.start();

    // Incomplete inputs give no result
    source.set("a", PvSample::value("7"));
    scheduler.run_due();
    assert!(results.lock().unwrap().is_empty());

    // Several changes, one evaluation
    source.set("b", PvSample::value("0"));
    source.set("b", PvSample::value("1"));
    assert_eq!(scheduler.pending(), 1);
    scheduler.run_due();
    assert_eq!(*results.lock().unwrap(), vec![1.0]);

    // Same result is not reported again
    source.set("a", PvSample::value("8"));
    scheduler.run_due();
    source.set("a", PvSample::value("2"));
    scheduler.run_due();
    assert_eq!(*results.lock().unwrap(), vec![1.0, 0.0]);

    filter.stop();
    assert_eq!(source.subscriber_count("a"), 0);
    source.set("a", PvSample::value("9"));
    scheduler.run_due();
    assert_eq!(results.lock().unwrap().len(), 2);
}
