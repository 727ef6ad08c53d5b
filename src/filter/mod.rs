//! Dynamic enablement of alarm points, either from a formula over other
//! values or at a scheduled time.

pub mod expression;
pub mod formula;
pub mod scheduled;

use formula::FormulaFilter;
use scheduled::ScheduledEnable;
use std::sync::Arc;

pub enum EnablementFilter {
    Formula(Arc<FormulaFilter>),
    Scheduled(ScheduledEnable),
}

impl EnablementFilter {
    pub fn stop(&self) {
        match self {
            EnablementFilter::Formula(filter) => filter.stop(),
            EnablementFilter::Scheduled(enable) => enable.cancel(),
        }
    }
}
