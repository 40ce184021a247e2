//! Caller-owned timing aggregation for backend operations
//!
//! Elapsed time is summed per `(component, action)` pair. A snapshot rolls
//! the pairs up per component, per action, and into a grand total.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Thread-safe accumulator of elapsed time
#[derive(Debug, Default)]
pub struct TimingCollector {
    totals: Mutex<HashMap<(&'static str, &'static str), Duration>>,
}

/// Aggregated view of a [`TimingCollector`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingReport {
    pub by_component: BTreeMap<&'static str, Duration>,
    pub by_action: BTreeMap<&'static str, Duration>,
    pub total: Duration,
}

impl TimingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `elapsed` to the `(component, action)` sum
    pub fn record(&self, component: &'static str, action: &'static str, elapsed: Duration) {
        *self
            .totals
            .lock()
            .entry((component, action))
            .or_insert(Duration::ZERO) += elapsed;
    }

    /// Sum recorded for one pair
    pub fn get(&self, component: &'static str, action: &'static str) -> Option<Duration> {
        self.totals.lock().get(&(component, action)).copied()
    }

    /// Roll the pairs up per component, per action and overall
    pub fn report(&self) -> TimingReport {
        let totals = self.totals.lock();
        let mut report = TimingReport::default();
        for (&(component, action), &elapsed) in totals.iter() {
            *report.by_component.entry(component).or_default() += elapsed;
            *report.by_action.entry(action).or_default() += elapsed;
            report.total += elapsed;
        }
        report
    }
}

/// Records the time between its creation and drop, if a collector is set
pub(crate) struct Timed<'a> {
    collector: Option<&'a Arc<TimingCollector>>,
    component: &'static str,
    action: &'static str,
    started: Instant,
}

impl<'a> Timed<'a> {
    pub(crate) fn start(
        collector: Option<&'a Arc<TimingCollector>>,
        component: &'static str,
        action: &'static str,
    ) -> Self {
        Self {
            collector,
            component,
            action,
            started: Instant::now(),
        }
    }
}

impl Drop for Timed<'_> {
    fn drop(&mut self) {
        if let Some(collector) = self.collector {
            collector.record(self.component, self.action, self.started.elapsed());
        }
    }
}
