//! Per-test attempt accounting.
//!
//! The tracker accumulates stage outcomes and durations across every
//! attempt of every test in the session, and derives the values published
//! through the item stash at protocol end: final outcome, total duration
//! and attempt count.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::host::{Stage, TestOutcome, TestReport};

/// One sequence per protocol stage.
#[derive(Debug, Clone)]
pub struct StageSeries<T> {
    pub setup: Vec<T>,
    pub call: Vec<T>,
    pub teardown: Vec<T>,
}

impl<T> Default for StageSeries<T> {
    fn default() -> Self {
        Self {
            setup: Vec::new(),
            call: Vec::new(),
            teardown: Vec::new(),
        }
    }
}

impl<T> StageSeries<T> {
    pub fn get(&self, stage: Stage) -> &Vec<T> {
        match stage {
            Stage::Setup => &self.setup,
            Stage::Call => &self.call,
            Stage::Teardown => &self.teardown,
        }
    }

    fn get_mut(&mut self, stage: Stage) -> &mut Vec<T> {
        match stage {
            Stage::Setup => &mut self.setup,
            Stage::Call => &mut self.call,
            Stage::Teardown => &mut self.teardown,
        }
    }
}

/// Outcomes and durations recorded for a single test, in attempt order.
#[derive(Debug, Clone, Default)]
pub struct AttemptStats {
    pub outcomes: StageSeries<TestOutcome>,
    pub durations: StageSeries<Duration>,
}

impl AttemptStats {
    fn new() -> Self {
        let mut stats = Self::default();
        // Seed teardown so a test that never reaches its teardown still
        // contributes a zero term to the duration sum.
        stats.durations.teardown.push(Duration::ZERO);
        stats
    }
}

/// Session-wide store of [`AttemptStats`], keyed by test id.
#[derive(Debug, Default)]
pub struct AttemptTracker {
    node_stats: Mutex<HashMap<String, AttemptStats>>,
}

impl AttemptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates fresh stats when the item enters the run protocol.
    pub fn begin(&self, test_id: &str) {
        self.node_stats
            .lock()
            .expect("stats lock poisoned")
            .insert(test_id.to_string(), AttemptStats::new());
    }

    /// Appends a stage report's outcome and duration.
    pub fn record(&self, report: &TestReport) {
        let mut stats = self.node_stats.lock().expect("stats lock poisoned");
        let entry = stats.entry(report.test_id.clone()).or_default();
        entry
            .outcomes
            .get_mut(report.when)
            .push(report.outcome.clone());
        entry.durations.get_mut(report.when).push(report.duration);
    }

    /// Final outcome for the test: skipped if setup ever skipped, failed
    /// if setup ever failed, the last call is failed (or no call ran), or
    /// any teardown failed; passed otherwise.
    pub fn simple_outcome(&self, test_id: &str) -> TestOutcome {
        let stats = self.node_stats.lock().expect("stats lock poisoned");
        let Some(entry) = stats.get(test_id) else {
            return TestOutcome::Failed;
        };
        let outcomes = &entry.outcomes;
        for wanted in [TestOutcome::Skipped, TestOutcome::Failed] {
            if outcomes.setup.contains(&wanted) {
                return wanted;
            }
        }
        match outcomes.call.last() {
            None => return TestOutcome::Failed,
            Some(last) if last.is_failed() => return TestOutcome::Failed,
            Some(_) => {}
        }
        if outcomes.teardown.iter().any(TestOutcome::is_failed) {
            return TestOutcome::Failed;
        }
        TestOutcome::Passed
    }

    /// Total duration: the sum of the last recorded duration of each
    /// stage.
    pub fn simple_duration(&self, test_id: &str) -> Duration {
        let stats = self.node_stats.lock().expect("stats lock poisoned");
        let Some(entry) = stats.get(test_id) else {
            return Duration::ZERO;
        };
        Stage::ALL
            .iter()
            .filter_map(|stage| entry.durations.get(*stage).last())
            .sum()
    }

    /// Number of call-stage executions. Zero when setup never let the
    /// call run.
    pub fn attempt_count(&self, test_id: &str) -> usize {
        let stats = self.node_stats.lock().expect("stats lock poisoned");
        stats.get(test_id).map_or(0, |e| e.outcomes.call.len())
    }

    /// Sum of every recorded call duration, for cumulative timing mode.
    pub fn call_duration_total(&self, test_id: &str) -> Duration {
        let stats = self.node_stats.lock().expect("stats lock poisoned");
        stats
            .get(test_id)
            .map_or(Duration::ZERO, |e| e.durations.call.iter().sum())
    }
}
