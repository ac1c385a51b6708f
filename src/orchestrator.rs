//! The per-test retry state machine.
//!
//! The host fires its make-report hook after every stage of every test;
//! the orchestrator inspects the call-stage result and, when a retry is
//! warranted, takes over: it forces fixture teardown toward a synthetic
//! sibling (so module- and class-scoped fixtures are released, not only
//! function-scoped ones), sleeps out the configured delay, re-runs setup
//! and call through the host hooks, and loops until the test passes, the
//! budget runs out, or the raised class stops clearing the filter. The
//! original call report is then rewritten in place with the last
//! attempt's outcome so the host's accounting sees a single test.
//!
//! Flaky teardowns are never retried: a preliminary teardown failure
//! marks the test failed and exits the loop immediately.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::config::registry::Registry;
use crate::filter::{ErrorClass, ExceptionFilter};
use crate::host::{
    CallInfo, FlakyMark, RaisedError, Stage, TestHost, TestItem, TestOutcome, TestReport,
    outcome_key,
};
use crate::stats::AttemptTracker;
use crate::transport::{AttemptFrame, ReportSink};

/// How the reported call duration is computed for a retried test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingMode {
    /// Report the last attempt's duration alone.
    Overwrite,
    /// Report the sum of every attempt's call duration.
    Cumulative,
}

/// A test's fully resolved retry policy: its `flaky` marker merged over
/// the session registry defaults.
#[derive(Debug, Clone)]
pub struct FlakyPolicy {
    pub retries: u32,
    pub delay: Duration,
    pub timing: TimingMode,
    pub only_on: HashSet<ErrorClass>,
    pub exclude: HashSet<ErrorClass>,
    pub condition: bool,
    pub outcome_label: String,
}

impl FlakyPolicy {
    pub fn resolve(mark: &FlakyMark, registry: &Registry) -> Self {
        let cumulative = mark
            .cumulative_timing
            .unwrap_or_else(|| registry.cumulative_timing());
        Self {
            retries: mark.retries.unwrap_or_else(|| registry.retries()),
            delay: mark.delay.unwrap_or_else(|| registry.retry_delay()),
            timing: if cumulative {
                TimingMode::Cumulative
            } else {
                TimingMode::Overwrite
            },
            only_on: mark.only_on.clone().unwrap_or_default(),
            exclude: mark.exclude.clone().unwrap_or_default(),
            condition: mark.condition.unwrap_or(true),
            outcome_label: registry.retry_outcome().to_string(),
        }
    }

    /// The marker's own exception filter. Fails when both sets are given.
    pub fn filter(&self) -> Result<ExceptionFilter, ConfigError> {
        ExceptionFilter::new(self.only_on.clone(), self.exclude.clone())
    }
}

/// What an attempt frame announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Retry,
    Fail,
    Exit,
    Pass,
}

impl Disposition {
    fn message(self, attempt: u32) -> String {
        match self {
            Disposition::Retry => format!(" failed on attempt {attempt}! Retrying!\n\t"),
            Disposition::Fail => format!(" failed after {attempt} attempts!\n\t"),
            Disposition::Exit => {
                format!(" teardown failed on attempt {attempt}! Exiting immediately!\n\t")
            }
            Disposition::Pass => format!(" passed on attempt {attempt}!\n\t"),
        }
    }
}

/// Maps the host's verbosity count onto a traceback line limit for the
/// retry narrative: unlimited at 5 and above.
pub fn trace_limit_from_verbosity(verbosity: u8) -> Option<usize> {
    match verbosity {
        0 => Some(1),
        v if v < 5 => Some(v as usize),
        _ => None,
    }
}

/// Drives retries for every test in the session.
pub struct RetryOrchestrator {
    registry: Arc<Registry>,
    tracker: AttemptTracker,
    sink: Arc<dyn ReportSink>,
    global_filter: ExceptionFilter,
    trace_limit: Option<usize>,
}

impl RetryOrchestrator {
    pub fn new(
        registry: Arc<Registry>,
        sink: Arc<dyn ReportSink>,
        global_filter: ExceptionFilter,
        trace_limit: Option<usize>,
    ) -> Self {
        Self {
            registry,
            tracker: AttemptTracker::new(),
            sink,
            global_filter,
            trace_limit,
        }
    }

    /// Starts attempt accounting for an item entering the run protocol.
    pub fn begin(&self, test_id: &str) {
        self.tracker.begin(test_id);
    }

    /// Records a stage report into the attempt accounting.
    pub fn record(&self, report: &TestReport) {
        self.tracker.record(report);
    }

    pub fn final_outcome(&self, test_id: &str) -> TestOutcome {
        self.tracker.simple_outcome(test_id)
    }

    pub fn total_duration(&self, test_id: &str) -> Duration {
        self.tracker.simple_duration(test_id)
    }

    pub fn attempt_count(&self, test_id: &str) -> usize {
        self.tracker.attempt_count(test_id)
    }

    /// Inspects a freshly built call report and runs the retry loop when
    /// the failure qualifies. On return the report reflects the final
    /// attempt.
    ///
    /// Only marker misconfiguration produces an error; test failures are
    /// the normal path and never propagate out of here.
    pub async fn maybe_retry(
        &self,
        host: &dyn TestHost,
        item: &TestItem,
        call: &CallInfo,
        original: &mut TestReport,
    ) -> Result<(), ConfigError> {
        if !should_handle_retry(call) {
            return Ok(());
        }
        // xfail tests do not raise skip control flow when they fail, but
        // their reports are still marked skipped.
        if original.outcome.is_skipped() {
            return Ok(());
        }
        let Some(mark) = &item.flaky else {
            return Ok(());
        };
        if mark.condition == Some(false) {
            return Ok(());
        }

        let policy = FlakyPolicy::resolve(mark, &self.registry);
        let filter = policy.filter()?.or(self.global_filter.clone());
        let Some(raised) = call.excinfo.as_ref() else {
            return Ok(());
        };
        if !filter.allows(Some(&raised.class)) {
            debug!(test = %item.id, class = %raised.class, "raised class not eligible for retry");
            return Ok(());
        }
        if policy.retries == 0 {
            return Ok(());
        }

        info!(test = %item.id, retries = policy.retries, "retrying failed test");
        self.retry_loop(host, item, &policy, &filter, raised.clone(), original)
            .await;
        Ok(())
    }

    async fn retry_loop(
        &self,
        host: &dyn TestHost,
        item: &TestItem,
        policy: &FlakyPolicy,
        filter: &ExceptionFilter,
        first_raised: RaisedError,
        original: &mut TestReport,
    ) {
        let mut attempts: u32 = 1;
        let mut last_raised = first_raised;

        loop {
            // Preliminary teardown toward a sibling with a fresh parent,
            // so every fixture scope narrower than the session is
            // finalized before setup runs again.
            let sentinel = TestItem::sentinel_sibling();
            let teardown_call =
                CallInfo::from_call(host.run_teardown(item, &sentinel), Stage::Teardown).await;
            self.tracker
                .record(&host.build_report(item, &teardown_call));

            if let Some(teardown_raised) = &teardown_call.excinfo {
                // Flaky teardowns are unacceptable; exit immediately.
                warn!(test = %item.id, "teardown failed during retry");
                item.stash.insert(outcome_key(), "failed".to_string());
                self.log_attempt(
                    attempts,
                    &item.name,
                    Some(teardown_raised),
                    Disposition::Exit,
                )
                .await;
                host.clear_captured_logs(item);
                break;
            }

            if attempts == 1 {
                // Re-emit the original report under the retry label so
                // live reporters render the interim indicator, then
                // restore the failure for accounting.
                original.outcome = TestOutcome::Label(policy.outcome_label.clone());
                host.log_report(original).await;
                original.outcome = TestOutcome::Failed;
            }
            self.log_attempt(attempts, &item.name, Some(&last_raised), Disposition::Retry)
                .await;
            tokio::time::sleep(policy.delay).await;

            host.reinit_fixtures(item).await;
            let setup_call = host.run_setup(item).await;
            self.tracker.record(&host.build_report(item, &setup_call));
            let retry_call = host.run_call(item).await;
            let retry_report = host.build_report(item, &retry_call);
            self.tracker.record(&retry_report);

            if let Some(raised) = &retry_call.excinfo {
                if raised.interactive {
                    host.exception_interact(item, &retry_call, &retry_report)
                        .await;
                }
            }

            attempts += 1;
            let raised_class = retry_call.excinfo.as_ref().map(|e| e.class.clone());
            let skipped_out = retry_report.outcome.is_skipped()
                || retry_call
                    .excinfo
                    .as_ref()
                    .is_some_and(RaisedError::is_skip);
            let should_keep_retrying = !retry_report.outcome.is_passed()
                && !skipped_out
                && attempts <= policy.retries
                && filter.allows(raised_class.as_ref());

            if !should_keep_retrying {
                original.outcome = retry_report.outcome.clone();
                original.longrepr = retry_report.longrepr.clone();
                original.duration = match policy.timing {
                    TimingMode::Overwrite => retry_report.duration,
                    TimingMode::Cumulative => self.tracker.call_duration_total(&item.id),
                };
                let disposition = if retry_report.outcome.is_failed() {
                    Disposition::Fail
                } else {
                    Disposition::Pass
                };
                self.log_attempt(
                    attempts,
                    &item.name,
                    retry_call.excinfo.as_ref(),
                    disposition,
                )
                .await;
                break;
            }

            if let Some(raised) = retry_call.excinfo {
                last_raised = raised;
            }
        }
    }

    async fn log_attempt(
        &self,
        attempt: u32,
        name: &str,
        raised: Option<&RaisedError>,
        disposition: Disposition,
    ) {
        let trace = raised.map(|r| self.format_trace(r)).unwrap_or_default();
        let frame = AttemptFrame::new(format!("\t{name}"), disposition.message(attempt), trace);
        self.sink.record_attempt(frame).await;
    }

    /// Renders a raised error for the narrative: up to `trace_limit`
    /// traceback lines, then the error itself, every line tab-indented.
    fn format_trace(&self, raised: &RaisedError) -> String {
        let mut lines: Vec<&str> = match self.trace_limit {
            Some(limit) => raised.trace.lines().take(limit).collect(),
            None => raised.trace.lines().collect(),
        };
        let rendered = raised.render();
        lines.push(&rendered);
        lines
            .join("\n")
            .replace('\n', "\n\t")
            .trim_end()
            .to_string()
    }
}

fn should_handle_retry(call: &CallInfo) -> bool {
    let Some(raised) = &call.excinfo else {
        return false;
    };
    // Setup retries may come later; teardown retries never will.
    if call.when != Stage::Call {
        return false;
    }
    !raised.is_skip()
}
