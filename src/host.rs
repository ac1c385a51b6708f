//! Host test-framework contract.
//!
//! reflake does not discover or execute tests itself. The host runner owns
//! the test protocol (setup, call, teardown, reporting) and exposes the
//! narrow surface defined here so the retry engine can drive extra attempts
//! through it. Everything in this module is the vocabulary shared between
//! the engine and the host:
//!
//! - [`TestHost`] - the per-stage hooks the engine invokes during a retry
//! - [`RetryHooks`] - optional session hooks the user may implement
//! - [`Terminal`] - the output seam the final retry report is written to
//! - [`TestItem`], [`TestReport`], [`CallInfo`], [`RaisedError`] - the data
//!   carried across the boundary
//! - [`Stash`] / [`StashKey`] - typed per-item storage the host and user
//!   code read derived values from
//!
//! # Contract notes
//!
//! The host must guarantee that [`TestHost::reinit_fixtures`] leaves the
//! item in a state where setup can run again, and that
//! [`TestHost::run_teardown`] finalizes every fixture scope narrower than
//! the session when the next item belongs to a different parent container.
//! These two requirements are what make forced re-setup between attempts
//! observe fresh state.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::filter::ErrorClass;

/// The three stages of a single test attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Setup,
    Call,
    Teardown,
}

impl Stage {
    /// All stages, in protocol order.
    pub const ALL: [Stage; 3] = [Stage::Setup, Stage::Call, Stage::Teardown];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::Call => "call",
            Stage::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single stage report.
///
/// `Label` is the synthetic interim outcome used while a test is being
/// retried (default label `"retried"`). It is never the final outcome of a
/// test; the engine restores `Failed` after re-logging the report so the
/// host's pass/fail accounting stays correct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    Label(String),
}

impl TestOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            TestOutcome::Passed => "passed",
            TestOutcome::Failed => "failed",
            TestOutcome::Skipped => "skipped",
            TestOutcome::Label(label) => label,
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, TestOutcome::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TestOutcome::Failed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TestOutcome::Skipped)
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised by a test stage, as reported by the host.
///
/// The host maps whatever its failure representation is (panic payload,
/// assertion error, harness exception) onto a named [`ErrorClass`] plus a
/// human-readable message and an optional formatted traceback.
#[derive(Debug, Clone)]
pub struct RaisedError {
    pub class: ErrorClass,
    pub message: String,
    /// Pre-formatted traceback, one frame per line. May be empty.
    pub trace: String,
    /// Whether the host would present this error interactively. Control
    /// flow errors (debugger quit and friends) set this to `false`.
    pub interactive: bool,
}

impl RaisedError {
    pub fn new(class: impl Into<ErrorClass>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            trace: String::new(),
            interactive: true,
        }
    }

    /// A skip raised as control flow (`Skipped` class).
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::skipped(),
            message: reason.into(),
            trace: String::new(),
            interactive: false,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }

    pub fn non_interactive(mut self) -> Self {
        self.interactive = false;
        self
    }

    pub fn is_skip(&self) -> bool {
        self.class == ErrorClass::skipped()
    }

    /// One-line rendering used for report `longrepr` fields.
    pub fn render(&self) -> String {
        format!("{}: {}", self.class, self.message)
    }
}

/// Result of invoking one stage: what was raised (if anything) and how
/// long it took.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub when: Stage,
    pub excinfo: Option<RaisedError>,
    pub duration: Duration,
}

impl CallInfo {
    pub fn new(when: Stage, excinfo: Option<RaisedError>, duration: Duration) -> Self {
        Self {
            when,
            excinfo,
            duration,
        }
    }

    /// Runs a fallible stage future, capturing the raised error and the
    /// elapsed time.
    pub async fn from_call<F>(fut: F, when: Stage) -> Self
    where
        F: Future<Output = Result<(), RaisedError>>,
    {
        let start = Instant::now();
        let excinfo = fut.await.err();
        Self {
            when,
            excinfo,
            duration: start.elapsed(),
        }
    }

    pub fn raised(&self) -> bool {
        self.excinfo.is_some()
    }
}

/// A stage report for a single test, borrowed from the host's reporting
/// model. The engine mutates the original call-stage report in place when
/// finalizing a retried test.
#[derive(Debug, Clone)]
pub struct TestReport {
    /// Unique id of the test item this report belongs to.
    pub test_id: String,
    /// Display name used in the retry narrative.
    pub name: String,
    pub when: Stage,
    pub outcome: TestOutcome,
    pub duration: Duration,
    /// Rendered failure representation, if the stage failed.
    pub longrepr: Option<String>,
    /// Set when the report comes from an xfail-marked test.
    pub wasxfail: bool,
}

/// Per-test retry policy attached by the user (or by the engine itself
/// when session-level retries are enabled). Unset fields fall back to the
/// session registry defaults at resolution time.
#[derive(Debug, Clone, Default)]
pub struct FlakyMark {
    pub retries: Option<u32>,
    pub delay: Option<Duration>,
    pub only_on: Option<std::collections::HashSet<ErrorClass>>,
    pub exclude: Option<std::collections::HashSet<ErrorClass>>,
    pub condition: Option<bool>,
    pub cumulative_timing: Option<bool>,
}

impl FlakyMark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_only_on<I>(mut self, classes: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ErrorClass>,
    {
        self.only_on = Some(classes.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_exclude<I>(mut self, classes: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ErrorClass>,
    {
        self.exclude = Some(classes.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_condition(mut self, condition: bool) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_cumulative_timing(mut self, cumulative: bool) -> Self {
        self.cumulative_timing = Some(cumulative);
        self
    }
}

/// A collected test item, as the host presents it to the engine.
pub struct TestItem {
    /// Unique id within the session (the host's node id).
    pub id: String,
    /// Short display name.
    pub name: String,
    /// Id of the parent container (module, class, file). Preliminary
    /// teardown relies on the sentinel sibling having a different parent.
    pub parent: String,
    /// The `flaky` marker, if the test carries one.
    pub flaky: Option<FlakyMark>,
    /// Typed per-item storage. Derived values land here under
    /// [`outcome_key`], [`attempts_key`] and [`duration_key`].
    pub stash: Stash,
}

impl TestItem {
    pub fn new(id: impl Into<String>, parent: impl Into<String>) -> Self {
        let id = id.into();
        let name = id
            .rsplit("::")
            .next()
            .map(str::to_string)
            .unwrap_or_else(|| id.clone());
        Self {
            id,
            name,
            parent: parent.into(),
            flaky: None,
            stash: Stash::new(),
        }
    }

    pub fn with_flaky(mut self, mark: FlakyMark) -> Self {
        self.flaky = Some(mark);
        self
    }

    /// Builds the synthetic "next item" handed to preliminary teardown.
    ///
    /// Its parent id is freshly generated, so it never shares a module or
    /// class container with a real item and the host must finalize every
    /// scope narrower than the session.
    pub fn sentinel_sibling() -> Self {
        let parent = uuid::Uuid::new_v4().to_string();
        Self {
            id: format!("{parent}::sentinel"),
            name: "sentinel".to_string(),
            parent,
            flaky: None,
            stash: Stash::new(),
        }
    }
}

/// The subset of the host runner's protocol the retry engine drives.
///
/// The host serializes per-item hooks; the engine inherits that
/// serialization and never invokes these concurrently for one item.
#[async_trait]
pub trait TestHost: Send + Sync {
    /// Runs fixture setup for the item, returning what was raised and the
    /// elapsed time.
    async fn run_setup(&self, item: &TestItem) -> CallInfo;

    /// Runs the test body.
    async fn run_call(&self, item: &TestItem) -> CallInfo;

    /// Runs fixture teardown as though the session were moving on to
    /// `nextitem`. All fixture scopes not shared with `nextitem` must be
    /// finalized.
    async fn run_teardown(&self, item: &TestItem, nextitem: &TestItem) -> Result<(), RaisedError>;

    /// Resets the item's fixture request state so setup can run again.
    async fn reinit_fixtures(&self, item: &TestItem);

    /// Builds a stage report from an item and a completed stage call. The
    /// host owns outcome semantics (including xfail handling).
    fn build_report(&self, item: &TestItem, call: &CallInfo) -> TestReport;

    /// Re-emits a report through the host's live reporting pipeline.
    async fn log_report(&self, report: &TestReport);

    /// Presents a raised error interactively, if the host supports it.
    async fn exception_interact(&self, item: &TestItem, call: &CallInfo, report: &TestReport);

    /// Discards captured-log state for the item so a redundant final
    /// teardown does not fail on missing records.
    fn clear_captured_logs(&self, item: &TestItem);
}

/// Optional session hooks implemented in the user's configuration layer.
///
/// Both default to `None`, meaning no global filter is installed.
pub trait RetryHooks: Send + Sync {
    /// Error classes eligible for retry session-wide. Tests failing with
    /// any other class are not retried unless their own marker says so.
    fn filtered_exceptions(&self) -> Option<std::collections::HashSet<ErrorClass>> {
        None
    }

    /// Error classes excluded from retry session-wide.
    fn excluded_exceptions(&self) -> Option<std::collections::HashSet<ErrorClass>> {
        None
    }
}

/// The empty hook set.
impl RetryHooks for () {}

/// Where the session-end retry report is written.
pub trait Terminal: Send {
    /// Writes a full-width `=`-ruled section title.
    fn section(&mut self, title: &str);

    /// Writes raw text.
    fn write(&mut self, text: &str);
}

// Typed per-item storage.
//
// Keys are allocated process-wide and carry their value type, so user code
// cannot read a key at the wrong type. Values are stored type-erased.

static NEXT_STASH_KEY: AtomicU64 = AtomicU64::new(0);

/// A typed key into a [`Stash`].
pub struct StashKey<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StashKey<T> {
    /// Allocates a fresh key. Each call returns a distinct key.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            id: NEXT_STASH_KEY.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for StashKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StashKey<T> {}

impl<T> fmt::Debug for StashKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StashKey({})", self.id)
    }
}

/// Type-safe key-value storage attached to each [`TestItem`].
///
/// Interior-mutable so the engine can write derived values while the host
/// holds the item.
#[derive(Default)]
pub struct Stash {
    map: Mutex<HashMap<u64, Box<dyn Any + Send>>>,
}

impl Stash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + 'static>(&self, key: StashKey<T>, value: T) {
        self.map
            .lock()
            .expect("stash lock poisoned")
            .insert(key.id, Box::new(value));
    }

    pub fn get<T: Clone + Send + 'static>(&self, key: StashKey<T>) -> Option<T> {
        self.map
            .lock()
            .expect("stash lock poisoned")
            .get(&key.id)
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains<T: Send + 'static>(&self, key: StashKey<T>) -> bool {
        self.map
            .lock()
            .expect("stash lock poisoned")
            .contains_key(&key.id)
    }
}

impl fmt::Debug for Stash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.map.lock().map(|m| m.len()).unwrap_or(0);
        write!(f, "Stash({len} entries)")
    }
}

/// Final outcome string for the item (`"passed"`, `"failed"`,
/// `"skipped"` or a custom label).
pub fn outcome_key() -> StashKey<String> {
    static KEY: OnceLock<StashKey<String>> = OnceLock::new();
    *KEY.get_or_init(StashKey::new)
}

/// Number of call-stage executions for the item.
pub fn attempts_key() -> StashKey<usize> {
    static KEY: OnceLock<StashKey<usize>> = OnceLock::new();
    *KEY.get_or_init(StashKey::new)
}

/// Total reported duration for the item, in seconds.
pub fn duration_key() -> StashKey<f64> {
    static KEY: OnceLock<StashKey<f64>> = OnceLock::new();
    *KEY.get_or_init(StashKey::new)
}

/// Kernel-assigned port of the controller's report server, published for
/// workers through session-scoped configuration.
pub fn server_port_key() -> StashKey<u16> {
    static KEY: OnceLock<StashKey<u16>> = OnceLock::new();
    *KEY.get_or_init(StashKey::new)
}
