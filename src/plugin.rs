//! Host integration.
//!
//! [`RetryPlugin`] is the object a host runner registers: it owns the
//! session registry, picks the narrative sink for this process's role,
//! and forwards the host's per-item hooks into the orchestrator. The
//! binding points a host wires up:
//!
//! - session start: [`RetryPlugin::configure`], then
//!   [`RetryPlugin::apply_global_marker`] after collection
//! - per item: [`protocol_start`](RetryPlugin::protocol_start), one
//!   [`make_report`](RetryPlugin::make_report) per stage,
//!   [`protocol_end`](RetryPlugin::protocol_end)
//! - reporting: [`report_status`](RetryPlugin::report_status) for the
//!   synthetic outcome category,
//!   [`terminal_summary`](RetryPlugin::terminal_summary) at session end
//! - workers: [`session_finish`](RetryPlugin::session_finish) to flush
//!   and close the report client

use std::sync::Arc;

use tracing::debug;

use crate::config::registry::{
    EXCLUDED_EXCEPTIONS, FILTERED_EXCEPTIONS, OptionValue, Registry,
};
use crate::config::{ConfigError, SessionSettings, WorkerTopology};
use crate::filter::ExceptionFilter;
use crate::host::{
    CallInfo, FlakyMark, RetryHooks, Stash, Terminal, TestHost, TestItem, TestOutcome, TestReport,
    attempts_key, duration_key, outcome_key, server_port_key,
};
use crate::orchestrator::{RetryOrchestrator, trace_limit_from_verbosity};
use crate::transport::{OfflineSink, ReportClient, ReportSink, ReportServer};

/// Registration text for the `flaky` marker, for hosts that surface
/// marker documentation.
pub const FLAKY_MARKER_DESCRIPTION: &str = "flaky(retries=1, delay=0, only_on=..., exclude=..., \
    condition=..., cumulative_timing=...): indicate a flaky test which will be retried the \
    number of times specified with an (optional) specified delay between each attempt. \
    Collections of one or more error classes can be passed so that the test is retried only \
    on those classes, or excluding those classes. Any expression which returns a bool can be \
    used as a condition";

/// The synthetic outcome category for retried tests: not one of
/// pass/fail/skip/xfail/xpass/error.
#[derive(Debug, Clone)]
pub struct TestStatus {
    /// Category name counted in the session summary (the outcome label).
    pub category: String,
    /// Single-letter indicator for progress lines.
    pub short: &'static str,
    /// Verbose word for long-form progress lines.
    pub word: &'static str,
    /// How the indicator is styled.
    pub style: console::Style,
}

/// The retry engine, assembled for one session in one process.
pub struct RetryPlugin {
    registry: Arc<Registry>,
    orchestrator: RetryOrchestrator,
    sink: Arc<dyn ReportSink>,
    global_enabled: bool,
    server_port: Option<u16>,
}

impl std::fmt::Debug for RetryPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPlugin")
            .field("registry", &self.registry)
            .field("global_enabled", &self.global_enabled)
            .field("server_port", &self.server_port)
            .finish_non_exhaustive()
    }
}

impl RetryPlugin {
    /// Builds the plugin from the merged session settings and the user
    /// hooks. Configuration problems (bad values, conflicting filters, a
    /// transport that cannot open) abort the session here.
    pub async fn configure(
        settings: SessionSettings,
        hooks: &dyn RetryHooks,
    ) -> Result<Self, ConfigError> {
        let mut registry = Registry::new();
        registry.configure(&settings.args, &settings.file)?;

        let filtered = hooks.filtered_exceptions().unwrap_or_default();
        let excluded = hooks.excluded_exceptions().unwrap_or_default();
        registry.add(FILTERED_EXCEPTIONS, OptionValue::Classes(filtered.clone()))?;
        registry.add(EXCLUDED_EXCEPTIONS, OptionValue::Classes(excluded.clone()))?;
        let global_filter = ExceptionFilter::new(filtered, excluded)?;

        let global_enabled = settings.global_retries_enabled()?;
        let mut server_port = None;
        let sink: Arc<dyn ReportSink> = match settings.topology {
            WorkerTopology::Single => Arc::new(OfflineSink::new()),
            WorkerTopology::Controller => {
                let server = ReportServer::bind().await?;
                server_port = Some(server.port());
                Arc::new(server)
            }
            WorkerTopology::Worker { server_port } => {
                Arc::new(ReportClient::connect(server_port).await?)
            }
        };

        let registry = Arc::new(registry);
        let orchestrator = RetryOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&sink),
            global_filter,
            trace_limit_from_verbosity(settings.verbosity),
        );

        debug!(
            global_enabled,
            topology = ?settings.topology,
            "retry plugin configured"
        );
        Ok(Self {
            registry,
            orchestrator,
            sink,
            global_enabled,
            server_port,
        })
    }

    /// The resolved session defaults.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The report server's kernel-assigned port, on the controller.
    pub fn server_port(&self) -> Option<u16> {
        self.server_port
    }

    /// Copies the report server port into session-scoped storage so the
    /// host can hand it to each worker it spawns.
    pub fn publish_server_port(&self, session_stash: &Stash) {
        if let Some(port) = self.server_port {
            session_stash.insert(server_port_key(), port);
        }
    }

    /// Attaches the default `flaky` marker to every collected item that
    /// does not carry one, when session-level retries are enabled.
    pub fn apply_global_marker(&self, items: &mut [TestItem]) {
        if !self.global_enabled {
            return;
        }
        let mark = FlakyMark::new().with_retries(self.registry.retries());
        for item in items.iter_mut().filter(|i| i.flaky.is_none()) {
            item.flaky = Some(mark.clone());
        }
    }

    /// Brackets the start of an item's run protocol.
    pub fn protocol_start(&self, item: &TestItem) {
        self.orchestrator.begin(&item.id);
    }

    /// Brackets the end of an item's run protocol: publishes the derived
    /// outcome, attempt count and duration into the item stash.
    pub fn protocol_end(&self, item: &TestItem) {
        let outcome = self.orchestrator.final_outcome(&item.id);
        item.stash
            .insert(outcome_key(), outcome.as_str().to_string());
        item.stash
            .insert(attempts_key(), self.orchestrator.attempt_count(&item.id));
        item.stash.insert(
            duration_key(),
            self.orchestrator.total_duration(&item.id).as_secs_f64(),
        );
    }

    /// The host's make-report hook: records the stage into the attempt
    /// accounting, keeps the stash outcome current, and hands call-stage
    /// failures to the retry state machine. The report is updated in
    /// place when retries run.
    pub async fn make_report(
        &self,
        host: &dyn TestHost,
        item: &TestItem,
        call: &CallInfo,
        report: &mut TestReport,
    ) -> Result<(), ConfigError> {
        self.orchestrator.record(report);
        // Keep a per-stage outcome visible until the protocol completes.
        item.stash
            .insert(outcome_key(), report.outcome.as_str().to_string());
        self.orchestrator.maybe_retry(host, item, call, report).await
    }

    /// Maps reports carrying the configured retry label onto the
    /// synthetic `R` category; everything else is the host's business.
    pub fn report_status(&self, report: &TestReport) -> Option<TestStatus> {
        match &report.outcome {
            TestOutcome::Label(label) if label == self.registry.retry_outcome() => {
                Some(TestStatus {
                    category: label.clone(),
                    short: "R",
                    word: "RETRY",
                    style: console::Style::new().yellow(),
                })
            }
            _ => None,
        }
    }

    /// Renders the session-end retry section. On the controller this
    /// first stops the report server, so every worker narrative already
    /// received is in the buffer before it is read.
    pub async fn terminal_summary(&self, terminal: &mut dyn Terminal) {
        self.sink.shutdown().await;
        self.sink.flush_to(terminal).await;
    }

    /// Flushes and closes the transport. Workers call this at session
    /// end so the controller sees EOF and no sockets leak.
    pub async fn session_finish(&self) {
        self.sink.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileSettings, RetryArgs};
    use crate::filter::ErrorClass;
    use crate::host::Stage;
    use crate::host::mock::{BufferTerminal, CallScript, MockHost, SetupScript, TestScript};
    use std::collections::HashSet;
    use std::time::Duration;

    struct FilterHooks {
        only: Option<&'static [&'static str]>,
        exclude: Option<&'static [&'static str]>,
    }

    impl RetryHooks for FilterHooks {
        fn filtered_exceptions(&self) -> Option<HashSet<ErrorClass>> {
            self.only
                .map(|names| names.iter().map(|n| ErrorClass::from(*n)).collect())
        }

        fn excluded_exceptions(&self) -> Option<HashSet<ErrorClass>> {
            self.exclude
                .map(|names| names.iter().map(|n| ErrorClass::from(*n)).collect())
        }
    }

    fn retries_args(n: u32) -> SessionSettings {
        SessionSettings::new(
            RetryArgs {
                retries: Some(n),
                ..RetryArgs::default()
            },
            FileSettings::default(),
        )
    }

    async fn plugin_with(settings: SessionSettings) -> RetryPlugin {
        RetryPlugin::configure(settings, &()).await.unwrap()
    }

    /// Session summary accounting for one item driven through the full
    /// protocol: (final outcome, number of retried-category reports).
    struct RunSummary {
        report: Option<TestReport>,
        retried: usize,
    }

    /// Drives one item the way a host runner would: protocol bracket,
    /// one make-report per stage, final teardown. Counts how many logged
    /// reports landed in the synthetic retry category.
    async fn run_item(plugin: &RetryPlugin, host: &MockHost, item: &TestItem) -> RunSummary {
        plugin.protocol_start(item);

        let setup_call = host.run_setup(item).await;
        let mut setup_report = host.build_report(item, &setup_call);
        plugin
            .make_report(host, item, &setup_call, &mut setup_report)
            .await
            .unwrap();

        let mut final_report = None;
        if setup_report.outcome.is_passed() {
            let call = host.run_call(item).await;
            let mut report = host.build_report(item, &call);
            plugin
                .make_report(host, item, &call, &mut report)
                .await
                .unwrap();

            let next = TestItem::new("next::test", "next");
            let teardown_call =
                CallInfo::from_call(host.run_teardown(item, &next), Stage::Teardown).await;
            let mut teardown_report = host.build_report(item, &teardown_call);
            plugin
                .make_report(host, item, &teardown_call, &mut teardown_report)
                .await
                .unwrap();
            final_report = Some(report);
        }

        plugin.protocol_end(item);

        let retried = host
            .logged_reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| plugin.report_status(r).is_some())
            .count();
        RunSummary {
            report: final_report,
            retried,
        }
    }

    #[tokio::test]
    async fn passing_test_stashes_derived_values() {
        let plugin = plugin_with(retries_args(1)).await;
        let host = MockHost::new();
        let mut items = vec![TestItem::new("m::test_pass", "m")];
        plugin.apply_global_marker(&mut items);
        let item = &items[0];

        let summary = run_item(&plugin, &host, item).await;

        assert!(summary.report.unwrap().outcome.is_passed());
        assert_eq!(summary.retried, 0);
        assert_eq!(item.stash.get(outcome_key()), Some("passed".to_string()));
        assert_eq!(item.stash.get(attempts_key()), Some(1));
        assert!(item.stash.get(duration_key()).unwrap() > 0.0);
    }

    #[tokio::test]
    async fn flaky_test_counts_one_retry_regardless_of_attempts() {
        let plugin = plugin_with(retries_args(3)).await;
        let host = MockHost::new();
        let mut items = vec![TestItem::new("m::test_flaky", "m")];
        plugin.apply_global_marker(&mut items);
        let item = &items[0];
        host.script(
            &item.id,
            TestScript::calls(vec![
                CallScript::Fail("AssertionError"),
                CallScript::Fail("AssertionError"),
                CallScript::Pass,
            ]),
        );

        let summary = run_item(&plugin, &host, item).await;

        // Three attempts, but exactly one entry in the retried category.
        assert!(summary.report.unwrap().outcome.is_passed());
        assert_eq!(summary.retried, 1);
        assert_eq!(item.stash.get(attempts_key()), Some(3));
        assert_eq!(item.stash.get(outcome_key()), Some("passed".to_string()));
    }

    #[tokio::test]
    async fn exhausted_test_still_counts_one_retry() {
        let plugin = plugin_with(retries_args(1)).await;
        let host = MockHost::new();
        let mut items = vec![TestItem::new("m::test_fails", "m")];
        plugin.apply_global_marker(&mut items);
        let item = &items[0];
        host.script(
            &item.id,
            TestScript::calls(vec![CallScript::Fail("AssertionError")]),
        );

        let summary = run_item(&plugin, &host, item).await;

        assert!(summary.report.unwrap().outcome.is_failed());
        assert_eq!(summary.retried, 1);
        assert_eq!(item.stash.get(outcome_key()), Some("failed".to_string()));
    }

    #[tokio::test]
    async fn skipped_setup_stashes_skipped_and_zero_attempts() {
        let plugin = plugin_with(retries_args(1)).await;
        let host = MockHost::new();
        let mut items = vec![TestItem::new("m::test_skip", "m")];
        plugin.apply_global_marker(&mut items);
        let item = &items[0];
        host.script(
            &item.id,
            TestScript {
                calls: vec![CallScript::Pass],
                setup: Some(SetupScript::Skip),
                ..TestScript::default()
            },
        );

        let summary = run_item(&plugin, &host, item).await;

        assert!(summary.report.is_none());
        assert_eq!(summary.retried, 0);
        assert_eq!(item.stash.get(outcome_key()), Some("skipped".to_string()));
        assert_eq!(item.stash.get(attempts_key()), Some(0));
    }

    #[tokio::test]
    async fn global_marker_only_lands_on_unmarked_items() {
        let plugin = plugin_with(retries_args(2)).await;
        let mut items = vec![
            TestItem::new("m::test_plain", "m"),
            TestItem::new("m::test_marked", "m").with_flaky(FlakyMark::new().with_retries(5)),
        ];
        plugin.apply_global_marker(&mut items);

        assert_eq!(items[0].flaky.as_ref().unwrap().retries, Some(2));
        assert_eq!(items[1].flaky.as_ref().unwrap().retries, Some(5));
    }

    #[tokio::test]
    async fn no_global_marker_without_a_retry_count() {
        let plugin = plugin_with(SessionSettings::default()).await;
        let mut items = vec![TestItem::new("m::test_plain", "m")];
        plugin.apply_global_marker(&mut items);
        assert!(items[0].flaky.is_none());

        // A failing unmarked test is left alone entirely.
        let host = MockHost::new();
        host.script(
            "m::test_plain",
            TestScript::calls(vec![CallScript::Fail("AssertionError")]),
        );
        let summary = run_item(&plugin, &host, &items[0]).await;
        assert!(summary.report.unwrap().outcome.is_failed());
        assert_eq!(summary.retried, 0);
        assert_eq!(host.counts("m::test_plain").calls, 1);
    }

    #[tokio::test]
    async fn marker_overrides_command_line_options() {
        let plugin = plugin_with(retries_args(2)).await;
        let host = MockHost::new();
        let mut items = vec![
            TestItem::new("m::test_marked", "m").with_flaky(FlakyMark::new().with_retries(3)),
            TestItem::new("m::test_default", "m"),
        ];
        plugin.apply_global_marker(&mut items);
        for item in &items {
            host.script(
                &item.id,
                TestScript::calls(vec![CallScript::Fail("AssertionError")]),
            );
            run_item(&plugin, &host, item).await;
        }

        assert_eq!(items[0].stash.get(attempts_key()), Some(4));
        assert_eq!(items[1].stash.get(attempts_key()), Some(3));
    }

    #[tokio::test]
    async fn custom_outcome_label_flows_through_status_mapping() {
        let settings = SessionSettings::new(
            RetryArgs {
                retries: Some(1),
                retry_outcome: Some("redo".to_string()),
                ..RetryArgs::default()
            },
            FileSettings::default(),
        );
        let plugin = plugin_with(settings).await;
        let host = MockHost::new();
        let mut items = vec![TestItem::new("m::test_flaky", "m")];
        plugin.apply_global_marker(&mut items);
        let item = &items[0];
        host.script(
            &item.id,
            TestScript::calls(vec![CallScript::Fail("AssertionError"), CallScript::Pass]),
        );

        run_item(&plugin, &host, item).await;

        let logged = host.logged_reports.lock().unwrap();
        assert_eq!(logged[0].outcome, TestOutcome::Label("redo".to_string()));
        let status = plugin.report_status(&logged[0]).unwrap();
        assert_eq!(status.category, "redo");
        assert_eq!(status.short, "R");
        assert_eq!(status.word, "RETRY");

        // A label that is not the configured one maps to nothing.
        let mut foreign = logged[0].clone();
        foreign.outcome = TestOutcome::Label("retried".to_string());
        assert!(plugin.report_status(&foreign).is_none());
    }

    #[tokio::test]
    async fn file_settings_configure_the_session() {
        let settings = SessionSettings::new(
            RetryArgs::default(),
            FileSettings::parse(
                r#"
                retries = "1"
                cumulative_timing = "true"
                "#,
            )
            .unwrap(),
        );
        let plugin = plugin_with(settings).await;
        assert_eq!(plugin.registry().retries(), 1);
        assert!(plugin.registry().cumulative_timing());

        let host = MockHost::new();
        let mut items = vec![TestItem::new("m::test_ini", "m")];
        plugin.apply_global_marker(&mut items);
        let item = &items[0];
        host.script(
            &item.id,
            TestScript {
                calls: vec![CallScript::Fail("AssertionError"), CallScript::Pass],
                call_durations: vec![Duration::from_millis(30), Duration::from_millis(20)],
                ..TestScript::default()
            },
        );

        let summary = run_item(&plugin, &host, item).await;

        // Cumulative timing from the file applies to the final report.
        assert_eq!(
            summary.report.unwrap().duration,
            Duration::from_millis(50)
        );
    }

    #[tokio::test]
    async fn global_hook_filter_gates_unmarked_tests() {
        let hooks = FilterHooks {
            only: Some(&["IndexError"]),
            exclude: None,
        };
        let plugin = RetryPlugin::configure(retries_args(1), &hooks).await.unwrap();
        let host = MockHost::new();
        let mut items = vec![TestItem::new("m::test_wrong_class", "m")];
        plugin.apply_global_marker(&mut items);
        let item = &items[0];
        host.script(
            &item.id,
            TestScript::calls(vec![CallScript::Fail("ValueError"), CallScript::Pass]),
        );

        let summary = run_item(&plugin, &host, item).await;

        // ValueError is not in the global include list: no retry.
        assert!(summary.report.unwrap().outcome.is_failed());
        assert_eq!(summary.retried, 0);
        assert_eq!(host.counts(&item.id).calls, 1);
    }

    #[tokio::test]
    async fn conflicting_hook_filters_abort_configuration() {
        let hooks = FilterHooks {
            only: Some(&["IndexError"]),
            exclude: Some(&["ValueError"]),
        };
        let err = RetryPlugin::configure(retries_args(1), &hooks)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingFilters));
    }

    #[tokio::test]
    async fn offline_summary_renders_the_retry_section() {
        let plugin = plugin_with(retries_args(1)).await;
        let host = MockHost::new();
        let mut items = vec![TestItem::new("m::test_flaky", "m")];
        plugin.apply_global_marker(&mut items);
        host.script(
            "m::test_flaky",
            TestScript::calls(vec![CallScript::Fail("AssertionError"), CallScript::Pass]),
        );
        run_item(&plugin, &host, &items[0]).await;

        let mut terminal = BufferTerminal::default();
        plugin.terminal_summary(&mut terminal).await;

        assert!(terminal.output.contains("the following tests were retried"));
        assert!(terminal.output.contains("test_flaky passed on attempt 2!"));
        assert!(terminal.output.contains("end of test retry report"));
    }

    #[tokio::test]
    async fn controller_collects_contiguous_worker_narratives() {
        let controller = plugin_with(
            retries_args(3).with_topology(WorkerTopology::Controller),
        )
        .await;
        let port = controller.server_port().unwrap();

        let session_stash = Stash::new();
        controller.publish_server_port(&session_stash);
        assert_eq!(session_stash.get(server_port_key()), Some(port));

        let run_worker = |test_id: &'static str, script: TestScript| async move {
            let worker = plugin_with(
                retries_args(3).with_topology(WorkerTopology::Worker { server_port: port }),
            )
            .await;
            let host = MockHost::new();
            let mut items = vec![TestItem::new(test_id, "m")];
            worker.apply_global_marker(&mut items);
            host.script(test_id, script);
            run_item(&worker, &host, &items[0]).await;
            worker.session_finish().await;
        };

        // Two workers running in parallel, finishing at different times.
        tokio::join!(
            run_worker(
                "m::test_a",
                TestScript {
                    calls: vec![
                        CallScript::Fail("AssertionError"),
                        CallScript::Fail("AssertionError"),
                        CallScript::Pass,
                    ],
                    ..TestScript::default()
                }
            ),
            run_worker(
                "m::test_b",
                TestScript::calls(vec![CallScript::Fail("AssertionError"), CallScript::Pass]),
            ),
        );

        let mut terminal = BufferTerminal::default();
        controller.terminal_summary(&mut terminal).await;
        let narrative = &terminal.output;

        for expected in [
            "test_a failed on attempt 1! Retrying!",
            "test_a failed on attempt 2! Retrying!",
            "test_a passed on attempt 3!",
            "test_b failed on attempt 1! Retrying!",
            "test_b passed on attempt 2!",
        ] {
            assert!(narrative.contains(expected), "missing {expected:?}");
        }

        // Each test's narrative is one contiguous block.
        let a_start = narrative.find("test_a failed on attempt 1").unwrap();
        let a_end = narrative.find("test_a passed on attempt 3").unwrap();
        assert!(a_start < a_end);
        assert!(!narrative[a_start..a_end].contains("test_b"));

        let b_start = narrative.find("test_b failed on attempt 1").unwrap();
        let b_end = narrative.find("test_b passed on attempt 2").unwrap();
        assert!(b_start < b_end);
        assert!(!narrative[b_start..b_end].contains("test_a"));
    }
}
