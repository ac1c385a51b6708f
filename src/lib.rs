//! # reflake
//!
//! A flaky-test retry engine for host test runners: re-executes failed
//! tests with per-test policy, forces fixture re-initialization between
//! attempts, and aggregates retry narratives across parallel workers.
//!
//! ## Overview
//!
//! reflake is not a test runner. It plugs into one: the host owns test
//! discovery, fixture execution and reporting, and exposes the small
//! [`TestHost`] surface this crate drives. On top of that surface reflake
//! provides:
//!
//! - **Per-test retry policy** via the `flaky` marker (retries, delay,
//!   exception-class filters, conditional activation, timing mode)
//! - **Forced fixture teardown** between attempts, so module- and
//!   class-scoped state is rebuilt, not reused
//! - **Coalesced reporting**: all attempts of a test collapse into one
//!   final report, plus a single entry in the synthetic `retried`
//!   outcome category
//! - **Cross-process aggregation**: parallel workers stream their retry
//!   narratives over loopback TCP to the controller, which renders one
//!   coherent session-end report
//!
//! ## Architecture
//!
//! The crate is organized around four subsystems:
//!
//! ### Host contract ([`host`])
//!
//! The traits and data types shared with the host runner: [`TestHost`],
//! [`RetryHooks`], [`Terminal`], plus [`TestItem`], [`TestReport`] and
//! the typed per-item [`Stash`].
//!
//! ### Configuration ([`config`])
//!
//! [`RetryArgs`] (a `clap` group the host flattens into its CLI),
//! [`FileSettings`] (ini-style keys coerced from the project file), and
//! the per-session [`Registry`] of resolved defaults.
//!
//! ### Retry engine ([`orchestrator`], [`stats`], [`filter`])
//!
//! [`RetryOrchestrator`] is the per-test state machine;
//! [`ExceptionFilter`] decides which raised classes are eligible;
//! attempt accounting derives the stash values user code reads back.
//!
//! ### Transport ([`transport`])
//!
//! [`ReportSink`] and its three variants: in-memory for single-process
//! runs, a TCP server on the controller, and a batching TCP client in
//! each worker.
//!
//! ## Quick start
//!
//! ```no_run
//! use reflake::{RetryPlugin, SessionSettings, RetryArgs, FileSettings};
//!
//! # async fn session(host: impl reflake::TestHost, items: Vec<reflake::TestItem>) -> anyhow::Result<()> {
//! // At session start, after parsing the host CLI and project file:
//! let settings = SessionSettings::new(
//!     RetryArgs { retries: Some(2), ..RetryArgs::default() },
//!     FileSettings::default(),
//! );
//! let plugin = RetryPlugin::configure(settings, &()).await?;
//!
//! // After collection:
//! let mut items = items;
//! plugin.apply_global_marker(&mut items);
//!
//! // Per item, the host invokes protocol_start / make_report (one per
//! // stage) / protocol_end; at session end:
//! let mut terminal = reflake::ConsoleTerminal::new();
//! plugin.terminal_summary(&mut terminal).await;
//! # Ok(())
//! # }
//! ```
//!
//! [`TestHost`]: host::TestHost
//! [`RetryHooks`]: host::RetryHooks
//! [`Terminal`]: host::Terminal
//! [`TestItem`]: host::TestItem
//! [`TestReport`]: host::TestReport
//! [`Stash`]: host::Stash
//! [`RetryArgs`]: config::RetryArgs
//! [`FileSettings`]: config::FileSettings
//! [`Registry`]: config::Registry
//! [`RetryOrchestrator`]: orchestrator::RetryOrchestrator
//! [`ExceptionFilter`]: filter::ExceptionFilter
//! [`ReportSink`]: transport::ReportSink

pub mod config;
pub mod filter;
pub mod host;
pub mod orchestrator;
pub mod plugin;
pub mod stats;
pub mod transport;

// Re-export the host-facing surface.
// These are the types a host runner needs to embed the engine.

pub use config::{ConfigError, FileSettings, Registry, RetryArgs, SessionSettings, WorkerTopology};
pub use filter::{ErrorClass, ExceptionFilter};
pub use host::{
    CallInfo, FlakyMark, RaisedError, RetryHooks, Stage, Stash, StashKey, Terminal, TestHost,
    TestItem, TestOutcome, TestReport, attempts_key, duration_key, outcome_key, server_port_key,
};
pub use orchestrator::{FlakyPolicy, RetryOrchestrator, TimingMode};
pub use plugin::{FLAKY_MARKER_DESCRIPTION, RetryPlugin, TestStatus};
pub use transport::{AttemptFrame, ConsoleTerminal, OfflineSink, ReportClient, ReportServer, ReportSink};
