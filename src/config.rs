//! Session configuration for the retry engine.
//!
//! Settings arrive from three places, later sources winning when a value
//! is present: an ini-style project file ([`FileSettings`]), the host's
//! command line ([`RetryArgs`], a `clap` group the host flattens into its
//! own parser), and the user hooks that contribute the global exception
//! sets. The merged result lives in the process-wide
//! [`Registry`](registry::Registry).
//!
//! File values are tolerated as strings and coerced, the way ini-style
//! configuration travels: `retries = "2"` and `retries = 2` are both
//! accepted.

pub mod registry;

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub use registry::Registry;

/// Errors raised while configuring the retry engine.
///
/// These surface to the session as hook-time failures and abort the run;
/// they are never produced by a failing test.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A config name that was never registered was read or written.
    #[error("{name} is not a recognized retry option")]
    UnknownOption { name: String },

    /// `add` was called for a name that already exists.
    #[error("{name} is already a registered retry option")]
    AlreadyRegistered { name: String },

    /// `only_on` and `exclude` were both supplied, on a marker or through
    /// the session hooks.
    #[error(
        "filtered and excluded exceptions are exclusive and cannot be defined simultaneously"
    )]
    ConflictingFilters,

    /// A file or CLI value could not be coerced to the option's type.
    #[error("invalid value {value:?} for {key}: expected {expected}")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    /// The report transport could not be opened at session start.
    #[error("failed to open retry report transport: {0}")]
    Transport(#[from] std::io::Error),
}

/// Command-line flags for the retry engine.
///
/// Hosts embed this with `#[command(flatten)]`. Every flag is optional;
/// an absent flag leaves the file value (or the built-in default) in
/// effect.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct RetryArgs {
    /// Number of times to retry failed tests. 0 disables global retry.
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Delay (in seconds) between retries.
    #[arg(long = "retry-delay", value_name = "SECONDS")]
    pub retry_delay: Option<f64>,

    /// Include retry durations in the overall reported test duration.
    #[arg(long = "cumulative-timing", value_name = "BOOL")]
    pub cumulative_timing: Option<bool>,

    /// Outcome label reported for retried tests.
    #[arg(long = "retry-outcome", value_name = "LABEL")]
    pub retry_outcome: Option<String>,
}

/// Retry keys read from the host's project configuration file.
///
/// Values are kept raw and coerced on demand so string-typed ini layers
/// and native TOML both work.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileSettings {
    pub retries: Option<toml::Value>,
    pub retry_delay: Option<toml::Value>,
    pub cumulative_timing: Option<toml::Value>,
    pub retry_outcome: Option<toml::Value>,
}

impl FileSettings {
    /// Parses the four retry keys from a TOML document.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse retry configuration")
    }

    /// Reads and parses a project configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn retries(&self) -> Result<Option<u32>, ConfigError> {
        self.retries
            .as_ref()
            .map(|v| coerce_int("retries", v))
            .transpose()
    }

    pub fn retry_delay(&self) -> Result<Option<f64>, ConfigError> {
        self.retry_delay
            .as_ref()
            .map(|v| coerce_float("retry_delay", v))
            .transpose()
    }

    pub fn cumulative_timing(&self) -> Result<Option<bool>, ConfigError> {
        self.cumulative_timing
            .as_ref()
            .map(|v| coerce_bool("cumulative_timing", v))
            .transpose()
    }

    pub fn retry_outcome(&self) -> Result<Option<String>, ConfigError> {
        self.retry_outcome
            .as_ref()
            .map(|v| coerce_str("retry_outcome", v))
            .transpose()
    }
}

fn coerce_int(key: &'static str, value: &toml::Value) -> Result<u32, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        expected: "a non-negative integer",
    };
    match value {
        toml::Value::Integer(n) => u32::try_from(*n).map_err(|_| invalid()),
        toml::Value::String(s) => s.trim().parse().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn coerce_float(key: &'static str, value: &toml::Value) -> Result<f64, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        expected: "a non-negative number of seconds",
    };
    let parsed = match value {
        toml::Value::Integer(n) => *n as f64,
        toml::Value::Float(f) => *f,
        toml::Value::String(s) => s.trim().parse().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };
    if parsed.is_finite() && parsed >= 0.0 {
        Ok(parsed)
    } else {
        Err(invalid())
    }
}

fn coerce_bool(key: &'static str, value: &toml::Value) -> Result<bool, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        expected: "a boolean",
    };
    match value {
        toml::Value::Boolean(b) => Ok(*b),
        toml::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(invalid()),
        },
        _ => Err(invalid()),
    }
}

fn coerce_str(key: &'static str, value: &toml::Value) -> Result<String, ConfigError> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            expected: "a string",
        }),
    }
}

/// Which role this process plays in the test session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerTopology {
    /// One process runs everything; the retry narrative stays in memory.
    #[default]
    Single,
    /// The controller of a multi-worker run; hosts the report server.
    Controller,
    /// A parallel worker; streams its narrative to the controller.
    Worker { server_port: u16 },
}

/// Everything the plugin needs to configure itself for a session.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub args: RetryArgs,
    pub file: FileSettings,
    /// The host's verbosity count; trims narrative tracebacks.
    pub verbosity: u8,
    pub topology: WorkerTopology,
}

impl SessionSettings {
    pub fn new(args: RetryArgs, file: FileSettings) -> Self {
        Self {
            args,
            file,
            ..Self::default()
        }
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_topology(mut self, topology: WorkerTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Whether session-level retries were asked for at all. Controls
    /// whether unmarked tests receive the default `flaky` marker.
    pub fn global_retries_enabled(&self) -> Result<bool, ConfigError> {
        if let Some(n) = self.args.retries {
            return Ok(n > 0);
        }
        Ok(self.file.retries()?.is_some_and(|n| n > 0))
    }
}
