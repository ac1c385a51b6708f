//! The process-wide registry of resolved retry defaults.
//!
//! One registry is populated per session. Built-in options carry their
//! defaults from construction; [`Registry::configure`] layers file values
//! and CLI flags on top, and [`Registry::add`] registers the two
//! hook-provided exception sets. There is no other write path: once a
//! session is configured the registry is read-only.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::config::{ConfigError, FileSettings, RetryArgs};
use crate::filter::ErrorClass;

/// Maximum extra attempts for a bare `flaky` marker.
pub const RETRIES: &str = "RETRIES";
/// Seconds slept between attempts.
pub const RETRY_DELAY: &str = "RETRY_DELAY";
/// Whether reported call durations sum across attempts.
pub const CUMULATIVE_TIMING: &str = "CUMULATIVE_TIMING";
/// Outcome label for interim retry attempts.
pub const RETRY_OUTCOME: &str = "RETRY_OUTCOME";
/// Session-wide include filter, from the user hooks.
pub const FILTERED_EXCEPTIONS: &str = "FILTERED_EXCEPTIONS";
/// Session-wide exclude filter, from the user hooks.
pub const EXCLUDED_EXCEPTIONS: &str = "EXCLUDED_EXCEPTIONS";

/// A registered option value.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Int(u32),
    Float(f64),
    Bool(bool),
    Str(String),
    Classes(HashSet<ErrorClass>),
}

/// Resolved session defaults for the retry engine.
#[derive(Debug, Clone)]
pub struct Registry {
    opts: HashMap<String, OptionValue>,
}

impl Registry {
    /// A registry holding the built-in defaults: one retry, no delay,
    /// overwrite timing, the `"retried"` label.
    pub fn new() -> Self {
        let mut opts = HashMap::new();
        // A flaky marker with no arguments should default to one retry.
        opts.insert(RETRIES.to_string(), OptionValue::Int(1));
        opts.insert(RETRY_DELAY.to_string(), OptionValue::Float(0.0));
        opts.insert(CUMULATIVE_TIMING.to_string(), OptionValue::Bool(false));
        opts.insert(
            RETRY_OUTCOME.to_string(),
            OptionValue::Str("retried".to_string()),
        );
        Self { opts }
    }

    /// Reads a registered option.
    pub fn get(&self, name: &str) -> Result<&OptionValue, ConfigError> {
        self.opts.get(name).ok_or_else(|| ConfigError::UnknownOption {
            name: name.to_string(),
        })
    }

    /// Registers an additional option. Refuses names that already exist.
    pub fn add(&mut self, name: &str, value: OptionValue) -> Result<(), ConfigError> {
        if self.opts.contains_key(name) {
            return Err(ConfigError::AlreadyRegistered {
                name: name.to_string(),
            });
        }
        self.opts.insert(name.to_string(), value);
        Ok(())
    }

    /// Layers file values, then CLI flags, over the built-in defaults.
    /// A source only wins for the keys it actually provides.
    pub fn configure(&mut self, args: &RetryArgs, file: &FileSettings) -> Result<(), ConfigError> {
        if let Some(n) = file.retries()? {
            self.set(RETRIES, OptionValue::Int(n));
        }
        if let Some(delay) = file.retry_delay()? {
            self.set(RETRY_DELAY, OptionValue::Float(delay));
        }
        if let Some(cumulative) = file.cumulative_timing()? {
            self.set(CUMULATIVE_TIMING, OptionValue::Bool(cumulative));
        }
        if let Some(label) = file.retry_outcome()? {
            self.set(RETRY_OUTCOME, OptionValue::Str(label));
        }

        if let Some(n) = args.retries {
            self.set(RETRIES, OptionValue::Int(n));
        }
        if let Some(delay) = args.retry_delay {
            if !(delay.is_finite() && delay >= 0.0) {
                return Err(ConfigError::InvalidValue {
                    key: "retry_delay",
                    value: delay.to_string(),
                    expected: "a non-negative number of seconds",
                });
            }
            self.set(RETRY_DELAY, OptionValue::Float(delay));
        }
        if let Some(cumulative) = args.cumulative_timing {
            self.set(CUMULATIVE_TIMING, OptionValue::Bool(cumulative));
        }
        if let Some(label) = &args.retry_outcome {
            self.set(RETRY_OUTCOME, OptionValue::Str(label.clone()));
        }
        Ok(())
    }

    fn set(&mut self, name: &str, value: OptionValue) {
        self.opts.insert(name.to_string(), value);
    }

    pub fn retries(&self) -> u32 {
        match self.get(RETRIES) {
            Ok(OptionValue::Int(n)) => *n,
            _ => 1,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        match self.get(RETRY_DELAY) {
            Ok(OptionValue::Float(secs)) => Duration::from_secs_f64(secs.max(0.0)),
            _ => Duration::ZERO,
        }
    }

    pub fn cumulative_timing(&self) -> bool {
        matches!(self.get(CUMULATIVE_TIMING), Ok(OptionValue::Bool(true)))
    }

    pub fn retry_outcome(&self) -> &str {
        match self.get(RETRY_OUTCOME) {
            Ok(OptionValue::Str(label)) => label,
            _ => "retried",
        }
    }

    pub fn filtered_exceptions(&self) -> HashSet<ErrorClass> {
        match self.get(FILTERED_EXCEPTIONS) {
            Ok(OptionValue::Classes(set)) => set.clone(),
            _ => HashSet::new(),
        }
    }

    pub fn excluded_exceptions(&self) -> HashSet<ErrorClass> {
        match self.get(EXCLUDED_EXCEPTIONS) {
            Ok(OptionValue::Classes(set)) => set.clone(),
            _ => HashSet::new(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
