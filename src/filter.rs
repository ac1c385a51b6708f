//! Exception-class retry eligibility.
//!
//! A failed attempt is only retried when the raised error's class clears
//! the active [`ExceptionFilter`]. Filters come in two flavors: an
//! include list (`only_on`, retry only these classes) and an exclude list
//! (`exclude`, retry anything but these). The two are mutually exclusive;
//! asking for both is a configuration error, not a silent preference.
//!
//! Per-test filters from the `flaky` marker compose with the session-wide
//! filter from the user hooks via [`ExceptionFilter::or`]: whichever is
//! active first wins outright, so a marker filter fully overrides the
//! global one.

use std::collections::HashSet;
use std::fmt;

use crate::config::ConfigError;

/// The named class of an error raised by a test stage.
///
/// The host maps its failure representation onto these names; the engine
/// treats them as opaque identifiers. `Skipped` is reserved for skip
/// control flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorClass(String);

impl ErrorClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The reserved class for skip control flow.
    pub fn skipped() -> Self {
        Self("Skipped".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ErrorClass {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for ErrorClass {
    fn from(name: String) -> Self {
        Self(name)
    }
}

#[derive(Debug, Clone)]
enum FilterMode {
    /// No classes listed; every error is eligible.
    Inactive,
    /// Retry only when the raised class is in the set.
    OnlyOn(HashSet<ErrorClass>),
    /// Retry unless the raised class is in the set.
    Exclude(HashSet<ErrorClass>),
}

/// Decides whether a raised error class is eligible for retry.
#[derive(Debug, Clone)]
pub struct ExceptionFilter {
    mode: FilterMode,
}

impl ExceptionFilter {
    /// Builds a filter from include and exclude sets. At most one of the
    /// two may be non-empty.
    pub fn new(
        only_on: HashSet<ErrorClass>,
        exclude: HashSet<ErrorClass>,
    ) -> Result<Self, ConfigError> {
        let mode = match (only_on.is_empty(), exclude.is_empty()) {
            (true, true) => FilterMode::Inactive,
            (false, true) => FilterMode::OnlyOn(only_on),
            (true, false) => FilterMode::Exclude(exclude),
            (false, false) => return Err(ConfigError::ConflictingFilters),
        };
        Ok(Self { mode })
    }

    /// The filter that allows everything.
    pub fn inactive() -> Self {
        Self {
            mode: FilterMode::Inactive,
        }
    }

    /// Whether any classes are listed. An inactive filter loses to the
    /// fallback in [`or`](Self::or) composition.
    pub fn is_active(&self) -> bool {
        !matches!(self.mode, FilterMode::Inactive)
    }

    /// Whether a failure with the given class should be retried. `None`
    /// means the attempt failed without a raised error (a report forced to
    /// failed); only an include list rejects that.
    pub fn allows(&self, class: Option<&ErrorClass>) -> bool {
        match &self.mode {
            FilterMode::Inactive => true,
            FilterMode::OnlyOn(set) => class.is_some_and(|c| set.contains(c)),
            FilterMode::Exclude(set) => class.is_none_or(|c| !set.contains(c)),
        }
    }

    /// Composes two filters: `self` wins if it is active, otherwise the
    /// fallback applies.
    pub fn or(self, fallback: Self) -> Self {
        if self.is_active() { self } else { fallback }
    }
}
