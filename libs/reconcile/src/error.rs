//! Error types for admission, task execution and the installer worker.

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the producer-facing installer API and by a worker cycle.
#[derive(Debug, Error)]
pub enum InstallerError {
    /// The scheme is empty or contains the reserved `:` delimiter.
    #[error("invalid scheme '{scheme}': {reason}")]
    InvalidScheme {
        scheme: String,
        reason: &'static str,
    },

    /// The worker has exited and no longer accepts admissions.
    #[error("installer worker has stopped")]
    WorkerStopped,

    /// Saving or loading the resource table failed.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl InstallerError {
    /// Returns true if this error was caused by invalid producer input.
    pub fn is_invalid_scheme(&self) -> bool {
        matches!(self, Self::InvalidScheme { .. })
    }
}

/// Errors converting an installable resource into a registered one.
///
/// Such resources are logged and skipped; they never fail the whole call.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// A module resource lacks a required attribute.
    #[error("resource {url} is missing the '{attribute}' attribute")]
    MissingAttribute {
        url: String,
        attribute: &'static str,
    },

    /// A module resource carries a version that cannot be parsed.
    #[error("resource {url} has an invalid version '{version}': {source}")]
    InvalidVersion {
        url: String,
        version: String,
        #[source]
        source: VersionError,
    },

    /// The resource content could not be written to the data directory.
    #[error("failed to store content of {url}: {source}")]
    Content {
        url: String,
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a module version string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("version is empty")]
    Empty,

    #[error("invalid numeric component '{0}'")]
    InvalidNumber(String),

    #[error("invalid qualifier '{0}'")]
    InvalidQualifier(String),
}

/// Errors reported by task execution.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Recoverable failure; the task runs again in the next cycle.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unrecoverable failure; the task is dropped.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl TaskError {
    /// Returns true if the failure is recoverable.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
