//! Error handling module for idreset
//!
//! One error type for the whole library. Variants follow the pipeline's failure
//! taxonomy: which ones are fatal to the run and which stay local to a single
//! operation is decided by the caller, not by the variant.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for idreset
#[derive(Error, Debug)]
pub enum IdResetError {
    /// IO errors (file operations outside a more specific context)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A discovery root or entry could not be read. Logged and skipped.
    #[error("Cannot access {path}: {reason}")]
    DiscoveryAccess { path: PathBuf, reason: String },

    /// Malformed run configuration, pattern data or policy data. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Backup could not be created or verified. Fatal to the affected operation only.
    #[error("Backup of {path} failed: {reason}")]
    BackupFailure { path: PathBuf, reason: String },

    /// Applying a mutation failed. Retried, then rolled back.
    #[error("Mutation of {target} failed: {reason}")]
    MutationFailure { target: String, reason: String },

    /// Post-mutation read-back did not match the expected value
    #[error("Verification mismatch on {target}: {detail}")]
    VerificationMismatch { target: String, detail: String },

    /// A store failed its structural check
    #[error("Integrity check failed for {target}: {detail}")]
    IntegrityCorruption { target: String, detail: String },

    /// A SQL statement did not pass shape validation and never reached the engine
    #[error("Query rejected: {0}")]
    QueryRejected(String),

    /// A blocking call exceeded its timeout
    #[error("{what} timed out after {secs}s")]
    Timeout { what: String, secs: u64 },

    /// An external command exited unsuccessfully
    #[error("{command} failed (exit code {code}): {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Registry access failed
    #[error("Registry error: {0}")]
    Registry(String),

    /// Another pipeline run holds the lock
    #[error("Another run holds the lock at {path} (pid {pid})")]
    Locked { path: PathBuf, pid: u32 },

    /// A Critical operation failed under abort-on-critical-failure
    #[error("Run aborted: critical operation {operation} failed: {reason}")]
    CriticalAbort { operation: String, reason: String },

    /// An operation's state machine was driven through an invalid transition
    #[error("Invalid operation transition: {0}")]
    Transition(String),

    /// The run was cancelled before this point
    #[error("Run cancelled")]
    Cancelled,

    /// SQLite engine errors
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for idreset operations
pub type Result<T> = std::result::Result<T, IdResetError>;

// Convenient error constructors
impl IdResetError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a discovery access error
    pub fn discovery_access(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::DiscoveryAccess {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a backup failure
    pub fn backup(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::BackupFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a mutation failure
    pub fn mutation(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::MutationFailure {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a verification mismatch
    pub fn mismatch(target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::VerificationMismatch {
            target: target.into(),
            detail: detail.into(),
        }
    }

    /// Create an integrity corruption error
    pub fn integrity(target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::IntegrityCorruption {
            target: target.into(),
            detail: detail.into(),
        }
    }

    /// Create a query rejection
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::QueryRejected(msg.into())
    }

    /// Create a registry error
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Whether this error should stop the whole run rather than one operation
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::CriticalAbort { .. } | Self::Locked { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IdResetError::configuration("unknown pattern version 7");
        assert_eq!(err.to_string(), "Configuration error: unknown pattern version 7");

        let err = IdResetError::backup("/tmp/state.vscdb", "No space left on device");
        assert_eq!(
            err.to_string(),
            "Backup of /tmp/state.vscdb failed: No space left on device"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: IdResetError = io_err.into();
        assert!(matches!(err, IdResetError::Io(_)));
    }

    #[test]
    fn test_only_configuration_and_abort_are_run_fatal() {
        assert!(IdResetError::configuration("bad").is_run_fatal());
        assert!(IdResetError::CriticalAbort {
            operation: "op-0001".into(),
            reason: "disk full".into()
        }
        .is_run_fatal());
        assert!(!IdResetError::mutation("db", "locked").is_run_fatal());
        assert!(!IdResetError::backup("/x", "denied").is_run_fatal());
        assert!(!IdResetError::integrity("db", "malformed").is_run_fatal());
    }
}
