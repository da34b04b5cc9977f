//! Custom error types for the backup engine
//!
//! This module defines the error taxonomy for the engine using thiserror.
//! Sub-components raise these typed errors; only the orchestrator catches
//! them to clean up partial artifacts before re-raising.

use thiserror::Error;

/// The main error type for backup engine operations
#[derive(Error, Debug)]
pub enum BackupError {
    /// Missing or invalid configuration (encryption key, connection, paths)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The execution slot is already held by another pipeline
    #[error("Another backup or restore is already running: {holder}")]
    Concurrency { holder: String },

    /// The external dump tool exited unsuccessfully
    #[error("Dump failed (exit status {}): {stderr}", format_status(.status))]
    DumpFailure { status: Option<i32>, stderr: String },

    /// The external restore tool exited unsuccessfully
    #[error("Restore failed (exit status {}): {stderr}", format_status(.status))]
    RestoreFailure { status: Option<i32>, stderr: String },

    /// Encryption errors
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Decryption errors
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Artifact digest does not match the recorded checksum
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Entity not found errors
    #[error("{entity_type} not found: {identifier}")]
    NotFound {
        entity_type: &'static str,
        identifier: String,
    },

    /// Operation is not valid for the record's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Dump output exceeded the configured maximum artifact size
    #[error("Artifact too large: {size} bytes exceeds limit of {limit} bytes")]
    ArtifactTooLarge { size: u64, limit: u64 },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The pipeline exceeded its maximum run duration
    #[error("Operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(String),

    /// Metadata storage errors
    #[error("Storage error: {0}")]
    Storage(String),
}

fn format_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

impl BackupError {
    /// Create a "not found" error for backup records
    pub fn backup_not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: "Backup",
            identifier: identifier.into(),
        }
    }

    /// Stable snake_case name of the error kind, for callers and audit details
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Concurrency { .. } => "concurrency_error",
            Self::DumpFailure { .. } => "dump_failure",
            Self::RestoreFailure { .. } => "restore_failure",
            Self::Encryption(_) => "encryption_failure",
            Self::Decryption(_) => "decryption_failure",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::NotFound { .. } => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::ArtifactTooLarge { .. } => "artifact_too_large",
            Self::Cancelled => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a concurrency (slot held) error
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }

    /// Check if this is a checksum mismatch
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. })
    }
}

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result type alias for backup engine operations
pub type BackupResult<T> = Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BackupError::Configuration("missing key".into());
        assert_eq!(err.to_string(), "Configuration error: missing key");
    }

    #[test]
    fn test_not_found_error() {
        let err = BackupError::backup_not_found("bkp-1234");
        assert_eq!(err.to_string(), "Backup not found: bkp-1234");
        assert!(err.is_not_found());
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_dump_failure_display() {
        let err = BackupError::DumpFailure {
            status: Some(1),
            stderr: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Dump failed (exit status 1): connection refused"
        );

        let killed = BackupError::RestoreFailure {
            status: None,
            stderr: String::new(),
        };
        assert!(killed.to_string().contains("signal"));
    }

    #[test]
    fn test_checksum_mismatch_predicate() {
        let err = BackupError::ChecksumMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(err.is_checksum_mismatch());
        assert!(!err.is_concurrency());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BackupError = io_err.into();
        assert!(matches!(err, BackupError::Io(_)));
    }
}
