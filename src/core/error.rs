use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackupError {
    #[error("Invalid schedule spec: {0}")]
    InvalidScheduleSpec(String),

    #[error("Unsupported compression algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Transient backend error: {0}")]
    TransientBackendError(String),

    #[error("Fatal backend error: {0}")]
    FatalBackendError(String),

    #[error("Version migration to {target} exhausted after {retries} attempts")]
    VersionMigrationExhausted { target: u32, retries: u32 },

    #[error("Ledger write error: {0}")]
    LedgerWriteError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Source read error for '{collection}': {message}")]
    SourceError { collection: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/0 error: {0}")]
    IoError(String),

    #[error("Cancelled by shutdown")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, BackupError>;

impl<T> From<std::sync::PoisonError<T>> for BackupError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

/// Taxonomy tag carried by alerts and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidScheduleSpec,
    UnsupportedAlgorithm,
    Codec,
    TransientBackend,
    FatalBackend,
    VersionMigrationExhausted,
    LedgerWrite,
    Config,
    Source,
    NotFound,
    Lock,
    Io,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidScheduleSpec => "InvalidScheduleSpec",
            ErrorKind::UnsupportedAlgorithm => "UnsupportedAlgorithm",
            ErrorKind::Codec => "CodecError",
            ErrorKind::TransientBackend => "TransientBackendError",
            ErrorKind::FatalBackend => "FatalBackendError",
            ErrorKind::VersionMigrationExhausted => "VersionMigrationExhausted",
            ErrorKind::LedgerWrite => "LedgerWriteError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Source => "SourceError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Lock => "LockError",
            ErrorKind::Io => "IoError",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::InvalidScheduleSpec(_) => ErrorKind::InvalidScheduleSpec,
            BackupError::UnsupportedAlgorithm(_) => ErrorKind::UnsupportedAlgorithm,
            BackupError::CodecError(_) => ErrorKind::Codec,
            BackupError::TransientBackendError(_) => ErrorKind::TransientBackend,
            BackupError::FatalBackendError(_) => ErrorKind::FatalBackend,
            BackupError::VersionMigrationExhausted { .. } => ErrorKind::VersionMigrationExhausted,
            BackupError::LedgerWriteError(_) => ErrorKind::LedgerWrite,
            BackupError::ConfigError(_) => ErrorKind::Config,
            BackupError::SourceError { .. } => ErrorKind::Source,
            BackupError::NotFound(_) => ErrorKind::NotFound,
            BackupError::LockError(_) => ErrorKind::Lock,
            BackupError::IoError(_) => ErrorKind::Io,
            BackupError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Only transient backend failures are retried inside a single tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackupError::TransientBackendError(_))
    }

    /// Errors that must stop the whole process rather than one collection.
    pub fn is_process_fatal(&self) -> bool {
        matches!(
            self,
            BackupError::InvalidScheduleSpec(_)
                | BackupError::ConfigError(_)
                | BackupError::VersionMigrationExhausted { .. }
        )
    }

    /// Errors that suspend a collection until an operator resumes it.
    pub fn suspends_collection(&self) -> bool {
        matches!(self, BackupError::FatalBackendError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_fatal_classification() {
        assert!(BackupError::InvalidScheduleSpec("every_week".into()).is_process_fatal());
        assert!(
            BackupError::VersionMigrationExhausted {
                target: 3,
                retries: 3
            }
            .is_process_fatal()
        );
        assert!(!BackupError::CodecError("corrupt".into()).is_process_fatal());
        assert!(!BackupError::LedgerWriteError("disk full".into()).is_process_fatal());
    }

    #[test]
    fn test_only_transient_backend_errors_retry() {
        assert!(BackupError::TransientBackendError("timeout".into()).is_retryable());
        assert!(!BackupError::FatalBackendError("bad credentials".into()).is_retryable());
        assert_eq!(
            BackupError::FatalBackendError("x".into()).kind().to_string(),
            "FatalBackendError"
        );
    }
}
