//! Error types for the backup engine.
//!
//! Failures fall into four families: transient backend trouble (retried inside
//! the storage layer), corruption (size or hash disagreement), consistency
//! (the store cannot be interpreted unambiguously) and restartable partial
//! state, which the driver handles without surfacing an error.

use std::fmt;
use thiserror::Error;

/// Diagnostic codes attached to corruption and consistency failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BackendValidationFailed,
    MismatchedHash,
    MismatchedManifests,
    UnreadableManifests,
    NoManifests,
    EncryptionMismatch,
    WrongPassphrase,
    TwoChainsCoverTime,
    IncWithoutSigs,
    RestartImpossible,
    RestartAttemptsExhausted,
    ClockNotAdvancing,
    ManifestGap,
    DuplicateVolume,
    VolumesNotTransferred,
    RestartFileNotFound,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::BackendValidationFailed => "backend_validation_failed",
            ErrorCode::MismatchedHash => "mismatched_hash",
            ErrorCode::MismatchedManifests => "mismatched_manifests",
            ErrorCode::UnreadableManifests => "unreadable_manifests",
            ErrorCode::NoManifests => "no_manifests",
            ErrorCode::EncryptionMismatch => "encryption_mismatch",
            ErrorCode::WrongPassphrase => "wrong_passphrase",
            ErrorCode::TwoChainsCoverTime => "two_chains_cover_time",
            ErrorCode::IncWithoutSigs => "inc_without_sigs",
            ErrorCode::RestartImpossible => "restart_impossible",
            ErrorCode::RestartAttemptsExhausted => "restart_attempts_exhausted",
            ErrorCode::ClockNotAdvancing => "clock_not_advancing",
            ErrorCode::ManifestGap => "manifest_gap",
            ErrorCode::DuplicateVolume => "duplicate_volume",
            ErrorCode::VolumesNotTransferred => "volumes_not_transferred",
            ErrorCode::RestartFileNotFound => "restart_file_not_found",
        };
        f.write_str(name)
    }
}

/// Outcome classes a storage backend reports.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("remote object not found: {0}")]
    NotFound(String),

    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("backend failure: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }

    pub fn from_io(name: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => BackendError::NotFound(name.to_string()),
            ErrorKind::Interrupted
            | ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => BackendError::Transient(format!("{name}: {err}")),
            _ => BackendError::Fatal(format!("{name}: {err}")),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Corruption detected [{code}]: {message}")]
    Corruption { code: ErrorCode, message: String },

    #[error("Inconsistent backup store [{code}]: {message}")]
    Consistency { code: ErrorCode, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Archive directory is locked by {0}")]
    Locked(String),

    #[error("No backup chains found")]
    NoChains,

    #[error("Malformed archive stream: {0}")]
    Format(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Aborting after volume {0} as requested")]
    FaultInjected(u32),
}

impl EngineError {
    pub fn corruption(code: ErrorCode, message: impl Into<String>) -> Self {
        EngineError::Corruption {
            code,
            message: message.into(),
        }
    }

    pub fn consistency(code: ErrorCode, message: impl Into<String>) -> Self {
        EngineError::Consistency {
            code,
            message: message.into(),
        }
    }

    /// The diagnostic code, for corruption and consistency failures.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            EngineError::Corruption { code, .. } | EngineError::Consistency { code, .. } => {
                Some(*code)
            }
            _ => None,
        }
    }

    /// Failures that leave a partial set behind which the next run can resume.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            EngineError::Cancelled | EngineError::FaultInjected(_) | EngineError::Backend(_)
        )
    }

    /// Corruption and consistency failures must never be retried with the same bytes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Corruption { .. } | EngineError::Consistency { .. } | EngineError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            BackendError::from_io("vol1", err),
            BackendError::NotFound(name) if name == "vol1"
        ));
    }

    #[test]
    fn test_io_timeout_is_transient() {
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(BackendError::from_io("vol1", err).is_transient());
    }

    #[test]
    fn test_error_code_display() {
        let err = EngineError::corruption(ErrorCode::BackendValidationFailed, "size 10 != 11");
        assert_eq!(err.code(), Some(ErrorCode::BackendValidationFailed));
        assert!(err.to_string().contains("backend_validation_failed"));
        assert!(err.is_fatal());
        assert!(!err.is_restartable());
    }
}
