//! # Storage Error Taxonomy
//!
//! Every storage operation returns a typed [`StorageError`]; nothing is
//! swallowed into a log line. The registry layer maps errors to responses
//! through [`ErrorCode`].
//!
//! ## Error Classifications
//!
//! - **NotFound** (404): package, version, tarball or token absent
//! - **Conflict** (409): create on an existing package, or retry budget exhausted
//! - **RevisionMismatch** (409): optimistic-concurrency precondition failed
//! - **VersionConflict** (409): duplicate version on publish
//! - **Validation** (400): malformed manifest, dangling dist-tag
//! - **Forbidden** (403): auth denial
//! - **Io** (500): durable storage failure, retryable by the caller

use std::fmt;

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    Conflict,
    RevisionMismatch,
    VersionConflict,
    ValidationError,
    Forbidden,
    InvalidState,
    Aborted,
    IoFailure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::RevisionMismatch => "revision_mismatch",
            ErrorCode::VersionConflict => "version_conflict",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::Aborted => "aborted",
            ErrorCode::IoFailure => "io_failure",
        }
    }

    /// Status the registry layer answers with for this class of error.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict | ErrorCode::RevisionMismatch | ErrorCode::VersionConflict => 409,
            ErrorCode::ValidationError => 400,
            ErrorCode::Forbidden => 403,
            ErrorCode::InvalidState => 422,
            ErrorCode::Aborted => 499,
            ErrorCode::IoFailure => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("revision mismatch: expected {expected}, found {actual}")]
    RevisionMismatch { expected: String, actual: String },

    #[error("version {version} of {package} already exists")]
    VersionConflict { package: String, version: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("operation aborted: {0}")]
    Aborted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            StorageError::NotFound(_) => ErrorCode::NotFound,
            StorageError::Conflict(_) => ErrorCode::Conflict,
            StorageError::RevisionMismatch { .. } => ErrorCode::RevisionMismatch,
            StorageError::VersionConflict { .. } => ErrorCode::VersionConflict,
            StorageError::Validation(_) => ErrorCode::ValidationError,
            StorageError::Forbidden(_) => ErrorCode::Forbidden,
            StorageError::InvalidState(_) => ErrorCode::InvalidState,
            StorageError::Aborted(_) => ErrorCode::Aborted,
            StorageError::Io(_) => ErrorCode::IoFailure,
        }
    }

    /// Whether a caller may reasonably repeat the operation unchanged.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_) | StorageError::RevisionMismatch { .. }
        )
    }

    pub(crate) fn not_found_io(err: std::io::Error, what: impl fmt::Display) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(what.to_string())
        } else {
            StorageError::Io(err)
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            StorageError::Io(err.into())
        } else {
            StorageError::Validation(format!("malformed JSON document: {err}"))
        }
    }
}

/// Convenient result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
