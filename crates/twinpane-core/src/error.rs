//! Result codes and backend error types.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal outcome of a task or a backend call, expressed the way the
/// rest of the file manager reports it (HRESULT-compatible).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
pub enum ResultCode {
    #[strum(to_string = "S_OK")]
    Success,
    #[strum(to_string = "ERROR_CANCELLED")]
    Cancelled,
    #[strum(to_string = "E_ABORT")]
    Aborted,
    #[strum(to_string = "ERROR_PARTIAL_COPY")]
    PartialCopy,
    #[strum(to_string = "ERROR_ALREADY_EXISTS")]
    AlreadyExists,
    #[strum(to_string = "ERROR_ACCESS_DENIED")]
    AccessDenied,
    #[strum(to_string = "ERROR_SHARING_VIOLATION")]
    SharingViolation,
    #[strum(to_string = "ERROR_FILE_NOT_FOUND")]
    NotFound,
    #[strum(to_string = "ERROR_NOT_SUPPORTED")]
    NotSupported,
    #[strum(to_string = "ERROR_DIR_NOT_EMPTY")]
    DirectoryNotEmpty,
    #[strum(to_string = "E_INVALIDARG")]
    InvalidArgument,
    #[strum(to_string = "E_FAIL")]
    Failed,
}

impl ResultCode {
    /// The HRESULT value of this code.
    pub const fn hresult(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::Cancelled => 0x8007_04C7,
            Self::Aborted => 0x8000_4004,
            Self::PartialCopy => 0x8007_012B,
            Self::AlreadyExists => 0x8007_00B7,
            Self::AccessDenied => 0x8007_0005,
            Self::SharingViolation => 0x8007_0020,
            Self::NotFound => 0x8007_0002,
            Self::NotSupported => 0x8007_0032,
            Self::DirectoryNotEmpty => 0x8007_0091,
            Self::InvalidArgument => 0x8007_0057,
            Self::Failed => 0x8000_4005,
        }
    }

    /// Whether this code means the request completed fully.
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Whether this code means the request was cancelled by the user.
    pub const fn is_cancelled(self) -> bool {
        matches!(self, Self::Cancelled | Self::Aborted)
    }

    /// Partial success counts as completed: every item was either done or
    /// deliberately skipped.
    pub const fn is_completed(self) -> bool {
        matches!(self, Self::Success | Self::PartialCopy)
    }
}

/// Errors reported by file-system backends.
#[derive(Debug, Error)]
pub enum FsError {
    /// Path not found.
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    /// Target already exists and overwriting was not allowed.
    #[error("Already exists: {path}")]
    AlreadyExists { path: PathBuf },

    /// Access denied by the backend.
    #[error("Access denied: {path}")]
    AccessDenied { path: PathBuf },

    /// Target is read-only and replacing read-only items was not allowed.
    #[error("Item is read-only: {path}")]
    ReadOnly { path: PathBuf },

    /// Target is locked by another process.
    #[error("Item is in use by another process: {path}")]
    SharingViolation { path: PathBuf },

    /// A reparse point that cannot be represented at the destination.
    #[error("Reparse point cannot be reproduced at the destination: {path}")]
    UnsupportedReparse { path: PathBuf },

    /// Directory still has children.
    #[error("Directory is not empty: {path}")]
    DirectoryNotEmpty { path: PathBuf },

    /// The backend does not implement this operation.
    #[error("Operation not supported by this file system: {operation}")]
    NotSupported { operation: &'static str },

    /// The operation observed a cancellation request.
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Transport or protocol failure inside a backend.
    #[error("Backend failure at {path}: {message}")]
    Backend { path: PathBuf, message: String },
}

/// Result alias for backend calls.
pub type FsResult<T> = Result<T, FsError>;

#[cfg(windows)]
const WIN32_SHARING_VIOLATION: i32 = 32;
#[cfg(windows)]
const WIN32_LOCK_VIOLATION: i32 = 33;

impl FsError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();

        #[cfg(windows)]
        if matches!(
            source.raw_os_error(),
            Some(WIN32_SHARING_VIOLATION | WIN32_LOCK_VIOLATION)
        ) {
            return Self::SharingViolation { path };
        }

        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::AccessDenied { path },
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists { path },
            std::io::ErrorKind::DirectoryNotEmpty => Self::DirectoryNotEmpty { path },
            _ => Self::Io { path, source },
        }
    }

    /// Create a backend failure.
    pub fn backend(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Backend {
            path: path.into(),
            message: message.into(),
        }
    }

    /// The result code this error maps to.
    pub fn code(&self) -> ResultCode {
        match self {
            Self::NotFound { .. } => ResultCode::NotFound,
            Self::AlreadyExists { .. } => ResultCode::AlreadyExists,
            Self::AccessDenied { .. } | Self::ReadOnly { .. } => ResultCode::AccessDenied,
            Self::SharingViolation { .. } => ResultCode::SharingViolation,
            Self::UnsupportedReparse { .. } | Self::NotSupported { .. } => ResultCode::NotSupported,
            Self::DirectoryNotEmpty { .. } => ResultCode::DirectoryNotEmpty,
            Self::Cancelled => ResultCode::Cancelled,
            Self::Io { .. } | Self::Backend { .. } => ResultCode::Failed,
        }
    }

    /// The path the error refers to, when there is one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::NotFound { path }
            | Self::AlreadyExists { path }
            | Self::AccessDenied { path }
            | Self::ReadOnly { path }
            | Self::SharingViolation { path }
            | Self::UnsupportedReparse { path }
            | Self::DirectoryNotEmpty { path }
            | Self::Io { path, .. }
            | Self::Backend { path, .. } => Some(path),
            Self::NotSupported { .. } | Self::Cancelled => None,
        }
    }

    /// Whether this error is a cross-device rename refusal.
    pub fn is_cross_device(&self) -> bool {
        match self {
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::CrossesDevices,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_error_io() {
        let err = FsError::io(
            "/test/path",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, FsError::AccessDenied { .. }));
        assert_eq!(err.code(), ResultCode::AccessDenied);

        let err = FsError::io(
            "/test/path",
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "exists"),
        );
        assert!(matches!(err, FsError::AlreadyExists { .. }));
    }

    #[test]
    fn test_result_code_names() {
        assert_eq!(ResultCode::Success.to_string(), "S_OK");
        assert_eq!(ResultCode::PartialCopy.to_string(), "ERROR_PARTIAL_COPY");
        assert_eq!(ResultCode::PartialCopy.hresult(), 0x8007_012B);
        assert!(ResultCode::PartialCopy.is_completed());
        assert!(!ResultCode::PartialCopy.is_success());
        assert!(ResultCode::Aborted.is_cancelled());
    }
}
