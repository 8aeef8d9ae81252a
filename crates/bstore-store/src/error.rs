use std::path::PathBuf;

use bstore_fs::FsError;
use bstore_hash::HashError;
use bstore_stage::StageError;
use bstore_types::{ContentHash, TempId};
use serde::Serialize;

/// Errors from bundle store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A local source is missing, unreadable, or cannot be staged.
    #[error("invalid source {spec}: {reason}")]
    InvalidSource { spec: String, reason: String },

    /// A download or git clone failed.
    #[error("transfer of {url} failed: {reason}")]
    TransferFailure { url: String, reason: String },

    /// An archive is corrupt or unsupported.
    #[error("cannot unpack {}: {reason}", .path.display())]
    ArchiveFailure { path: PathBuf, reason: String },

    /// Rename, copy, remove or stat failure.
    #[error("filesystem error: {0}")]
    Filesystem(#[source] FsError),

    /// A file changed size between listing and hashing.
    #[error("{} changed while being hashed", .path.display())]
    ContentChanged { path: PathBuf },

    /// The temp identifier is already in use.
    #[error("temp identifier already in use: {0}")]
    IdentifierCollision(TempId),

    /// No stored entry exists for this hash.
    #[error("no stored entry for {0}")]
    NotFound(ContentHash),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    TimedOut,

    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The reference authority could not answer.
    #[error("reference authority error: {0}")]
    Authority(String),
}

/// Flat error classification for callers that branch on failure type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidSource,
    TransferFailure,
    ArchiveFailure,
    Filesystem,
    IdentifierCollision,
    NotFound,
    Cancelled,
    TimedOut,
    Config,
    Authority,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSource { .. } => ErrorKind::InvalidSource,
            Self::TransferFailure { .. } => ErrorKind::TransferFailure,
            Self::ArchiveFailure { .. } => ErrorKind::ArchiveFailure,
            Self::Filesystem(_) | Self::ContentChanged { .. } => ErrorKind::Filesystem,
            Self::IdentifierCollision(_) => ErrorKind::IdentifierCollision,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::TimedOut => ErrorKind::TimedOut,
            Self::Config(_) => ErrorKind::Config,
            Self::Authority(_) => ErrorKind::Authority,
        }
    }
}

impl From<FsError> for StoreError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::Cancelled => Self::Cancelled,
            FsError::TimedOut => Self::TimedOut,
            other => Self::Filesystem(other),
        }
    }
}

impl From<HashError> for StoreError {
    fn from(err: HashError) -> Self {
        match err {
            HashError::Fs(e) => e.into(),
            HashError::Modified { path, .. } => Self::ContentChanged { path },
        }
    }
}

impl From<StageError> for StoreError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::InvalidSource { spec, reason } => Self::InvalidSource { spec, reason },
            StageError::Transfer { url, reason } => Self::TransferFailure { url, reason },
            StageError::Archive { path, reason } => Self::ArchiveFailure { path, reason },
            StageError::Fs(e) => e.into(),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
