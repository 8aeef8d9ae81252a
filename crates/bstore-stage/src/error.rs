use std::path::PathBuf;

use bstore_fs::FsError;

/// Errors produced while staging sources.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// A local source is missing, unreadable, or cannot be named.
    #[error("invalid source {spec}: {reason}")]
    InvalidSource { spec: String, reason: String },

    /// A download or clone failed.
    #[error("transfer of {url} failed: {reason}")]
    Transfer { url: String, reason: String },

    /// An archive is corrupt or could not be unpacked.
    #[error("cannot unpack {}: {reason}", .path.display())]
    Archive { path: PathBuf, reason: String },

    /// Local filesystem failure (including cancellation and timeouts).
    #[error(transparent)]
    Fs(#[from] FsError),
}

impl StageError {
    pub fn invalid_source(spec: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidSource {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias for staging operations.
pub type StageResult<T> = Result<T, StageError>;
