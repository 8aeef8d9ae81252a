use std::io;
use std::path::{Path, PathBuf};

/// Errors produced by filesystem primitives.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// An I/O call failed on a specific path.
    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An exclude glob could not be compiled.
    #[error("invalid exclude pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The operation's token was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation's deadline elapsed.
    #[error("operation timed out")]
    TimedOut,
}

impl FsError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Returns `true` if the underlying I/O error is `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Convenience alias used throughout the fs crate.
pub type FsResult<T> = Result<T, FsError>;

/// Attach an operation name and path to a raw `io::Result`.
pub trait IoResultExt<T> {
    fn at(self, op: &'static str, path: &Path) -> FsResult<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, op: &'static str, path: &Path) -> FsResult<T> {
        self.map_err(|source| FsError::io(op, path, source))
    }
}
