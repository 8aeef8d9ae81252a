use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use url::Url;

use crate::error::{StageError, StageResult};

/// URL schemes treated as remote sources. Anything else is a local path.
const REMOTE_SCHEMES: &[&str] = &["http", "https", "ftp", "git", "ssh"];

/// One input to an upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceSpec {
    Local(PathBuf),
    Remote(Url),
}

impl SourceSpec {
    /// Classify a caller-supplied string as a URL or a local path.
    pub fn parse(raw: &str) -> Self {
        match Url::parse(raw) {
            Ok(url) if Self::is_remote_url(&url) => Self::Remote(url),
            _ => Self::Local(PathBuf::from(raw)),
        }
    }

    pub fn is_url(raw: &str) -> bool {
        matches!(Self::parse(raw), Self::Remote(_))
    }

    fn is_remote_url(url: &Url) -> bool {
        REMOTE_SCHEMES.contains(&url.scheme()) && url.has_host()
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// The name this source is staged under: the last path component.
    ///
    /// For URLs this is the last non-empty path segment, falling back to the
    /// host (`https://example.org/` stages as `example.org`).
    /// Local names keep their exact bytes, UTF-8 or not.
    pub fn base_name(&self) -> StageResult<OsString> {
        let name = match self {
            Self::Local(path) => local_base_name(path),
            Self::Remote(url) => url
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                .or_else(|| url.host_str())
                .map(OsString::from),
        };
        match name {
            Some(name) if name != "." && name != ".." && !name.is_empty() => Ok(name),
            _ => Err(StageError::invalid_source(self, "cannot determine a base name")),
        }
    }
}

fn local_base_name(path: &Path) -> Option<OsString> {
    if let Some(name) = path.file_name() {
        return Some(name.to_os_string());
    }
    // `.`, `..` and friends: name the directory they resolve to.
    let resolved = fs::canonicalize(path).ok()?;
    resolved.file_name().map(|name| name.to_os_string())
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => write!(f, "{url}"),
        }
    }
}

impl From<&str> for SourceSpec {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}
