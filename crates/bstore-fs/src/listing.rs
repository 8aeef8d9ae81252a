use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::error::{FsError, FsResult, IoResultExt};

/// What a listed path is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File { executable: bool },
    Symlink { target: PathBuf },
}

/// One path in a [`TreeListing`], relative to the listing root.
///
/// The root itself is listed with an empty relative path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedEntry {
    pub relative: PathBuf,
    pub kind: EntryKind,
    /// Byte length from `lstat`; zero for directories.
    pub size: u64,
}

impl ListedEntry {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }
}

/// A single, stable enumeration of a tree.
///
/// Entries are sorted component-wise by relative path, so two trees with the
/// same names and structure always list identically regardless of the order
/// the filesystem returns directory entries in. Symlinks are recorded, never
/// followed.
#[derive(Clone, Debug)]
pub struct TreeListing {
    root: PathBuf,
    entries: Vec<ListedEntry>,
}

impl TreeListing {
    /// Walk `root` (a directory, file or symlink) once.
    pub fn scan(root: &Path, cancel: &CancelToken) -> FsResult<Self> {
        let meta = fs::symlink_metadata(root).at("stat", root)?;
        if !meta.is_dir() {
            let entry = listed(root, PathBuf::new(), &meta)?;
            return Ok(Self {
                root: root.to_path_buf(),
                entries: entry.into_iter().collect(),
            });
        }

        let mut entries = Vec::new();
        for item in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            cancel.check()?;
            let item = item.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                FsError::io("walk", path, e.into())
            })?;
            let relative = item
                .path()
                .strip_prefix(root)
                .map(Path::to_path_buf)
                .unwrap_or_default();
            let meta = item.metadata().map_err(|e| {
                FsError::io("stat", item.path(), e.into())
            })?;
            entries.extend(listed(item.path(), relative, &meta)?);
        }
        entries.sort_by(|a, b| a.relative.cmp(&b.relative));

        debug!(root = %root.display(), entries = entries.len(), "scanned tree");
        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[ListedEntry] {
        &self.entries
    }

    /// Returns `true` when the root is a plain file or symlink.
    pub fn is_single_file(&self) -> bool {
        !self.entries.first().is_some_and(ListedEntry::is_dir)
    }

    pub fn directories(&self) -> impl Iterator<Item = &ListedEntry> {
        self.entries.iter().filter(|e| e.is_dir())
    }

    pub fn files(&self) -> impl Iterator<Item = &ListedEntry> {
        self.entries.iter().filter(|e| !e.is_dir())
    }

    /// Absolute path of a listed entry.
    pub fn absolute(&self, entry: &ListedEntry) -> PathBuf {
        if entry.relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(&entry.relative)
        }
    }

    /// Sum of file and symlink sizes. Directories contribute nothing.
    pub fn total_size(&self) -> u64 {
        self.files().map(|e| e.size).sum()
    }
}

fn listed(path: &Path, relative: PathBuf, meta: &Metadata) -> FsResult<Option<ListedEntry>> {
    let file_type = meta.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_symlink() {
        EntryKind::Symlink {
            target: fs::read_link(path).at("readlink", path)?,
        }
    } else if file_type.is_file() {
        EntryKind::File {
            executable: is_executable(meta),
        }
    } else {
        warn!(path = %path.display(), "skipping special file");
        return Ok(None);
    };
    let size = if file_type.is_dir() { 0 } else { meta.len() };
    Ok(Some(ListedEntry {
        relative,
        kind,
        size,
    }))
}

#[cfg(unix)]
fn is_executable(meta: &Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &Metadata) -> bool {
    false
}
