use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use ignore::overrides::{Override, OverrideBuilder};
use ignore::WalkBuilder;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::error::{FsError, FsResult, IoResultExt};

/// Copy buffer size; cancellation is checked once per chunk.
const CHUNK_SIZE: usize = 1024 * 1024;

#[cfg(unix)]
const EXDEV: i32 = 18;

// ---------------------------------------------------------------------------
// Exclusion globs
// ---------------------------------------------------------------------------

/// Compiled exclude globs for one source root.
///
/// Patterns use gitignore syntax: a pattern without a slash (e.g. `*.o`)
/// matches a basename at any depth, a matched directory is skipped whole.
#[derive(Clone, Debug)]
pub struct ExcludeSet {
    overrides: Override,
}

impl ExcludeSet {
    pub fn new(root: &Path, patterns: &[String]) -> FsResult<Self> {
        let mut builder = OverrideBuilder::new(root);
        for pattern in patterns {
            builder
                .add(&format!("!{pattern}"))
                .map_err(|e| FsError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
        }
        let overrides = builder.build().map_err(|e| FsError::InvalidPattern {
            pattern: patterns.join(","),
            reason: e.to_string(),
        })?;
        Ok(Self { overrides })
    }

    /// An exclude set that matches nothing.
    pub fn empty() -> Self {
        Self {
            overrides: Override::empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    pub fn is_excluded(&self, path: &Path, is_dir: bool) -> bool {
        self.overrides.matched(path, is_dir).is_ignore()
    }

    fn into_override(self) -> Override {
        self.overrides
    }
}

/// How [`copy_tree`] treats the source.
#[derive(Clone, Debug, Default)]
pub struct CopyOptions {
    /// Copy symlink targets instead of recreating the links.
    pub follow_symlinks: bool,
    /// Glob patterns (relative to the source root) to leave behind.
    pub exclude_patterns: Vec<String>,
}

// ---------------------------------------------------------------------------
// Copy / move
// ---------------------------------------------------------------------------

/// Copy `src` (file, symlink or directory) to `dst`, which must not exist.
///
/// Excludes apply to entries beneath `src`, never to `src` itself.
pub fn copy_tree(src: &Path, dst: &Path, options: &CopyOptions, cancel: &CancelToken) -> FsResult<()> {
    let meta = if options.follow_symlinks {
        fs::metadata(src).at("stat", src)?
    } else {
        fs::symlink_metadata(src).at("stat", src)?
    };
    if meta.file_type().is_symlink() {
        return copy_symlink(src, dst);
    }
    if !meta.is_dir() {
        return copy_file(src, dst, cancel);
    }

    let excludes = ExcludeSet::new(src, &options.exclude_patterns)?;
    let walker = WalkBuilder::new(src)
        .standard_filters(false)
        .follow_links(options.follow_symlinks)
        .overrides(excludes.into_override())
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut copied = 0usize;
    let mut dir_modes = Vec::new();
    for item in walker {
        cancel.check()?;
        let item = item.map_err(|e| FsError::io("walk", src, walk_error(e)))?;
        let relative = item.path().strip_prefix(src).unwrap_or(item.path());
        let target = if relative.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(relative)
        };
        let Some(file_type) = item.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            fs::create_dir(&target).at("mkdir", &target)?;
            let perms = fs::metadata(item.path()).at("stat", item.path())?.permissions();
            dir_modes.push((target, perms));
        } else if file_type.is_symlink() {
            copy_symlink(item.path(), &target)?;
        } else if file_type.is_file() {
            copy_file(item.path(), &target, cancel)?;
            copied += 1;
        } else {
            warn!(path = %item.path().display(), "skipping special file during copy");
        }
    }
    // Deepest first: a read-only directory is locked only once it is filled.
    for (target, perms) in dir_modes.into_iter().rev() {
        fs::set_permissions(&target, perms).at("chmod", &target)?;
    }
    debug!(src = %src.display(), dst = %dst.display(), files = copied, "copied tree");
    Ok(())
}

fn walk_error(err: ignore::Error) -> io::Error {
    let message = err.to_string();
    err.into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, message))
}

fn copy_file(src: &Path, dst: &Path, cancel: &CancelToken) -> FsResult<()> {
    let mut reader = File::open(src).at("open", src)?;
    let perms = reader.metadata().at("stat", src)?.permissions();
    let mut writer = File::options()
        .write(true)
        .create_new(true)
        .open(dst)
        .at("create", dst)?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        cancel.check()?;
        let n = reader.read(&mut buf).at("read", src)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).at("write", dst)?;
    }
    writer.flush().at("flush", dst)?;
    fs::set_permissions(dst, perms).at("chmod", dst)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> FsResult<()> {
    let target = fs::read_link(src).at("readlink", src)?;
    std::os::unix::fs::symlink(&target, dst).at("symlink", dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> FsResult<()> {
    fs::copy(src, dst).at("copy", dst).map(|_| ())
}

/// Move `src` to `dst`, falling back to copy-then-remove across devices.
///
/// Used to pull sources into staging; the promotion step uses
/// [`rename_no_replace`] instead and never crosses devices.
pub fn move_path(src: &Path, dst: &Path, cancel: &CancelToken) -> FsResult<()> {
    match rename_dir(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            debug!(src = %src.display(), "cross-device move; copying");
            copy_tree(src, dst, &CopyOptions::default(), cancel)?;
            remove_path(src)?;
            Ok(())
        }
        Err(e) => Err(FsError::io("rename", src, e)),
    }
}

/// `rename(2)`, briefly granting the owner write access when a read-only
/// directory cannot be moved to a new parent (its `..` entry changes).
#[cfg(unix)]
fn rename_dir(src: &Path, dst: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    match fs::rename(src, dst) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            let meta = fs::symlink_metadata(src)?;
            let perms = meta.permissions();
            if !meta.is_dir() || perms.mode() & 0o200 != 0 {
                return Err(e);
            }
            fs::set_permissions(src, fs::Permissions::from_mode(perms.mode() | 0o200))?;
            match fs::rename(src, dst) {
                Ok(()) => fs::set_permissions(dst, perms),
                Err(e) => {
                    let _ = fs::set_permissions(src, perms);
                    Err(e)
                }
            }
        }
        other => other,
    }
}

#[cfg(not(unix))]
fn rename_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::rename(src, dst)
}

#[cfg(unix)]
fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(_err: &io::Error) -> bool {
    false
}

// ---------------------------------------------------------------------------
// Remove / rename
// ---------------------------------------------------------------------------

/// Delete a file, symlink or directory tree.
///
/// Returns `Ok(false)` if nothing was there; a missing path is never an error.
pub fn remove_path(path: &Path) -> FsResult<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(FsError::io("stat", path, e)),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path).or_else(|e| {
            if e.kind() != io::ErrorKind::PermissionDenied {
                return Err(e);
            }
            debug!(path = %path.display(), "unlocking read-only directories for removal");
            unlock_dirs(path)?;
            fs::remove_dir_all(path)
        })
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FsError::io("remove", path, e)),
    }
}

/// Give the owner full access to every directory under `root`.
///
/// Directories are yielded before their contents are read, so a locked
/// directory is opened up before the walk descends into it.
#[cfg(unix)]
fn unlock_dirs(root: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let mode = entry.metadata()?.permissions().mode();
        if mode & 0o700 != 0o700 {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | 0o700))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn unlock_dirs(_root: &Path) -> io::Result<()> {
    Ok(())
}

/// Result of [`rename_no_replace`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenameOutcome {
    /// `src` now lives at `dst`.
    Renamed,
    /// Something was already at `dst`; `src` is untouched.
    DestinationExists,
}

/// Atomically move `src` to `dst` unless `dst` already exists.
///
/// Directories use `rename(2)`, which refuses to replace a non-empty
/// directory. Files use `link(2)`, which refuses any existing name, and then
/// unlink the source. When the call fails and `dst` is found on recheck, a
/// concurrent writer won the race and the outcome is `DestinationExists`.
pub fn rename_no_replace(src: &Path, dst: &Path) -> FsResult<RenameOutcome> {
    if exists(dst)? {
        return Ok(RenameOutcome::DestinationExists);
    }
    let meta = fs::symlink_metadata(src).at("stat", src)?;
    let result = if meta.is_dir() {
        rename_dir(src, dst)
    } else {
        fs::hard_link(src, dst).and_then(|()| fs::remove_file(src))
    };
    match result {
        Ok(()) => Ok(RenameOutcome::Renamed),
        Err(e) => {
            if exists(dst)? {
                debug!(dst = %dst.display(), error = %e, "lost promotion race");
                Ok(RenameOutcome::DestinationExists)
            } else {
                Err(FsError::io("rename", src, e))
            }
        }
    }
}

fn exists(path: &Path) -> FsResult<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FsError::io("stat", path, e)),
    }
}

// ---------------------------------------------------------------------------
// Ages
// ---------------------------------------------------------------------------

/// Time since `path` was last modified, measured from `now`.
///
/// Entries with an mtime in the future have age zero.
pub fn age_of(path: &Path, now: SystemTime) -> FsResult<Duration> {
    let modified = fs::symlink_metadata(path)
        .and_then(|m| m.modified())
        .at("stat", path)?;
    Ok(now.duration_since(modified).unwrap_or(Duration::ZERO))
}

/// Set the mtime of `path` to now.
pub fn touch(path: &Path) -> FsResult<()> {
    let file = File::open(path).at("open", path)?;
    file.set_modified(SystemTime::now()).at("touch", path)
}

/// Names of the direct children of `dir` whose age exceeds `window`, sorted.
///
/// Children that vanish while being inspected are skipped.
pub fn entries_older_than(dir: &Path, window: Duration, now: SystemTime) -> FsResult<Vec<(String, PathBuf)>> {
    let mut old = Vec::new();
    for entry in fs::read_dir(dir).at("readdir", dir)? {
        let entry = entry.at("readdir", dir)?;
        let path = entry.path();
        let age = match age_of(&path, now) {
            Ok(age) => age,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        if age > window {
            old.push((entry.file_name().to_string_lossy().into_owned(), path));
        }
    }
    old.sort();
    Ok(old)
}
