use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bstore_fs::{copy_tree, move_path, remove_path, CancelToken, CopyOptions, IoResultExt};
use bstore_types::TempId;
use tracing::{debug, info, warn};

use crate::archive::{self, ArchiveFormat};
use crate::error::{StageError, StageResult};
use crate::source::SourceSpec;
use crate::transfer::Transfer;

/// Caller choices for one upload.
#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    /// For local sources, copy symlink targets instead of the links.
    pub follow_symlinks: bool,
    /// For local directory sources, globs to leave out (e.g. `*.o`).
    pub exclude_patterns: Vec<String>,
    /// Remote sources are git repositories to clone.
    pub git: bool,
    /// Unpack sources recognized as archives.
    pub unpack: bool,
    /// Move local sources instead of copying, and delete them after publish.
    pub remove_sources: bool,
}

/// The outcome of staging: one tree ready to be hashed.
#[derive(Clone, Debug)]
pub struct Assembled {
    /// The tree to hash and promote.
    pub path: PathBuf,
    /// The per-call directory under `temp/` holding everything staged.
    pub wrapper: PathBuf,
    /// Paths to delete once the tree is promoted or discarded.
    pub to_delete: Vec<PathBuf>,
}

/// Materializes sources into a fresh directory under the temp area.
pub struct Assembler {
    temp_root: PathBuf,
    transfer: Arc<dyn Transfer>,
    source_timeout: Option<Duration>,
}

impl Assembler {
    /// `temp_root` must be on the same filesystem as the store's `data/`.
    pub fn new(temp_root: impl Into<PathBuf>, transfer: Arc<dyn Transfer>) -> Self {
        Self {
            temp_root: temp_root.into(),
            transfer,
            source_timeout: None,
        }
    }

    /// Give every source its own deadline.
    pub fn with_source_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.source_timeout = timeout;
        self
    }

    /// Stage `sources` in order into one tree.
    ///
    /// Local sources are all validated before anything is staged. On failure
    /// the wrapper directory is removed, except when `remove_sources` may have
    /// already moved caller data into it; then it is left for the temp sweep.
    pub fn assemble(
        &self,
        sources: &[SourceSpec],
        options: &UploadOptions,
        cancel: &CancelToken,
    ) -> StageResult<Assembled> {
        let names = self.validate(sources, options)?;

        let id = TempId::generate_with_suffix("upload")
            .map_err(|e| StageError::invalid_source("temp", e.to_string()))?;
        let wrapper = self.temp_root.join(id.as_str());
        fs::create_dir(&wrapper).at("mkdir", &wrapper)?;
        debug!(wrapper = %wrapper.display(), sources = sources.len(), "staging");

        let mut staged = Vec::with_capacity(sources.len());
        let mut to_delete = Vec::new();
        for (source, name) in sources.iter().zip(&names) {
            let token = cancel.child(self.source_timeout);
            match self.stage_one(source, name, &wrapper, options, &token) {
                Ok(path) => staged.push(path),
                Err(e) => {
                    self.abandon(&wrapper, options);
                    return Err(e);
                }
            }
            if options.remove_sources {
                if let SourceSpec::Local(path) = source {
                    to_delete.push(path.clone());
                }
            }
        }

        let path = if staged.len() == 1 {
            to_delete.push(wrapper.clone());
            staged.remove(0)
        } else {
            wrapper.clone()
        };
        Ok(Assembled {
            path,
            wrapper,
            to_delete,
        })
    }

    /// Check every local source and reject name collisions. Returns the
    /// staging name of each source.
    fn validate(&self, sources: &[SourceSpec], options: &UploadOptions) -> StageResult<Vec<OsString>> {
        if sources.is_empty() {
            return Err(StageError::invalid_source("(none)", "no sources given"));
        }
        let mut names = Vec::with_capacity(sources.len());
        let mut seen = HashSet::new();
        for source in sources {
            if let SourceSpec::Local(path) = source {
                check_readable(source, path)?;
            }
            let name = source.base_name()?;
            let staged_name = if options.unpack && !(source.is_remote() && options.git) {
                ArchiveFormat::strip_extension(Path::new(&name)).into_os_string()
            } else {
                name.clone()
            };
            if !seen.insert(staged_name.clone()) {
                return Err(StageError::invalid_source(
                    source,
                    format!("another source is also staged as {staged_name:?}"),
                ));
            }
            names.push(name);
        }
        Ok(names)
    }

    fn stage_one(
        &self,
        source: &SourceSpec,
        name: &OsStr,
        wrapper: &Path,
        options: &UploadOptions,
        cancel: &CancelToken,
    ) -> StageResult<PathBuf> {
        let subpath = wrapper.join(name);
        match source {
            SourceSpec::Remote(url) if options.git => {
                self.transfer.git_clone(url, &subpath, cancel)?;
                Ok(subpath)
            }
            SourceSpec::Remote(url) => {
                self.transfer.download(url, &subpath, cancel)?;
                if options.unpack && ArchiveFormat::is_archive(&subpath) {
                    let unpacked = ArchiveFormat::strip_extension(&subpath);
                    archive::unpack(&subpath, &unpacked, cancel)?;
                    remove_path(&subpath)?;
                    return Ok(unpacked);
                }
                Ok(subpath)
            }
            SourceSpec::Local(path) => {
                if options.unpack && ArchiveFormat::is_archive(path) {
                    let unpacked = ArchiveFormat::strip_extension(&subpath);
                    info!(source = %path.display(), dest = %unpacked.display(), "unpacking");
                    archive::unpack(path, &unpacked, cancel)?;
                    return Ok(unpacked);
                }
                if options.remove_sources {
                    info!(source = %path.display(), dest = %subpath.display(), "moving");
                    move_path(path, &subpath, cancel)?;
                } else {
                    info!(source = %path.display(), dest = %subpath.display(), "copying");
                    let copy = CopyOptions {
                        follow_symlinks: options.follow_symlinks,
                        exclude_patterns: options.exclude_patterns.clone(),
                    };
                    copy_tree(path, &subpath, &copy, cancel)?;
                }
                Ok(subpath)
            }
        }
    }

    fn abandon(&self, wrapper: &Path, options: &UploadOptions) {
        if options.remove_sources {
            warn!(wrapper = %wrapper.display(), "staging failed; leaving moved sources for the temp sweep");
            return;
        }
        if let Err(e) = remove_path(wrapper) {
            warn!(wrapper = %wrapper.display(), error = %e, "failed to remove abandoned staging directory");
        }
    }
}

fn check_readable(source: &SourceSpec, path: &Path) -> StageResult<()> {
    let meta = fs::metadata(path)
        .map_err(|e| StageError::invalid_source(source, e.to_string()))?;
    let probe = if meta.is_dir() {
        fs::read_dir(path).map(|_| ())
    } else {
        fs::File::open(path).map(|_| ())
    };
    probe.map_err(|e| StageError::invalid_source(source, format!("not readable: {e}")))
}
