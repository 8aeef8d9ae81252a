use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bstore_fs::{entries_older_than, remove_path, FsError, IoResultExt};
use bstore_types::{ContentHash, TempId};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

const DATA_DIR: &str = "data";
const TEMP_DIR: &str = "temp";

/// The store's on-disk contract: `root/data/<hash>` and `root/temp/<id>`.
///
/// Path computations are pure; only [`make_temp_location`],
/// [`ensure_directories`] and [`reset`] touch the disk.
///
/// [`make_temp_location`]: StoreLayout::make_temp_location
/// [`ensure_directories`]: StoreLayout::ensure_directories
/// [`reset`]: StoreLayout::reset
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
    data: PathBuf,
    temp: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data: root.join(DATA_DIR),
            temp: root.join(TEMP_DIR),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> &Path {
        &self.data
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp
    }

    /// `data/<hash>`; the entry may not exist.
    pub fn location_of(&self, hash: &ContentHash) -> PathBuf {
        self.data.join(hash.to_string())
    }

    /// The store-relative form of a location: the hash itself.
    pub fn relative_location_of(&self, hash: &ContentHash) -> String {
        hash.to_string()
    }

    /// `temp/<id>`; the entry may not exist.
    pub fn temp_location_of(&self, id: &TempId) -> PathBuf {
        self.temp.join(id.as_str())
    }

    /// Create `temp/<id>`, failing if the identifier is already taken.
    pub fn make_temp_location(&self, id: &TempId) -> StoreResult<PathBuf> {
        let path = self.temp_location_of(id);
        match fs::create_dir(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "created temp location");
                Ok(path)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StoreError::IdentifierCollision(id.clone()))
            }
            Err(e) => Err(FsError::io("mkdir", &path, e).into()),
        }
    }

    /// `data/<hash>`, or `NotFound` if nothing is stored there.
    pub fn resolve(&self, hash: &ContentHash) -> StoreResult<PathBuf> {
        let path = self.location_of(hash);
        match fs::symlink_metadata(&path) {
            Ok(_) => Ok(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(*hash)),
            Err(e) => Err(FsError::io("stat", &path, e).into()),
        }
    }

    /// Create `data/` and `temp/` if missing.
    pub fn ensure_directories(&self) -> StoreResult<()> {
        for dir in [&self.data, &self.temp] {
            fs::create_dir_all(dir).at("mkdir", dir)?;
        }
        Ok(())
    }

    /// Delete everything in `data/` and `temp/`, then recreate both.
    pub fn reset(&self) -> StoreResult<()> {
        warn!(root = %self.root.display(), "resetting store");
        for dir in [&self.data, &self.temp] {
            remove_path(dir)?;
        }
        self.ensure_directories()
    }

    /// Stored hashes, sorted. Names under `data/` that are not valid hashes
    /// are ignored.
    pub fn stored_hashes(&self) -> StoreResult<Vec<ContentHash>> {
        let mut hashes = Vec::new();
        for entry in fs::read_dir(&self.data).at("readdir", &self.data)? {
            let entry = entry.at("readdir", &self.data)?;
            match entry.file_name().to_str().map(ContentHash::parse) {
                Some(Ok(hash)) => hashes.push(hash),
                _ => debug!(name = ?entry.file_name(), "ignoring foreign entry in data/"),
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Direct children of `dir` untouched for longer than `window`, by name.
    pub fn list_old_entries(&self, dir: &Path, window: Duration) -> StoreResult<Vec<(String, PathBuf)>> {
        Ok(entries_older_than(dir, window, SystemTime::now())?)
    }
}
