use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use bstore_fs::{CancelToken, EntryKind, FsError, IoResultExt, ListedEntry, TreeListing};
use bstore_types::ContentHash;
use tracing::debug;

const CHUNK_SIZE: usize = 64 * 1024;

const TAG_DIR: u8 = b'd';
const TAG_FILE: u8 = b'f';
const TAG_EXEC: u8 = b'x';
const TAG_LINK: u8 = b'l';

/// Domain-separated BLAKE3 tree hasher.
///
/// The digest covers, for every listed entry in listing order: its kind,
/// its relative path (component by component), and for files the executable
/// bit, length and bytes, for symlinks the link target. Every variable-length
/// field is length-prefixed so distinct trees cannot serialize identically.
/// Nothing else (mtimes, owners, the root's own name) is hashed.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for stored bundles.
    pub const BUNDLE: Self = Self {
        domain: "bstore-bundle-v1",
    };

    /// Create a hasher with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// The domain tag used by this hasher.
    pub fn domain(&self) -> &str {
        self.domain
    }

    /// Hash every entry of `listing`.
    pub fn hash_listing(&self, listing: &TreeListing, cancel: &CancelToken) -> HashResult<ContentHash> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");

        let mut buf = vec![0u8; CHUNK_SIZE];
        for entry in listing.entries() {
            cancel.check()?;
            match &entry.kind {
                EntryKind::Directory => {
                    hasher.update(&[TAG_DIR]);
                    update_path(&mut hasher, &entry.relative);
                }
                EntryKind::File { executable } => {
                    hasher.update(&[if *executable { TAG_EXEC } else { TAG_FILE }]);
                    update_path(&mut hasher, &entry.relative);
                    hasher.update(&entry.size.to_le_bytes());
                    stream_file(&mut hasher, listing, entry, &mut buf, cancel)?;
                }
                EntryKind::Symlink { target } => {
                    hasher.update(&[TAG_LINK]);
                    update_path(&mut hasher, &entry.relative);
                    update_bytes(&mut hasher, target.as_os_str().as_encoded_bytes());
                }
            }
        }

        let hash = ContentHash::from_hash(*hasher.finalize().as_bytes());
        debug!(root = %listing.root().display(), hash = %hash.short_hex(), "hashed tree");
        Ok(hash)
    }

    /// Scan `path` and hash it, returning the listing for reuse (e.g. sizing).
    pub fn hash_path(&self, path: &Path, cancel: &CancelToken) -> HashResult<(ContentHash, TreeListing)> {
        let listing = TreeListing::scan(path, cancel)?;
        let hash = self.hash_listing(&listing, cancel)?;
        Ok((hash, listing))
    }
}

fn update_bytes(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn update_path(hasher: &mut blake3::Hasher, relative: &Path) {
    let components: Vec<_> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect();
    hasher.update(&(components.len() as u64).to_le_bytes());
    for name in components {
        update_bytes(hasher, name.as_encoded_bytes());
    }
}

fn stream_file(
    hasher: &mut blake3::Hasher,
    listing: &TreeListing,
    entry: &ListedEntry,
    buf: &mut [u8],
    cancel: &CancelToken,
) -> HashResult<()> {
    let path = listing.absolute(entry);
    let mut reader = File::open(&path).at("open", &path)?;
    let mut seen = 0u64;
    loop {
        cancel.check()?;
        let n = reader.read(buf).at("read", &path)?;
        if n == 0 {
            break;
        }
        seen += n as u64;
        if seen > entry.size {
            break;
        }
        hasher.update(&buf[..n]);
    }
    if seen != entry.size {
        return Err(HashError::Modified {
            path,
            listed: entry.size,
            read: seen,
        });
    }
    Ok(())
}

/// Errors from hashing operations.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error(transparent)]
    Fs(#[from] FsError),

    /// A file changed size between listing and hashing.
    #[error("{} changed while hashing: listed {listed} bytes, read {read}", .path.display())]
    Modified { path: PathBuf, listed: u64, read: u64 },
}

pub type HashResult<T> = Result<T, HashError>;
