use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bstore_types::{ContentHash, OwnerId};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// External record of which owners reference which content.
///
/// The store holds no ownership graph of its own; the data sweep asks the
/// authority before every deletion. Implementations must answer from current
/// state on every call. An error must never be reported as "no owners".
pub trait ReferenceAuthority: Send + Sync {
    /// Every owner currently referencing `hash`.
    fn query_owners(&self, hash: &ContentHash) -> StoreResult<BTreeSet<OwnerId>>;

    /// `true` if any owner outside `excluded` references `hash`.
    fn is_live(&self, hash: &ContentHash, excluded: &BTreeSet<OwnerId>) -> StoreResult<bool> {
        let owners = self.query_owners(hash)?;
        Ok(owners.difference(excluded).next().is_some())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// `HashMap`-based authority for tests and embedding.
pub struct InMemoryReferenceAuthority {
    owners: RwLock<HashMap<ContentHash, BTreeSet<OwnerId>>>,
}

impl InMemoryReferenceAuthority {
    pub fn new() -> Self {
        Self {
            owners: RwLock::new(HashMap::new()),
        }
    }

    /// Record that `owner` references `hash`.
    pub fn add_reference(&self, owner: OwnerId, hash: ContentHash) {
        self.owners
            .write()
            .expect("lock poisoned")
            .entry(hash)
            .or_default()
            .insert(owner);
    }

    /// Drop one reference. Returns `true` if it existed.
    pub fn remove_reference(&self, owner: &OwnerId, hash: &ContentHash) -> bool {
        let mut map = self.owners.write().expect("lock poisoned");
        let Some(set) = map.get_mut(hash) else {
            return false;
        };
        let removed = set.remove(owner);
        if set.is_empty() {
            map.remove(hash);
        }
        removed
    }

    /// Drop every reference held by `owner`.
    pub fn remove_owner(&self, owner: &OwnerId) {
        let mut map = self.owners.write().expect("lock poisoned");
        map.retain(|_, set| {
            set.remove(owner);
            !set.is_empty()
        });
    }

    /// Number of hashes with at least one owner.
    pub fn len(&self) -> usize {
        self.owners.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.read().expect("lock poisoned").is_empty()
    }
}

impl Default for InMemoryReferenceAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceAuthority for InMemoryReferenceAuthority {
    fn query_owners(&self, hash: &ContentHash) -> StoreResult<BTreeSet<OwnerId>> {
        let map = self.owners.read().expect("lock poisoned");
        Ok(map.get(hash).cloned().unwrap_or_default())
    }
}

impl std::fmt::Debug for InMemoryReferenceAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryReferenceAuthority")
            .field("referenced_hashes", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// JSON manifest
// ---------------------------------------------------------------------------

/// Authority backed by a JSON file mapping owner ids to content hashes:
///
/// ```json
/// { "0x3f9a...": "0x8c1d...", "0x77b0...": "0x8c1d..." }
/// ```
///
/// The file is re-read on every query, so edits made by another process
/// between two deletions of a sweep are seen. A missing or malformed file is
/// an error, never an empty owner set.
#[derive(Clone, Debug)]
pub struct ManifestAuthority {
    path: PathBuf,
}

impl ManifestAuthority {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> StoreResult<BTreeMap<OwnerId, ContentHash>> {
        let text = fs::read_to_string(&self.path).map_err(|e| {
            StoreError::Authority(format!("cannot read {}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            StoreError::Authority(format!("malformed manifest {}: {e}", self.path.display()))
        })
    }
}

impl ReferenceAuthority for ManifestAuthority {
    fn query_owners(&self, hash: &ContentHash) -> StoreResult<BTreeSet<OwnerId>> {
        let owners: BTreeSet<OwnerId> = self
            .read()?
            .into_iter()
            .filter(|(_, referenced)| referenced == hash)
            .map(|(owner, _)| owner)
            .collect();
        debug!(hash = %hash.short_hex(), owners = owners.len(), "queried manifest");
        Ok(owners)
    }
}
