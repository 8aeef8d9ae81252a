use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bstore_fs::{remove_path, CancelToken};
use bstore_stage::{Assembler, NetworkTransfer, SourceSpec, Transfer, UploadOptions};
use bstore_types::{ContentHash, OwnerId, TempId};
use tracing::{debug, warn};

use crate::authority::ReferenceAuthority;
use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::gc::{GarbageCollector, GcReport};
use crate::layout::StoreLayout;
use crate::publish::{PublishReceipt, Publisher};

/// Content-addressed bundle store rooted at one directory.
///
/// All operations are safe to call concurrently from several threads or
/// processes sharing the same root; there is no in-process lock.
pub struct BundleStore {
    config: StoreConfig,
    layout: StoreLayout,
    assembler: Assembler,
    publisher: Publisher,
    gc: GarbageCollector,
}

impl BundleStore {
    /// Open (creating `data/` and `temp/` if needed) with network transfers.
    pub fn open(config: StoreConfig, authority: Arc<dyn ReferenceAuthority>) -> StoreResult<Self> {
        let transfer = NetworkTransfer::new(&config.transfer_config())?;
        Self::with_transfer(config, authority, Arc::new(transfer))
    }

    /// Open with a caller-supplied transfer implementation.
    pub fn with_transfer(
        config: StoreConfig,
        authority: Arc<dyn ReferenceAuthority>,
        transfer: Arc<dyn Transfer>,
    ) -> StoreResult<Self> {
        let layout = StoreLayout::new(&config.root);
        layout.ensure_directories()?;
        debug!(root = %layout.root().display(), "opened store");
        Ok(Self {
            assembler: Assembler::new(layout.temp_dir(), transfer)
                .with_source_timeout(config.source_timeout()),
            publisher: Publisher::new(layout.clone()),
            gc: GarbageCollector::new(layout.clone(), authority, &config),
            layout,
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Stage `sources`, hash them, and store the result.
    ///
    /// On success `data/<hash>` is complete. On failure nothing new is
    /// visible under `data/`; temp leftovers are possible only when
    /// `remove_sources` moved caller data into staging.
    pub fn upload(
        &self,
        sources: &[SourceSpec],
        options: &UploadOptions,
        cancel: &CancelToken,
    ) -> StoreResult<PublishReceipt> {
        let assembled = self.assembler.assemble(sources, options, cancel)?;
        match self.publisher.publish(&assembled, cancel) {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                if options.remove_sources {
                    warn!(wrapper = %assembled.wrapper.display(), "publish failed; leaving staged sources for recovery");
                } else if let Err(cleanup) = remove_path(&assembled.wrapper) {
                    warn!(wrapper = %assembled.wrapper.display(), error = %cleanup, "cannot remove staging directory");
                }
                Err(e)
            }
        }
    }

    /// `data/<hash>`, or just `<hash>` when `relative`. No existence check.
    pub fn get_location(&self, hash: &ContentHash, relative: bool) -> PathBuf {
        if relative {
            PathBuf::from(self.layout.relative_location_of(hash))
        } else {
            self.layout.location_of(hash)
        }
    }

    /// `data/<hash>` if it exists, `NotFound` otherwise.
    pub fn resolve(&self, hash: &ContentHash) -> StoreResult<PathBuf> {
        self.layout.resolve(hash)
    }

    pub fn temp_location(&self, id: &TempId) -> PathBuf {
        self.layout.temp_location_of(id)
    }

    /// Create `temp/<id>`; collides with any live temp entry of that name.
    pub fn make_temp_location(&self, id: &TempId) -> StoreResult<PathBuf> {
        self.layout.make_temp_location(id)
    }

    /// Delete `data/<hash>` unless an owner outside `excluded` references it.
    pub fn cleanup(&self, hash: &ContentHash, excluded: &BTreeSet<OwnerId>, dry_run: bool) -> StoreResult<GcReport> {
        self.gc.cleanup(hash, excluded, dry_run)
    }

    /// Data sweep then temp sweep. Per-entry failures land in the report.
    pub fn full_cleanup(&self, dry_run: bool) -> GcReport {
        self.gc.full_cleanup(dry_run)
    }

    /// Delete all stored and temporary content.
    pub fn reset(&self) -> StoreResult<()> {
        self.layout.reset()
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }
}

impl std::fmt::Debug for BundleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleStore")
            .field("root", &self.layout.root())
            .field("data_sweep", &self.config.data_sweep)
            .finish()
    }
}
