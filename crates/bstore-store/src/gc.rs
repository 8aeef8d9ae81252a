use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bstore_fs::{age_of, remove_path};
use bstore_types::{ContentHash, OwnerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::authority::ReferenceAuthority;
use crate::config::{DataSweep, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::layout::StoreLayout;

/// Which half of the store a GC action touched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GcArea {
    Data,
    Temp,
}

/// One entry the collector deleted, or would delete in a dry run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GcAction {
    pub area: GcArea,
    pub path: PathBuf,
    /// `false` in dry-run mode.
    pub deleted: bool,
}

/// One entry the collector could not examine or delete. It is left for the
/// next run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GcFailure {
    pub area: GcArea,
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of a cleanup or sweep.
#[derive(Clone, Debug, Serialize)]
pub struct GcReport {
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub actions: Vec<GcAction>,
    pub failures: Vec<GcFailure>,
    /// Stored entries kept because an owner still references them.
    pub retained: usize,
}

impl GcReport {
    /// An empty report stamped with the current time.
    pub fn new(dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            dry_run,
            started_at: now,
            finished_at: now,
            actions: Vec::new(),
            failures: Vec::new(),
            retained: 0,
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    /// Paths acted on in `area`.
    pub fn paths(&self, area: GcArea) -> impl Iterator<Item = &PathBuf> {
        self.actions
            .iter()
            .filter(move |a| a.area == area)
            .map(|a| &a.path)
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Deletes unreferenced stored entries and abandoned temp entries.
///
/// Stored entries are only ever deleted after the reference authority has
/// reported no owner outside the exclusion set. An authority error keeps the
/// entry. Per-entry failures are recorded and the sweep continues.
///
/// The authority's answer is only as fresh as the owner records it holds.
/// Callers must durably record a new owner before a sweep can observe the
/// content; the data grace window covers recent uploads in the meantime.
pub struct GarbageCollector {
    layout: StoreLayout,
    authority: Arc<dyn ReferenceAuthority>,
    data_sweep: DataSweep,
    data_retention: Duration,
    temp_retention: Duration,
}

impl GarbageCollector {
    pub fn new(layout: StoreLayout, authority: Arc<dyn ReferenceAuthority>, config: &StoreConfig) -> Self {
        Self {
            layout,
            authority,
            data_sweep: config.data_sweep,
            data_retention: config.data_retention(),
            temp_retention: config.temp_retention(),
        }
    }

    /// Delete `data/<hash>` if no owner outside `excluded` references it.
    ///
    /// An absent entry is not an error. Authority errors propagate.
    pub fn cleanup(&self, hash: &ContentHash, excluded: &BTreeSet<OwnerId>, dry_run: bool) -> StoreResult<GcReport> {
        let mut report = GcReport::new(dry_run);
        let path = match self.layout.resolve(hash) {
            Ok(path) => path,
            Err(StoreError::NotFound(_)) => {
                debug!(hash = %hash.short_hex(), "nothing stored; nothing to clean");
                return Ok(report.finish());
            }
            Err(e) => return Err(e),
        };
        if self.authority.is_live(hash, excluded)? {
            debug!(hash = %hash.short_hex(), "still referenced; keeping");
            report.retained += 1;
        } else {
            self.delete(GcArea::Data, path, &mut report);
        }
        Ok(report.finish())
    }

    /// Data sweep followed by temp sweep.
    pub fn full_cleanup(&self, dry_run: bool) -> GcReport {
        let mut report = GcReport::new(dry_run);
        self.sweep_data(&BTreeSet::new(), &mut report);
        self.sweep_temp(&mut report);
        let report = report.finish();
        info!(
            dry_run,
            actions = report.actions.len(),
            failures = report.failures.len(),
            retained = report.retained,
            "garbage collection finished"
        );
        report
    }

    /// Examine stored entries per the configured sweep mode and delete the
    /// unreferenced ones.
    pub fn sweep_data(&self, excluded: &BTreeSet<OwnerId>, report: &mut GcReport) {
        let candidates = match self.data_candidates() {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "cannot list stored entries");
                report.failures.push(GcFailure {
                    area: GcArea::Data,
                    path: self.layout.data_dir().to_path_buf(),
                    error: e.to_string(),
                });
                return;
            }
        };
        debug!(candidates = candidates.len(), mode = ?self.data_sweep, "data sweep");

        for hash in candidates {
            let path = self.layout.location_of(&hash);
            match self.authority.is_live(&hash, excluded) {
                Ok(true) => report.retained += 1,
                Ok(false) if !self.still_expired(&path) => {
                    debug!(hash = %hash.short_hex(), "refreshed since listing; keeping");
                    report.retained += 1;
                }
                Ok(false) => self.delete(GcArea::Data, path, report),
                Err(e) => {
                    warn!(hash = %hash.short_hex(), error = %e, "reference query failed; keeping entry");
                    report.failures.push(GcFailure {
                        area: GcArea::Data,
                        path,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Delete every temp entry older than the temp retention window.
    pub fn sweep_temp(&self, report: &mut GcReport) {
        let temp = self.layout.temp_dir();
        let old = match self.layout.list_old_entries(temp, self.temp_retention) {
            Ok(old) => old,
            Err(e) => {
                warn!(error = %e, "cannot list temp entries");
                report.failures.push(GcFailure {
                    area: GcArea::Temp,
                    path: temp.to_path_buf(),
                    error: e.to_string(),
                });
                return;
            }
        };
        for (_, path) in old {
            self.delete(GcArea::Temp, path, report);
        }
    }

    fn data_candidates(&self) -> StoreResult<Vec<ContentHash>> {
        match self.data_sweep {
            DataSweep::Immediate => self.layout.stored_hashes(),
            DataSweep::Background => {
                let old = self
                    .layout
                    .list_old_entries(self.layout.data_dir(), self.data_retention)?;
                Ok(old
                    .into_iter()
                    .filter_map(|(name, _)| ContentHash::parse(&name).ok())
                    .collect())
            }
        }
    }

    /// Background mode only: whether `path` is still past the grace window.
    /// A publisher may have refreshed it after the candidates were listed.
    fn still_expired(&self, path: &Path) -> bool {
        match self.data_sweep {
            DataSweep::Immediate => true,
            DataSweep::Background => match age_of(path, SystemTime::now()) {
                Ok(age) => age > self.data_retention,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "cannot re-stat candidate; keeping");
                    false
                }
            },
        }
    }

    fn delete(&self, area: GcArea, path: PathBuf, report: &mut GcReport) {
        if report.dry_run {
            info!(?area, path = %path.display(), "would delete");
            report.actions.push(GcAction {
                area,
                path,
                deleted: false,
            });
            return;
        }
        info!(?area, path = %path.display(), "deleting");
        match remove_path(&path) {
            Ok(_) => report.actions.push(GcAction {
                area,
                path,
                deleted: true,
            }),
            Err(e) => {
                warn!(?area, path = %path.display(), error = %e, "delete failed; leaving for next run");
                report.failures.push(GcFailure {
                    area,
                    path,
                    error: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::InMemoryReferenceAuthority;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: StoreLayout,
        authority: Arc<InMemoryReferenceAuthority>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.ensure_directories().unwrap();
        Fixture {
            _dir: dir,
            layout,
            authority: Arc::new(InMemoryReferenceAuthority::new()),
        }
    }

    fn collector(fx: &Fixture, mode: DataSweep) -> GarbageCollector {
        let mut config = StoreConfig::new(fx.layout.root());
        config.data_sweep = mode;
        GarbageCollector::new(fx.layout.clone(), fx.authority.clone(), &config)
    }

    fn stored(fx: &Fixture, byte: u8) -> ContentHash {
        let hash = ContentHash::from_hash([byte; 32]);
        let path = fx.layout.location_of(&hash);
        fs::create_dir(&path).unwrap();
        fs::write(path.join("f"), [byte]).unwrap();
        hash
    }

    fn age(path: &std::path::Path, secs: u64) {
        let then = SystemTime::now() - Duration::from_secs(secs);
        fs::File::open(path).unwrap().set_modified(then).unwrap();
    }

    fn owners(ids: &[&str]) -> BTreeSet<OwnerId> {
        ids.iter().map(|id| OwnerId::from(*id)).collect()
    }

    #[test]
    fn cleanup_keeps_referenced_entries() {
        let fx = fixture();
        let h = stored(&fx, 1);
        fx.authority.add_reference(OwnerId::from("bundle-a"), h);

        let report = collector(&fx, DataSweep::Immediate)
            .cleanup(&h, &BTreeSet::new(), false)
            .unwrap();
        assert!(report.actions.is_empty());
        assert_eq!(report.retained, 1);
        assert!(fx.layout.location_of(&h).exists());
    }

    #[test]
    fn cleanup_honors_excluded_owners() {
        let fx = fixture();
        let h = stored(&fx, 1);
        fx.authority.add_reference(OwnerId::from("bundle-a"), h);

        let gc = collector(&fx, DataSweep::Immediate);
        let dry = gc.cleanup(&h, &owners(&["bundle-a"]), true).unwrap();
        assert_eq!(dry.paths(GcArea::Data).count(), 1);
        assert!(!dry.actions[0].deleted);
        assert!(fx.layout.location_of(&h).exists());

        gc.cleanup(&h, &owners(&["bundle-a"]), false).unwrap();
        assert!(!fx.layout.location_of(&h).exists());
    }

    #[test]
    fn cleanup_of_absent_hash_is_a_no_op() {
        let fx = fixture();
        let report = collector(&fx, DataSweep::Immediate)
            .cleanup(&ContentHash::from_hash([9; 32]), &BTreeSet::new(), false)
            .unwrap();
        assert!(report.actions.is_empty() && report.is_clean());
    }

    #[test]
    fn immediate_sweep_deletes_exactly_the_unreferenced() {
        let fx = fixture();
        let live = stored(&fx, 1);
        let dead = stored(&fx, 2);
        fx.authority.add_reference(OwnerId::from("bundle-a"), live);

        let report = collector(&fx, DataSweep::Immediate).full_cleanup(false);
        assert!(fx.layout.location_of(&live).exists());
        assert!(!fx.layout.location_of(&dead).exists());
        assert_eq!(report.retained, 1);
        assert_eq!(
            report.paths(GcArea::Data).collect::<Vec<_>>(),
            vec![&fx.layout.location_of(&dead)]
        );
    }

    #[test]
    fn background_sweep_spares_fresh_entries() {
        let fx = fixture();
        let fresh = stored(&fx, 1);
        let old = stored(&fx, 2);
        age(&fx.layout.location_of(&old), 3600);

        collector(&fx, DataSweep::Background).full_cleanup(false);
        assert!(fx.layout.location_of(&fresh).exists());
        assert!(!fx.layout.location_of(&old).exists());
    }

    #[test]
    fn dry_run_deletes_nothing() {
        let fx = fixture();
        let h = stored(&fx, 1);
        let temp = fx.layout.temp_dir().join("abandoned");
        fs::create_dir(&temp).unwrap();
        age(&temp, 7200);

        let report = collector(&fx, DataSweep::Immediate).full_cleanup(true);
        assert!(report.dry_run);
        assert_eq!(report.actions.len(), 2);
        assert!(report.actions.iter().all(|a| !a.deleted));
        assert!(fx.layout.location_of(&h).exists());
        assert!(temp.exists());
    }

    #[test]
    fn temp_sweep_respects_window() {
        let fx = fixture();
        let old = fx.layout.temp_dir().join("old-upload");
        let young = fx.layout.temp_dir().join("young-upload");
        fs::create_dir(&old).unwrap();
        fs::create_dir(&young).unwrap();
        age(&old, 3601 + 60);
        age(&young, 60);

        let report = collector(&fx, DataSweep::Immediate).full_cleanup(false);
        assert!(!old.exists());
        assert!(young.exists());
        assert_eq!(report.paths(GcArea::Temp).collect::<Vec<_>>(), vec![&old]);
    }

    struct FailingAuthority;

    impl ReferenceAuthority for FailingAuthority {
        fn query_owners(&self, _: &ContentHash) -> StoreResult<BTreeSet<OwnerId>> {
            Err(StoreError::Authority("metadata store unreachable".into()))
        }
    }

    #[test]
    fn authority_failure_keeps_entries() {
        let fx = fixture();
        let h = stored(&fx, 1);
        let gc = GarbageCollector::new(
            fx.layout.clone(),
            Arc::new(FailingAuthority),
            &StoreConfig {
                data_sweep: DataSweep::Immediate,
                ..StoreConfig::new(fx.layout.root())
            },
        );
        let report = gc.full_cleanup(false);
        assert!(fx.layout.location_of(&h).exists());
        assert_eq!(report.failures.len(), 1);
        assert!(gc.cleanup(&h, &BTreeSet::new(), false).is_err());
    }

    /// Reports no owners, but a publisher refreshes the entry while the
    /// query is in flight.
    struct RefreshedDuringQuery {
        layout: StoreLayout,
    }

    impl ReferenceAuthority for RefreshedDuringQuery {
        fn query_owners(&self, hash: &ContentHash) -> StoreResult<BTreeSet<OwnerId>> {
            bstore_fs::touch(&self.layout.location_of(hash))?;
            Ok(BTreeSet::new())
        }
    }

    #[test]
    fn background_sweep_rechecks_age_before_deleting() {
        let fx = fixture();
        let h = stored(&fx, 1);
        age(&fx.layout.location_of(&h), 3600);
        let gc = GarbageCollector::new(
            fx.layout.clone(),
            Arc::new(RefreshedDuringQuery { layout: fx.layout.clone() }),
            &StoreConfig::new(fx.layout.root()),
        );

        let report = gc.full_cleanup(false);
        assert!(fx.layout.location_of(&h).exists());
        assert!(report.actions.is_empty());
        assert_eq!(report.retained, 1);
    }
}
